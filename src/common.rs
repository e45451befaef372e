//! Miscellaneous common structs used throughout the library.

mod closest_peers;
mod id;
pub mod messages;
mod peer;
mod routing_table;

pub use closest_peers::*;
pub use id::*;
pub use messages::*;
pub use peer::*;
pub use routing_table::*;
