#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod actor;
#[cfg(feature = "async")]
pub mod async_dht;
pub mod client;
mod common;
mod dht;
pub mod rpc;
pub mod storage;

pub use crate::common::{messages, DecodeError, Id, InvalidIdError, Peer, RoutingTable};
pub use bytes::Bytes;
pub use client::{ChunkClient, ChunkRef};
pub use dht::{Dht, DhtBuilder, DhtError, DhtWasShutdown, Testnet};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
