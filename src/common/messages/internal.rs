use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::Peer;

/// The control channel envelope exactly as it travels on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DhtMessage {
    pub magic: u32,

    #[serde(rename = "type")]
    pub message_type: String,

    pub params: Map<String, Value>,

    pub requester: Peer,

    #[serde(default)]
    pub resp: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fields read before schema validation, so a malformed message can still be
/// answered (or ignored) correctly.
#[derive(Debug, Clone, Copy)]
pub struct Preamble {
    pub magic: Option<u32>,
    pub resp: bool,
}

impl Preamble {
    pub fn read(object: &Map<String, Value>) -> Self {
        Preamble {
            magic: object
                .get("magic")
                .and_then(Value::as_u64)
                .and_then(|magic| u32::try_from(magic).ok()),
            resp: object.get("resp").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

pub const PING_NODE: &str = "ping_node";
pub const PING_NODES: &str = "ping_nodes";
pub const STORE_VALUE: &str = "store_value";
pub const FIND_NODE: &str = "find_node";
pub const FIND_VALUE: &str = "find_value";

pub const STORE_ACK: &str = "saved";
