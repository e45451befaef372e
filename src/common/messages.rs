//! Serialize and deserialize control channel messages.
//!
//! On the wire a message is a single JSON object (see [internal::DhtMessage]);
//! everything past this module only deals with the typed [Message].

mod internal;

use serde_json::{Map, Value};

use crate::common::{Id, Peer};

use internal::{DhtMessage, Preamble};

pub use internal::{FIND_NODE, FIND_VALUE, PING_NODE, PING_NODES, STORE_VALUE};

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Random correlation token binding a response to its request.
    pub magic: u32,

    /// The sender of this message: the requester of a request, the responder of a response.
    pub requester: Peer,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    /// The `type` of the message this error answers, verbatim.
    pub request_type: String,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestSpecific {
    Ping,
    StoreValue(StoreValueRequestArguments),
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    Ping(PingResponseArguments),
    StoreValue,
    FindNode(FindNodeResponseArguments),
    FindValue(FindValueResponseArguments),
}

// === PING ===

#[derive(Debug, PartialEq, Clone)]
pub struct PingResponseArguments {
    pub responder: Peer,
}

// === STORE_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct StoreValueRequestArguments {
    pub id: Id,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub nodes: Vec<Peer>,
}

// === FIND_VALUE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindValueRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub enum FindValueResponseArguments {
    /// The responder holds the value.
    Holder(Peer),
    /// Closer peers to continue the search with.
    Closer(Vec<Peer>),
}

impl RequestSpecific {
    pub fn message_type(&self) -> &'static str {
        match self {
            RequestSpecific::Ping => PING_NODE,
            RequestSpecific::StoreValue(_) => STORE_VALUE,
            RequestSpecific::FindNode(_) => FIND_NODE,
            RequestSpecific::FindValue(_) => FIND_VALUE,
        }
    }
}

impl ResponseSpecific {
    pub fn message_type(&self) -> &'static str {
        match self {
            ResponseSpecific::Ping(_) => PING_NODE,
            ResponseSpecific::StoreValue => STORE_VALUE,
            ResponseSpecific::FindNode(_) => FIND_NODE,
            ResponseSpecific::FindValue(_) => FIND_VALUE,
        }
    }
}

impl Message {
    pub fn is_response(&self) -> bool {
        !matches!(self.message_type, MessageType::Request(_))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.clone().into_serde_message()?)
    }

    /// Parse and validate a datagram.
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, DecodeError> {
        let value: Value = serde_json::from_slice(bytes.as_ref())?;

        let object = match value {
            Value::Object(object) => object,
            _ => return Err(DecodeError::NotAnObject),
        };

        let preamble = Preamble::read(&object);
        let invalid = |reason: String| DecodeError::Invalid {
            magic: preamble.magic,
            resp: preamble.resp,
            message_type: object
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_string),
            reason,
        };

        let message: DhtMessage =
            serde_json::from_value(Value::Object(object.clone())).map_err(|e| invalid(e.to_string()))?;

        Message::from_serde_message(message).map_err(invalid)
    }

    fn into_serde_message(self) -> Result<DhtMessage, serde_json::Error> {
        let mut params = Map::new();
        let mut result = None;
        let mut error = None;

        let (message_type, resp) = match self.message_type {
            MessageType::Request(request) => {
                match &request {
                    RequestSpecific::Ping => {}
                    RequestSpecific::StoreValue(StoreValueRequestArguments { id: target })
                    | RequestSpecific::FindNode(FindNodeRequestArguments { target })
                    | RequestSpecific::FindValue(FindValueRequestArguments { target }) => {
                        params.insert("id".to_string(), Value::String(target.to_hex()));
                    }
                };

                (request.message_type().to_string(), false)
            }
            MessageType::Response(response) => {
                let message_type = response.message_type().to_string();

                result = Some(match response {
                    ResponseSpecific::Ping(PingResponseArguments { responder }) => {
                        serde_json::to_value(responder)?
                    }
                    ResponseSpecific::StoreValue => Value::String(internal::STORE_ACK.to_string()),
                    ResponseSpecific::FindNode(FindNodeResponseArguments { nodes })
                    | ResponseSpecific::FindValue(FindValueResponseArguments::Closer(nodes)) => {
                        serde_json::to_value(nodes)?
                    }
                    ResponseSpecific::FindValue(FindValueResponseArguments::Holder(holder)) => {
                        serde_json::to_value(holder)?
                    }
                });

                (message_type, true)
            }
            MessageType::Error(ErrorSpecific {
                request_type,
                description,
            }) => {
                error = Some(description);

                (request_type, true)
            }
        };

        Ok(DhtMessage {
            magic: self.magic,
            message_type,
            params,
            requester: self.requester,
            resp,
            result,
            error,
        })
    }

    fn from_serde_message(message: DhtMessage) -> Result<Message, String> {
        let message_type = if let Some(description) = message.error {
            MessageType::Error(ErrorSpecific {
                request_type: message.message_type,
                description,
            })
        } else if message.resp {
            let result = message
                .result
                .ok_or_else(|| format!("{} response without a result", message.message_type))?;

            MessageType::Response(decode_result(&message.message_type, result)?)
        } else {
            MessageType::Request(decode_request(&message.message_type, &message.params)?)
        };

        Ok(Message {
            magic: message.magic,
            requester: message.requester,
            message_type,
        })
    }
}

fn decode_request(message_type: &str, params: &Map<String, Value>) -> Result<RequestSpecific, String> {
    let target = || -> Result<Id, String> {
        let id = params
            .get("id")
            .ok_or_else(|| "missing field `params.id`".to_string())?;

        serde_json::from_value(id.clone()).map_err(|e| format!("invalid `params.id`: {e}"))
    };

    Ok(match message_type {
        PING_NODE | PING_NODES => RequestSpecific::Ping,
        STORE_VALUE => RequestSpecific::StoreValue(StoreValueRequestArguments { id: target()? }),
        FIND_NODE => RequestSpecific::FindNode(FindNodeRequestArguments { target: target()? }),
        FIND_VALUE => RequestSpecific::FindValue(FindValueRequestArguments { target: target()? }),
        other => return Err(format!("unknown message type `{other}`")),
    })
}

fn decode_result(message_type: &str, result: Value) -> Result<ResponseSpecific, String> {
    let invalid = |e: serde_json::Error| format!("invalid {message_type} result: {e}");

    Ok(match message_type {
        PING_NODE | PING_NODES => ResponseSpecific::Ping(PingResponseArguments {
            responder: serde_json::from_value(result).map_err(invalid)?,
        }),
        STORE_VALUE => ResponseSpecific::StoreValue,
        FIND_NODE => ResponseSpecific::FindNode(FindNodeResponseArguments {
            nodes: serde_json::from_value(result).map_err(invalid)?,
        }),
        FIND_VALUE => ResponseSpecific::FindValue(match result {
            Value::Array(_) => {
                FindValueResponseArguments::Closer(serde_json::from_value(result).map_err(invalid)?)
            }
            _ => FindValueResponseArguments::Holder(serde_json::from_value(result).map_err(invalid)?),
        }),
        other => return Err(format!("unknown message type `{other}`")),
    })
}

#[derive(thiserror::Error, Debug)]
/// Errors decoding a control channel datagram.
pub enum DecodeError {
    /// Not parseable as JSON at all.
    #[error("Failed to parse message: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON, but not an object.
    #[error("Message is not a JSON object")]
    NotAnObject,

    /// A JSON object that doesn't match the envelope schema.
    #[error("Invalid message: {reason}")]
    Invalid {
        magic: Option<u32>,
        resp: bool,
        message_type: Option<String>,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use serde_json::json;

    use super::*;

    fn requester() -> Peer {
        Peer::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], 4500)))
    }

    #[test]
    fn find_node_request_wire_shape() {
        let requester = requester();
        let target = Id::random();

        let message = Message {
            magic: 77,
            requester: requester.clone(),
            message_type: MessageType::Request(RequestSpecific::FindNode(
                FindNodeRequestArguments { target },
            )),
        };

        let value: Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "magic": 77,
                "type": "find_node",
                "params": {"id": target.to_string()},
                "requester": {"node_id": requester.id().to_string(), "ip": "127.0.0.1", "port": 4500},
                "resp": false,
            })
        );

        assert_eq!(Message::from_bytes(value.to_string()).unwrap(), message);
    }

    #[test]
    fn find_value_result_shapes() {
        let holder = requester();
        let closer = vec![requester(), requester()];

        for result in [
            FindValueResponseArguments::Holder(holder.clone()),
            FindValueResponseArguments::Closer(closer.clone()),
        ] {
            let message = Message {
                magic: 1,
                requester: holder.clone(),
                message_type: MessageType::Response(ResponseSpecific::FindValue(result)),
            };

            let decoded = Message::from_bytes(message.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn store_response_is_an_opaque_ack() {
        let bytes = json!({
            "magic": 3,
            "type": "store_value",
            "params": {},
            "requester": requester(),
            "resp": true,
            "result": "saved"
        })
        .to_string();

        let message = Message::from_bytes(bytes).unwrap();

        assert_eq!(
            message.message_type,
            MessageType::Response(ResponseSpecific::StoreValue)
        );
    }

    #[test]
    fn ping_nodes_alias() {
        let bytes = json!({
            "magic": 9,
            "type": "ping_nodes",
            "params": {},
            "requester": requester(),
        })
        .to_string();

        let message = Message::from_bytes(bytes).unwrap();

        assert_eq!(message.message_type, MessageType::Request(RequestSpecific::Ping));
    }

    #[test]
    fn non_object_payloads() {
        assert!(matches!(
            Message::from_bytes(b"not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            Message::from_bytes(b"[1, 2, 3]"),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn missing_fields_are_invalid() {
        let bytes = json!({"magic": 12, "type": "find_node", "params": {"id": Id::random()}}).to_string();

        match Message::from_bytes(bytes) {
            Err(DecodeError::Invalid {
                magic,
                resp,
                reason,
                ..
            }) => {
                assert_eq!(magic, Some(12));
                assert!(!resp);
                assert!(reason.contains("requester"));
            }
            other => panic!("expected invalid message, got {other:?}"),
        }

        let bytes = json!({
            "magic": 12,
            "type": "find_node",
            "params": {"id": "deadbeef"},
            "requester": requester(),
        })
        .to_string();

        assert!(matches!(
            Message::from_bytes(bytes),
            Err(DecodeError::Invalid { .. })
        ));
    }

    #[test]
    fn unknown_type() {
        let bytes = json!({
            "magic": 5,
            "type": "delete_everything",
            "params": {},
            "requester": requester(),
        })
        .to_string();

        match Message::from_bytes(bytes) {
            Err(DecodeError::Invalid { message_type, .. }) => {
                assert_eq!(message_type.as_deref(), Some("delete_everything"))
            }
            other => panic!("expected invalid message, got {other:?}"),
        }
    }

    #[test]
    fn response_without_result() {
        let bytes = json!({
            "magic": 5,
            "type": "find_node",
            "params": {},
            "requester": requester(),
            "resp": true,
        })
        .to_string();

        assert!(matches!(
            Message::from_bytes(bytes),
            Err(DecodeError::Invalid { resp: true, .. })
        ));
    }

    #[test]
    fn error_response() {
        let message = Message {
            magic: 8,
            requester: requester(),
            message_type: MessageType::Error(ErrorSpecific {
                request_type: "mystery".to_string(),
                description: "unknown message type `mystery`".to_string(),
            }),
        };

        let value: Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(value["resp"], json!(true));
        assert!(value.get("result").is_none());
        assert_eq!(Message::from_bytes(value.to_string()).unwrap(), message);
    }
}
