//! UDP socket layer managing incoming/outgoing requests and responses.

mod inflight_requests;

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, trace};

use crate::common::{
    DecodeError, ErrorSpecific, Message, MessageType, Peer, RequestSpecific, ResponseSpecific,
};

pub use inflight_requests::{InflightRequest, InflightRequests};

/// Largest UDP payload.
const MTU: usize = 65_535;

/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A UdpSocket wrapper that formats and correlates control channel requests and responses.
#[derive(Debug)]
pub struct ControlSocket {
    socket: UdpSocket,
    /// This node's descriptor, stamped as `requester` on every outgoing message.
    local: Peer,
    request_timeout: Duration,
    inflight_requests: InflightRequests,
}

/// A message read from the socket that the engine has to act on.
#[derive(Debug)]
pub enum Incoming {
    Request {
        message: Message,
        from: SocketAddr,
    },
    /// A response (or error) to a request still inflight, which is now removed.
    Response {
        message: Message,
        request: InflightRequest,
    },
}

impl ControlSocket {
    /// Wrap an already bound socket, switching it to non-blocking mode.
    pub fn new(
        socket: UdpSocket,
        local: Peer,
        request_timeout: Duration,
    ) -> Result<Self, std::io::Error> {
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            local,
            request_timeout,
            inflight_requests: InflightRequests::new(),
        })
    }

    // === Getters ===

    /// Returns the address the socket is bound to.
    #[cfg(test)]
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Returns this node's advertised descriptor.
    pub fn local(&self) -> &Peer {
        &self.local
    }

    // === Public Methods ===

    /// Returns true if this magic is still inflight.
    #[cfg(test)]
    pub fn inflight(&self, magic: u32) -> bool {
        self.inflight_requests.contains(magic)
    }

    /// Send a request to the given peer and return its magic.
    ///
    /// The request is only recorded as inflight if sending succeeded.
    pub fn request(&mut self, to: &Peer, request: RequestSpecific) -> Result<u32, SendMessageError> {
        let magic = self.magic();

        let message = Message {
            magic,
            requester: self.local.clone(),
            message_type: MessageType::Request(request),
        };

        self.send(to.address(), &message)?;
        self.inflight_requests.add(magic, to.clone());

        Ok(magic)
    }

    /// Send a response to the given address.
    pub fn response(&mut self, address: SocketAddr, magic: u32, response: ResponseSpecific) {
        let message = Message {
            magic,
            requester: self.local.clone(),
            message_type: MessageType::Response(response),
        };

        let _ = self.send(address, &message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Send an error to the given address.
    pub fn error(&mut self, address: SocketAddr, magic: u32, error: ErrorSpecific) {
        let message = Message {
            magic,
            requester: self.local.clone(),
            message_type: MessageType::Error(error),
        };

        let _ = self.send(address, &message).map_err(|e| {
            debug!(?e, "Error sending error message");
        });
    }

    /// Remove and return every request that timed out without a response.
    pub fn expired(&mut self) -> Vec<InflightRequest> {
        self.inflight_requests.cleanup(self.request_timeout)
    }

    /// Receives a single message on the socket.
    ///
    /// Malformed datagrams, unexpected responses and late responses are
    /// dropped here. Malformed requests get an error response.
    pub fn recv_from(&mut self) -> Option<Incoming> {
        let mut buf = vec![0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, from)) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Response from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => match message.message_type {
                        MessageType::Request(_) => {
                            trace!(
                                context = "socket_message_receiving",
                                ?message,
                                ?from,
                                "Received request message"
                            );

                            return Some(Incoming::Request { message, from });
                        }
                        MessageType::Response(_) | MessageType::Error(_) => {
                            trace!(
                                context = "socket_message_receiving",
                                ?message,
                                ?from,
                                "Received response message"
                            );

                            if let Some(request) = self.inflight_requests.remove(message.magic, &from)
                            {
                                return Some(Incoming::Response { message, request });
                            }

                            trace!(
                                context = "socket_validation",
                                magic = message.magic,
                                ?from,
                                "Unexpected, duplicate or late response"
                            );
                        }
                    },
                    Err(DecodeError::Invalid {
                        magic,
                        resp: false,
                        message_type,
                        reason,
                    }) => {
                        debug!(
                            context = "socket_validation",
                            ?from,
                            ?reason,
                            "Received invalid request"
                        );

                        self.error(
                            from,
                            magic.unwrap_or_default(),
                            ErrorSpecific {
                                request_type: message_type.unwrap_or_default(),
                                description: reason,
                            },
                        );
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid message"
                        );
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                trace!(
                    context = "socket_error",
                    ?e,
                    "recv_from failed unexpectedly"
                );
            }
        }

        None
    }

    // === Private Methods ===

    /// Random magic, unique among inflight requests.
    fn magic(&self) -> u32 {
        loop {
            let magic = rand::random::<u32>();

            if !self.inflight_requests.contains(magic) {
                return magic;
            }
        }
    }

    fn send(&mut self, address: SocketAddr, message: &Message) -> Result<(), SendMessageError> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", ?message, ?address);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors sending a control channel message.
pub enum SendMessageError {
    /// Errors serializing the message.
    #[error("Failed to serialize message: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}
