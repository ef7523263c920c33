use bytes::Bytes;

use crate::metadata::Metadata;
use crate::method::RpcKind;
use crate::status::Status;

/// Logical parts flowing from client to server on one call: exactly one
/// leading metadata block followed by zero or more serialized messages.
#[derive(Debug, Clone)]
pub enum RequestPart {
    Metadata(Metadata),
    Message(Bytes),
}

/// Logical parts flowing from server to client: at most one leading
/// metadata block, zero or more serialized messages, and exactly one
/// terminal status.
#[derive(Debug, Clone)]
pub enum ResponsePart {
    Metadata(Metadata),
    Message(Bytes),
    Status(Status),
}

/// Per-direction part ordering states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosed,
    Closed,
}

/// Enforces the legal part ordering on one direction of a call: leading
/// metadata opens the direction, messages may only flow while open, and the
/// direction closes on sender close or terminal status.
#[derive(Debug)]
pub struct DirectionState {
    state: StreamState,
}

impl Default for DirectionState {
    fn default() -> Self {
        DirectionState::new()
    }
}

impl DirectionState {
    pub fn new() -> Self {
        DirectionState {
            state: StreamState::Idle,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// A leading metadata block was sent or received.
    pub fn on_metadata(&mut self) -> Result<(), Status> {
        match self.state {
            StreamState::Idle => {
                self.state = StreamState::Open;
                Ok(())
            }
            _ => Err(Status::internal(
                "protocol violation: metadata block after the stream was opened",
            )),
        }
    }

    /// A message part was sent or received.
    pub fn on_message(&mut self) -> Result<(), Status> {
        match self.state {
            StreamState::Open => Ok(()),
            StreamState::Idle => Err(Status::internal(
                "protocol violation: message part before leading metadata",
            )),
            StreamState::HalfClosed | StreamState::Closed => Err(Status::internal(
                "protocol violation: message part after the stream was closed",
            )),
        }
    }

    /// The sender closed its side without a status (request direction).
    pub fn on_half_close(&mut self) -> Result<(), Status> {
        match self.state {
            StreamState::Open => {
                self.state = StreamState::HalfClosed;
                Ok(())
            }
            _ => Err(Status::internal(
                "protocol violation: close on a stream that was not open",
            )),
        }
    }

    /// A terminal status was sent or received (response direction). A status
    /// straight from `Idle` is the trailers-only shape.
    pub fn on_status(&mut self) -> Result<(), Status> {
        match self.state {
            StreamState::Idle | StreamState::Open | StreamState::HalfClosed => {
                self.state = StreamState::Closed;
                Ok(())
            }
            StreamState::Closed => Err(Status::internal(
                "protocol violation: second terminal status",
            )),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }
}

impl RpcKind {
    /// Whether `count` request messages is legal for this call shape.
    pub fn valid_request_count(self, count: usize) -> bool {
        match self {
            RpcKind::Unary | RpcKind::ServerStreaming => count == 1,
            RpcKind::ClientStreaming | RpcKind::Bidi => true,
        }
    }

    /// Whether `count` response messages is legal for a successful call of
    /// this shape.
    pub fn valid_response_count(self, count: usize) -> bool {
        match self {
            RpcKind::Unary | RpcKind::ClientStreaming => count == 1,
            RpcKind::ServerStreaming | RpcKind::Bidi => true,
        }
    }
}
