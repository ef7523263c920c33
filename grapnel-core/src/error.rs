use std::fmt;

use crate::status::Status;
use crate::transport::TransportError;

/// All error types produced by the call runtime.
#[derive(Debug)]
pub enum RpcError {
    /// The call terminated with a non-OK gRPC status.
    Status(Status),

    /// An invalid argument was provided (e.g. a malformed method name).
    InvalidArgument(String),

    /// The transport failed before the call could be started.
    Transport(TransportError),

    /// Any other error.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl RpcError {
    /// The terminal status, if the call got far enough to produce one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            RpcError::Status(status) => Some(status),
            _ => None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Status(status) => {
                write!(f, "gRPC error: {} - {}", status.code(), status.message())
            }
            RpcError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            RpcError::Transport(err) => write!(f, "transport error: {err}"),
            RpcError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Status(status) => Some(status),
            RpcError::Transport(err) => Some(err),
            RpcError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        RpcError::Status(status)
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        RpcError::Transport(err)
    }
}

/// Convenience type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
