//! Error types for Framelink

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{RpcError, error_codes};

pub type LinkResult<T> = std::result::Result<T, LinkError>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{0}")]
    Endpoint(#[from] EndpointError),

    #[error("{0}")]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures visible to `request()`/`notify()` callers. Each variant names
/// the phase that failed so timeouts are diagnosable from the message
/// alone: no matcher, write failed, or no response in time.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("'{method}' failed: connection closed before a matcher could be registered")]
    Closed { method: String },

    #[error("'{method}' failed: write failed, the outbound queue is gone")]
    WriteFailed { method: String },

    #[error("'{method}' timed out after {timeout:?} with no response. The peer may be busy or unresponsive")]
    Timeout { method: String, timeout: Duration },

    /// The peer answered with an error response.
    #[error("{0}")]
    Rpc(RpcError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl EndpointError {
    pub fn error_code(&self) -> i32 {
        match self {
            Self::Closed { .. } | Self::WriteFailed { .. } => error_codes::CONNECTION_CLOSED,
            Self::Timeout { .. } => -32001,
            Self::Rpc(err) => err.code,
            Self::Protocol(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// True when the peer reported cooperative cancellation rather than a
    /// failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Rpc(err) if err.is_cancelled())
    }

    /// True for failures caused by the connection going away, where a
    /// caller holding a manager should expect a lazy respawn on next use.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::WriteFailed { .. })
    }
}

impl From<RpcError> for EndpointError {
    fn from(err: RpcError) -> Self {
        Self::Rpc(err)
    }
}

/// Failures while bringing up a managed child process. These degrade the
/// owning feature only; the manager converts them into a `None` client.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to start server: {0}")]
    Start(String),

    #[error("initialize handshake failed: {0}")]
    Handshake(#[from] EndpointError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_names_method_and_duration() {
        let err = EndpointError::Timeout {
            method: "host/sleep".to_string(),
            timeout: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("host/sleep"));
        assert!(msg.contains("5s"));
        assert!(!err.is_closed());
    }

    #[test]
    fn test_closed_and_write_failed_are_closed() {
        let closed = EndpointError::Closed {
            method: "ping".to_string(),
        };
        let write = EndpointError::WriteFailed {
            method: "ping".to_string(),
        };
        assert!(closed.is_closed());
        assert!(write.is_closed());
        assert_eq!(closed.error_code(), error_codes::CONNECTION_CLOSED);
    }

    #[test]
    fn test_cancelled_rpc_error_is_distinguished() {
        let err = EndpointError::Rpc(RpcError::cancelled("lint", "collect"));
        assert!(err.is_cancelled());
        assert_eq!(err.error_code(), error_codes::REQUEST_CANCELLED);

        let plain = EndpointError::Rpc(RpcError::internal_error("boom"));
        assert!(!plain.is_cancelled());
    }
}
