//! Error types for the Tokio-driven transport layer

use rudp_core::CoreError;
use thiserror::Error;

/// Result type for host operations
pub type Result<T> = std::result::Result<T, RudpError>;

/// Errors surfaced by the async host.
///
/// Protocol-level conditions (peer timeouts, remote disconnects) are not
/// errors; they arrive as events from [`Host::service`](crate::Host::service).
#[derive(Error, Debug)]
pub enum RudpError {
    /// I/O related errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rejections from the protocol engine
    #[error(transparent)]
    Engine(#[from] CoreError),

    /// A bounded wait elapsed without the expected outcome
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Host lifecycle errors (bad bind address, closed transport)
    #[error("Host error: {message}")]
    Host { message: String },
}

impl RudpError {
    /// Create a host lifecycle error
    pub fn host(message: impl Into<String>) -> Self {
        RudpError::Host {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        RudpError::Timeout { timeout_ms }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        match self {
            RudpError::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                )
            }
            RudpError::Timeout { .. } => true,
            RudpError::Engine(e) => {
                matches!(e, CoreError::PeerLimitReached | CoreError::NotConnected)
            }
            _ => false,
        }
    }

    /// Check if this error indicates the endpoint is unusable
    pub fn is_closed(&self) -> bool {
        match self {
            RudpError::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::UnexpectedEof
                )
            }
            RudpError::Host { .. } => true,
            _ => false,
        }
    }
}
