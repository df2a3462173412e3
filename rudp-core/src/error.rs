//! Error types for the core protocol engine

use std::fmt;

/// Result type for core engine operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Error types produced by the protocol engine.
///
/// Everything here is rejected before any state change; transient network
/// conditions (loss, reordering, duplication) are handled internally and
/// never surface as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Configuration rejected during host creation
    Config { message: String },
    /// No free peer slot is available for a new connection
    PeerLimitReached,
    /// The peer handle is stale or was never issued by this host
    InvalidPeer,
    /// Channel id is outside the peer's negotiated channel count
    InvalidChannel,
    /// Packet exceeds the host's maximum packet size
    PacketTooLarge,
    /// Packet would fragment into more pieces than the protocol allows
    TooManyFragments,
    /// Operation requires the peer to be in the connected state
    NotConnected,
}

impl CoreError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        CoreError::Config {
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Config { message } => write!(f, "Configuration error: {message}"),
            CoreError::PeerLimitReached => write!(f, "No free peer slot available"),
            CoreError::InvalidPeer => write!(f, "Invalid or stale peer handle"),
            CoreError::InvalidChannel => write!(f, "Channel id out of range"),
            CoreError::PacketTooLarge => write!(f, "Packet exceeds maximum packet size"),
            CoreError::TooManyFragments => write!(f, "Packet exceeds maximum fragment count"),
            CoreError::NotConnected => write!(f, "Peer is not connected"),
        }
    }
}

impl std::error::Error for CoreError {}
