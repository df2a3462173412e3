//! Pure synchronous engine for a connection-oriented, channel-multiplexed
//! reliable message transport over unreliable datagrams.
//!
//! This crate implements the full protocol state machine with zero runtime
//! dependencies — no sockets, no async, no internal clock. It only depends
//! on `bytes` and `tracing`.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  rudp-core                   │
//! │                              │
//! │  protocol  ← wire format     │
//! │  packet    ← delivery modes  │
//! │  channel   ← ordering        │
//! │  peer      ← state machine   │
//! │  host      ← service engine  │
//! │  config    ← tuning          │
//! │  error     ← rejections      │
//! └──────────────────────────────┘
//! ```
//!
//! The engine is driven sans-I/O: the caller feeds received datagrams into
//! [`HostEngine::input`], ticks timers with [`HostEngine::update`], sends
//! whatever [`HostEngine::drain_outgoing`] yields, and polls
//! [`HostEngine::poll_event`] for connects, disconnects, timeouts, and
//! received packets. All timestamps are caller-supplied milliseconds, so
//! the whole protocol is deterministic under test.

pub mod config;
pub mod error;
pub mod host;
pub mod packet;
pub mod protocol;

mod channel;
mod peer;

pub use config::HostConfig;
pub use error::{CoreError, CoreResult};
pub use host::{Event, HostEngine, HostStats};
pub use packet::{
    Packet, PACKET_FLAG_INSTANT, PACKET_FLAG_RELIABLE, PACKET_FLAG_UNRELIABLE_FRAGMENTED,
    PACKET_FLAG_UNSEQUENCED, PACKET_FLAG_UNTHROTTLED,
};
pub use peer::{
    PeerId, PeerState, PeerStats, PEER_PING_INTERVAL, PEER_TIMEOUT_LIMIT, PEER_TIMEOUT_MAXIMUM,
    PEER_TIMEOUT_MINIMUM,
};
