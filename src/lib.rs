//! # rudp - Reliable Message Transport over UDP
//!
//! A connection-oriented, channel-multiplexed message transport built on
//! unreliable datagrams, driven by Tokio. It provides TCP-like guarantees
//! (reliability, ordering, flow control) while keeping UDP's low latency
//! and message boundaries.
//!
//! ## Features
//!
//! - **Three delivery modes**: reliable/ordered, sequenced-unreliable
//!   (stale packets dropped), and unsequenced best-effort, selectable per
//!   packet across up to 255 independent channels per connection
//! - **Transparent fragmentation**: packets larger than the path MTU are
//!   split and reassembled automatically
//! - **Adaptive throttling**: unreliable traffic backs off on lossy or
//!   congested paths; reliable traffic is delayed, never dropped
//! - **Single-threaded polling model**: no background tasks; the protocol
//!   advances only when the application calls `service`
//! - **Zero-copy buffers** via the `bytes` crate
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rudp_tokio::{Event, Host, HostConfig, Packet};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HostConfig::new().peer_limit(64).channel_limit(2);
//!     let mut host = Host::bind("127.0.0.1:7500", config).await?;
//!
//!     loop {
//!         match host.service(Duration::from_millis(10)).await? {
//!             Some(Event::Connect { peer, .. }) => {
//!                 host.send(peer, 0, Packet::reliable(&b"welcome"[..])).await?;
//!             }
//!             Some(Event::Receive { packet, .. }) => {
//!                 println!("received {} bytes", packet.len());
//!             }
//!             Some(Event::Disconnect { .. }) | Some(Event::Timeout { .. }) => {}
//!             None => {}
//!         }
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │   Application        │  service() / check_events() polling
//! ├──────────────────────┤
//! │   Host (this crate)  │  clock, socket pump, event surface
//! ├──────────────────────┤
//! │   rudp-core          │  peers, channels, retransmission
//! ├──────────────────────┤
//! │   Datagram transport │  tokio UDP socket (or custom)
//! └──────────────────────┘
//! ```

pub mod error;
pub mod host;
pub mod metrics;
pub mod transport;

pub use error::{Result, RudpError};
pub use host::Host;
pub use transport::{Datagram, UdpDatagram};

// Core protocol surface
pub use rudp_core::{
    CoreError, Event, HostConfig, HostStats, Packet, PeerId, PeerState, PeerStats,
    PACKET_FLAG_INSTANT, PACKET_FLAG_RELIABLE, PACKET_FLAG_UNRELIABLE_FRAGMENTED,
    PACKET_FLAG_UNSEQUENCED, PACKET_FLAG_UNTHROTTLED,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
