//! Configuration for the host engine

use crate::error::{CoreError, CoreResult};
use crate::protocol::constants::*;

/// Default MTU assumed until the handshake negotiates one.
pub const HOST_DEFAULT_MTU: u32 = 1280;
/// Upper bound on a single application packet.
pub const HOST_DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
/// Upper bound on per-peer data queued for the application but not yet read.
pub const HOST_DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;

/// Protocol-only host configuration.
///
/// Contains only what the engine reads; socket and runtime settings live in
/// the transport layer above.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Maximum simultaneous connections (hard cap 4095)
    pub peer_limit: usize,
    /// Maximum channels granted to a new connection (hard cap 255)
    pub channel_limit: usize,
    /// Incoming bandwidth cap in bytes/sec, 0 = unlimited
    pub incoming_bandwidth: u32,
    /// Outgoing bandwidth cap in bytes/sec, 0 = unlimited
    pub outgoing_bandwidth: u32,
    /// Assumed MTU before negotiation
    pub mtu: u32,
    /// Largest application packet accepted for send or reassembly
    pub maximum_packet_size: usize,
    /// Largest amount of received data a peer may hold undelivered
    pub maximum_waiting_data: usize,
    /// Connections allowed from one address before further ones are refused
    pub max_duplicate_peers: usize,
    /// Seed for connect-id generation; the transport layer mixes clock
    /// entropy into it, tests fix it for reproducibility
    pub seed: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_limit: 32,
            channel_limit: PROTOCOL_MAXIMUM_CHANNEL_COUNT,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: HOST_DEFAULT_MTU,
            maximum_packet_size: HOST_DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: HOST_DEFAULT_MAXIMUM_WAITING_DATA,
            max_duplicate_peers: PROTOCOL_MAXIMUM_PEER_ID as usize,
            seed: 0x6c078965,
        }
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum simultaneous connection count.
    pub fn peer_limit(mut self, limit: usize) -> Self {
        self.peer_limit = limit;
        self
    }

    /// Set the channel limit granted to new connections.
    pub fn channel_limit(mut self, limit: usize) -> Self {
        self.channel_limit = limit;
        self
    }

    /// Set incoming/outgoing bandwidth caps in bytes per second (0 = unlimited).
    pub fn bandwidth(mut self, incoming: u32, outgoing: u32) -> Self {
        self.incoming_bandwidth = incoming;
        self.outgoing_bandwidth = outgoing;
        self
    }

    /// Set the pre-negotiation MTU.
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the largest accepted application packet.
    pub fn maximum_packet_size(mut self, size: usize) -> Self {
        self.maximum_packet_size = size;
        self
    }

    /// Set the undelivered-data cap per peer.
    pub fn maximum_waiting_data(mut self, size: usize) -> Self {
        self.maximum_waiting_data = size;
        self
    }

    /// Set how many live connections one address may hold.
    pub fn max_duplicate_peers(mut self, count: usize) -> Self {
        self.max_duplicate_peers = count.max(1);
        self
    }

    /// Set the connect-id seed.
    pub fn seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.peer_limit == 0 || self.peer_limit > PROTOCOL_MAXIMUM_PEER_ID as usize {
            return Err(CoreError::config("peer limit must be between 1 and 4095"));
        }

        if self.channel_limit < PROTOCOL_MINIMUM_CHANNEL_COUNT
            || self.channel_limit > PROTOCOL_MAXIMUM_CHANNEL_COUNT
        {
            return Err(CoreError::config("channel limit must be between 1 and 255"));
        }

        if self.mtu < PROTOCOL_MINIMUM_MTU || self.mtu > PROTOCOL_MAXIMUM_MTU {
            return Err(CoreError::config("MTU must be between 576 and 4096"));
        }

        if self.maximum_packet_size == 0 {
            return Err(CoreError::config("maximum packet size must be non-zero"));
        }

        Ok(())
    }
}
