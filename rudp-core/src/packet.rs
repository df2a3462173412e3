//! Application packets and delivery-mode flags

use bytes::Bytes;

/// Guaranteed, ordered delivery with retransmission.
pub const PACKET_FLAG_RELIABLE: u32 = 1 << 0;
/// No sequencing at all; may arrive out of order or duplicated.
pub const PACKET_FLAG_UNSEQUENCED: u32 = 1 << 1;
/// Allow an oversized unreliable packet to be fragmented instead of
/// silently promoted to reliable delivery.
pub const PACKET_FLAG_UNRELIABLE_FRAGMENTED: u32 = 1 << 3;
/// Flush the host's send queue immediately after this packet is queued.
pub const PACKET_FLAG_INSTANT: u32 = 1 << 4;
/// Exempt from the unreliable-traffic throttle.
pub const PACKET_FLAG_UNTHROTTLED: u32 = 1 << 5;

/// An immutable application payload plus delivery-mode flags.
///
/// The payload is a [`Bytes`] buffer, so cloning a packet for each of its
/// in-flight fragments shares one allocation; the buffer is released when
/// the last clone (including every unacknowledged fragment) is dropped.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub flags: u32,
}

impl Packet {
    /// Create a packet with explicit flags.
    pub fn new(data: impl Into<Bytes>, flags: u32) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }

    /// Guaranteed, ordered delivery.
    pub fn reliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, PACKET_FLAG_RELIABLE)
    }

    /// Sequenced best-effort delivery: late and duplicate packets are
    /// dropped by the receiver, nothing is retransmitted.
    pub fn unreliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, 0)
    }

    /// Completely unordered best-effort delivery.
    pub fn unsequenced(data: impl Into<Bytes>) -> Self {
        Self::new(data, PACKET_FLAG_UNSEQUENCED)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_reliable(&self) -> bool {
        self.flags & PACKET_FLAG_RELIABLE != 0
    }

    pub fn is_unsequenced(&self) -> bool {
        self.flags & PACKET_FLAG_UNSEQUENCED != 0
    }
}
