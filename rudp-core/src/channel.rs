//! Per-connection channel state: sequencing, reliable windows, and the
//! in-order release of received commands to the application.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::packet::Packet;
use crate::protocol::constants::*;
use crate::protocol::SeqNum;

/// Reliable sequence space is split into windows so the sender can stall
/// instead of wrapping into sequence numbers the receiver still buffers.
pub(crate) const PEER_RELIABLE_WINDOWS: u16 = 16;
pub(crate) const PEER_RELIABLE_WINDOW_SIZE: u16 = 0x1000;
pub(crate) const PEER_FREE_RELIABLE_WINDOWS: u16 = 8;

/// Payload of a received command: either a complete buffer sliced out of a
/// datagram, or a fragment reassembly in progress.
#[derive(Debug)]
pub(crate) enum IncomingPayload {
    Complete(Bytes),
    Assembling(BytesMut),
}

/// A received send command waiting for in-order release.
#[derive(Debug)]
pub(crate) struct IncomingCommand {
    /// Raw command byte (number plus flag bits)
    pub command: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: SeqNum,
    pub unreliable_sequence_number: SeqNum,
    pub fragment_count: u32,
    pub fragments_remaining: u32,
    /// Bitfield of received fragment numbers; empty when not fragmented
    pub fragments: Vec<u32>,
    pub payload: IncomingPayload,
    /// Flags for the packet eventually handed to the application
    pub packet_flags: u32,
}

impl IncomingCommand {
    pub(crate) fn number(&self) -> u8 {
        self.command & COMMAND_MASK
    }

    pub(crate) fn data_len(&self) -> usize {
        match &self.payload {
            IncomingPayload::Complete(data) => data.len(),
            IncomingPayload::Assembling(data) => data.len(),
        }
    }

    /// Whether fragment `number` has already been stored.
    pub(crate) fn has_fragment(&self, number: u32) -> bool {
        self.fragments[number as usize / 32] & (1 << (number % 32)) != 0
    }

    /// Record fragment `number` and copy its bytes into the reassembly
    /// buffer at `offset`.
    pub(crate) fn store_fragment(&mut self, number: u32, offset: usize, data: &[u8]) {
        self.fragments[number as usize / 32] |= 1 << (number % 32);
        self.fragments_remaining -= 1;

        if let IncomingPayload::Assembling(buffer) = &mut self.payload {
            let end = (offset + data.len()).min(buffer.len());

            if offset < end {
                buffer[offset..end].copy_from_slice(&data[..end - offset]);
            }
        }
    }

    pub(crate) fn into_packet(self) -> Packet {
        let data = match self.payload {
            IncomingPayload::Complete(data) => data,
            IncomingPayload::Assembling(buffer) => buffer.freeze(),
        };

        Packet::new(data, self.packet_flags)
    }
}

/// Where a freshly received command should be placed, if anywhere.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Stale, duplicate, or outside the free window: drop silently
    Discard,
    /// Insert into the reliable pending queue at this index
    Reliable(usize),
    /// Insert into the unreliable pending queue at this index
    Unreliable(usize),
}

/// One ordered sub-stream of a connection.
#[derive(Debug)]
pub(crate) struct Channel {
    pub outgoing_reliable_sequence_number: SeqNum,
    pub outgoing_unreliable_sequence_number: SeqNum,
    /// Bitmask of reliable windows with unacknowledged commands in flight
    pub used_reliable_windows: u16,
    /// In-flight command count per reliable window
    pub reliable_windows: [u16; PEER_RELIABLE_WINDOWS as usize],
    pub incoming_reliable_sequence_number: SeqNum,
    pub incoming_unreliable_sequence_number: SeqNum,
    /// Out-of-order reliable commands awaiting their predecessors
    pub incoming_reliable_commands: Vec<IncomingCommand>,
    /// Unreliable and unsequenced commands awaiting release
    pub incoming_unreliable_commands: Vec<IncomingCommand>,
}

impl Channel {
    pub(crate) fn new() -> Self {
        Self {
            outgoing_reliable_sequence_number: 0,
            outgoing_unreliable_sequence_number: 0,
            used_reliable_windows: 0,
            reliable_windows: [0; PEER_RELIABLE_WINDOWS as usize],
            incoming_reliable_sequence_number: 0,
            incoming_unreliable_sequence_number: 0,
            incoming_reliable_commands: Vec::new(),
            incoming_unreliable_commands: Vec::new(),
        }
    }

    /// Is `sequence` inside the window span the receiver still accepts?
    pub(crate) fn in_free_window(&self, sequence: SeqNum) -> bool {
        let mut reliable_window = sequence / PEER_RELIABLE_WINDOW_SIZE;
        let current_window = self.incoming_reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE;

        if sequence < self.incoming_reliable_sequence_number {
            reliable_window += PEER_RELIABLE_WINDOWS;
        }

        reliable_window >= current_window
            && reliable_window < current_window + PEER_FREE_RELIABLE_WINDOWS - 1
    }

    /// Find where a reliable command belongs in the pending queue, scanning
    /// newest-first so the common in-order case exits immediately.
    pub(crate) fn place_reliable(&self, sequence: SeqNum) -> Placement {
        if sequence == self.incoming_reliable_sequence_number {
            return Placement::Discard;
        }

        let queue = &self.incoming_reliable_commands;
        let mut idx = queue.len();

        while idx > 0 {
            idx -= 1;
            let pending = &queue[idx];

            if sequence >= self.incoming_reliable_sequence_number {
                if pending.reliable_sequence_number < self.incoming_reliable_sequence_number {
                    continue;
                }
            } else if pending.reliable_sequence_number >= self.incoming_reliable_sequence_number {
                return Placement::Reliable(idx + 1);
            }

            if pending.reliable_sequence_number <= sequence {
                if pending.reliable_sequence_number < sequence {
                    return Placement::Reliable(idx + 1);
                }

                return Placement::Discard;
            }
        }

        Placement::Reliable(0)
    }

    /// Find where an unreliable command belongs, dropping stale and
    /// duplicate sequence numbers.
    pub(crate) fn place_unreliable(&self, reliable: SeqNum, unreliable: SeqNum) -> Placement {
        if reliable == self.incoming_reliable_sequence_number
            && unreliable <= self.incoming_unreliable_sequence_number
        {
            return Placement::Discard;
        }

        let queue = &self.incoming_unreliable_commands;
        let mut idx = queue.len();

        while idx > 0 {
            idx -= 1;
            let pending = &queue[idx];

            if pending.number() == COMMAND_SEND_UNSEQUENCED {
                continue;
            }

            if reliable >= self.incoming_reliable_sequence_number {
                if pending.reliable_sequence_number < self.incoming_reliable_sequence_number {
                    continue;
                }
            } else if pending.reliable_sequence_number >= self.incoming_reliable_sequence_number {
                return Placement::Unreliable(idx + 1);
            }

            if pending.reliable_sequence_number < reliable {
                return Placement::Unreliable(idx + 1);
            }

            if pending.reliable_sequence_number > reliable {
                continue;
            }

            if pending.unreliable_sequence_number <= unreliable {
                if pending.unreliable_sequence_number < unreliable {
                    return Placement::Unreliable(idx + 1);
                }

                return Placement::Discard;
            }
        }

        Placement::Unreliable(0)
    }

    /// Release the run of in-order, fully reassembled reliable commands to
    /// `dispatched`, then revisit the unreliable queue which may have been
    /// unblocked. Returns true if anything was released.
    pub(crate) fn dispatch_ready_reliable(
        &mut self,
        dispatched: &mut VecDeque<IncomingCommand>,
    ) -> bool {
        let mut ready = 0;

        while ready < self.incoming_reliable_commands.len() {
            let pending = &self.incoming_reliable_commands[ready];

            if pending.fragments_remaining > 0
                || pending.reliable_sequence_number
                    != self.incoming_reliable_sequence_number.wrapping_add(1)
            {
                break;
            }

            self.incoming_reliable_sequence_number = pending.reliable_sequence_number;

            if pending.fragment_count > 0 {
                self.incoming_reliable_sequence_number = self
                    .incoming_reliable_sequence_number
                    .wrapping_add(pending.fragment_count as u16 - 1);
            }

            ready += 1;
        }

        if ready == 0 {
            return false;
        }

        self.incoming_unreliable_sequence_number = 0;
        dispatched.extend(self.incoming_reliable_commands.drain(0..ready));

        if !self.incoming_unreliable_commands.is_empty() {
            self.dispatch_ready_unreliable(dispatched);
        }

        true
    }

    /// Release unreliable commands that are deliverable now: runs at the
    /// current reliable sequence number (and trailing unsequenced commands),
    /// dropping runs whose reliable window has already passed. Stops at the
    /// first command from a future window. Returns true if anything was
    /// released.
    pub(crate) fn dispatch_ready_unreliable(
        &mut self,
        dispatched: &mut VecDeque<IncomingCommand>,
    ) -> bool {
        let queue = &mut self.incoming_unreliable_commands;
        let mut any = false;
        let mut dropped = 0usize;
        let mut start = 0usize;
        let mut idx = 0usize;

        while idx < queue.len() {
            let pending = &queue[idx];

            if pending.number() == COMMAND_SEND_UNSEQUENCED {
                idx += 1;
                continue;
            }

            if pending.reliable_sequence_number == self.incoming_reliable_sequence_number {
                if pending.fragments_remaining == 0 {
                    self.incoming_unreliable_sequence_number = pending.unreliable_sequence_number;
                    idx += 1;
                    continue;
                }

                // A partial fragment blocks the stream here; release what
                // precedes it and keep it buffered.
                if start != idx {
                    dispatched.extend(queue.drain(start..idx));
                    any = true;
                    idx = start;
                    dropped = idx;
                } else if dropped != idx {
                    dropped = idx.saturating_sub(1);
                }

                start = idx + 1;
                idx += 1;
            } else {
                let mut reliable_window =
                    pending.reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE;
                let current_window =
                    self.incoming_reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE;

                if pending.reliable_sequence_number < self.incoming_reliable_sequence_number {
                    reliable_window += PEER_RELIABLE_WINDOWS;
                }

                if reliable_window >= current_window
                    && reliable_window < current_window + PEER_FREE_RELIABLE_WINDOWS - 1
                {
                    break;
                }

                // Stale window: everything up to and including this command
                // is beyond recovery.
                if start != idx {
                    dispatched.extend(queue.drain(start..idx));
                    any = true;
                    idx = start;
                }

                dropped = idx + 1;
                start = idx + 1;
                idx += 1;
            }
        }

        if start != idx {
            dispatched.extend(queue.drain(start..idx));
            any = true;
            dropped = start;
        }

        let dropped = dropped.min(queue.len());
        queue.drain(0..dropped);

        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(reliable: SeqNum, unreliable: SeqNum, number: u8) -> IncomingCommand {
        IncomingCommand {
            command: number,
            channel_id: 0,
            reliable_sequence_number: reliable,
            unreliable_sequence_number: unreliable,
            fragment_count: 0,
            fragments_remaining: 0,
            fragments: Vec::new(),
            payload: IncomingPayload::Complete(Bytes::new()),
            packet_flags: 0,
        }
    }

    #[test]
    fn reliable_commands_release_in_order_only() {
        let mut channel = Channel::new();
        let mut dispatched = VecDeque::new();

        // Sequence 2 arrives before 1: nothing releases yet.
        match channel.place_reliable(2) {
            Placement::Reliable(at) => channel
                .incoming_reliable_commands
                .insert(at, command(2, 0, COMMAND_SEND_RELIABLE)),
            other => panic!("unexpected placement {other:?}"),
        }
        assert!(!channel.dispatch_ready_reliable(&mut dispatched));

        match channel.place_reliable(1) {
            Placement::Reliable(at) => channel
                .incoming_reliable_commands
                .insert(at, command(1, 0, COMMAND_SEND_RELIABLE)),
            other => panic!("unexpected placement {other:?}"),
        }
        assert!(channel.dispatch_ready_reliable(&mut dispatched));

        let released: Vec<u16> = dispatched
            .iter()
            .map(|c| c.reliable_sequence_number)
            .collect();
        assert_eq!(released, vec![1, 2]);
        assert_eq!(channel.incoming_reliable_sequence_number, 2);
    }

    #[test]
    fn duplicate_reliable_command_is_discarded() {
        let mut channel = Channel::new();
        let mut dispatched = VecDeque::new();

        if let Placement::Reliable(at) = channel.place_reliable(1) {
            channel
                .incoming_reliable_commands
                .insert(at, command(1, 0, COMMAND_SEND_RELIABLE));
        }

        assert_eq!(channel.place_reliable(1), Placement::Discard);

        channel.dispatch_ready_reliable(&mut dispatched);
        assert_eq!(channel.place_reliable(1), Placement::Discard);
    }

    #[test]
    fn stale_unreliable_command_is_discarded() {
        let mut channel = Channel::new();
        channel.incoming_unreliable_sequence_number = 5;

        assert_eq!(channel.place_unreliable(0, 3), Placement::Discard);
        assert_eq!(channel.place_unreliable(0, 5), Placement::Discard);
        assert!(matches!(
            channel.place_unreliable(0, 6),
            Placement::Unreliable(_)
        ));
    }
}
