//! Peer connection state: the handshake/teardown state machine, RTT
//! estimation, the packet throttle, and the per-peer command queues.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::channel::{Channel, IncomingCommand, IncomingPayload, Placement};
use crate::packet::Packet;
use crate::protocol::constants::*;
use crate::protocol::{
    time_difference, time_less, Command, CommandBody, CommandHeader, SeqNum, Timestamp,
};

pub(crate) const PEER_DEFAULT_ROUND_TRIP_TIME: u32 = 1;
pub(crate) const PEER_DEFAULT_PACKET_THROTTLE: u32 = 32;
pub(crate) const PEER_PACKET_THROTTLE_SCALE: u32 = 32;
pub(crate) const PEER_PACKET_THROTTLE_THRESHOLD: u32 = 40;
pub(crate) const PEER_PACKET_THROTTLE_COUNTER: u32 = 7;
pub(crate) const PEER_PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub(crate) const PEER_PACKET_THROTTLE_DECELERATION: u32 = 2;
pub(crate) const PEER_PACKET_THROTTLE_INTERVAL: u32 = 5000;
pub(crate) const PEER_WINDOW_SIZE_SCALE: u32 = 64 * 1024;

/// Default timeout tunables; see [`HostEngine::set_timeout`](crate::HostEngine::set_timeout).
pub const PEER_TIMEOUT_LIMIT: u32 = 32;
pub const PEER_TIMEOUT_MINIMUM: u32 = 5000;
pub const PEER_TIMEOUT_MAXIMUM: u32 = 30000;
/// Default keepalive interval in milliseconds.
pub const PEER_PING_INTERVAL: u32 = 250;

pub(crate) const PEER_UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
pub(crate) const PEER_FREE_UNSEQUENCED_WINDOWS: u32 = 32;

/// Connection lifecycle states.
///
/// The happy path runs `Disconnected → Connecting → … → Connected`; either
/// side of the handshake passes through its own intermediate states. Any
/// state can fall to `Zombie` on timeout or reset, after which the slot is
/// reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Disconnected,
    Connecting,
    AcknowledgingConnect,
    ConnectionPending,
    ConnectionSucceeded,
    Connected,
    DisconnectLater,
    Disconnecting,
    AcknowledgingDisconnect,
    Zombie,
}

impl PeerState {
    /// Connected for traffic purposes (includes the drain-then-disconnect
    /// window).
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected | PeerState::DisconnectLater)
    }
}

/// Stable handle to a peer slot.
///
/// Slots are reused once a connection is fully torn down; the generation
/// counter makes handles from a previous occupant fail instead of aliasing
/// the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    pub(crate) index: u16,
    pub(crate) generation: u32,
}

impl PeerId {
    /// Slot index inside the host's peer table.
    pub fn index(&self) -> u16 {
        self.index
    }
}

/// A queued outgoing command, possibly carrying (a fragment of) a packet.
#[derive(Debug)]
pub(crate) struct OutgoingCommand {
    pub reliable_sequence_number: SeqNum,
    pub unreliable_sequence_number: SeqNum,
    pub sent_time: Timestamp,
    pub round_trip_timeout: u32,
    pub round_trip_timeout_limit: u32,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub send_attempts: u16,
    pub command: Command,
    pub packet: Option<Packet>,
}

/// A pending acknowledgement for a received reliable command.
#[derive(Debug)]
pub(crate) struct Acknowledgement {
    pub sent_time: u16,
    pub command_number: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: SeqNum,
}

/// Outcome of queueing a received send command.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum IncomingResult {
    Queued,
    Discarded,
    /// Resource limit hit; the datagram is abandoned
    Refused,
}

/// Point-in-time peer statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    /// Smoothed round-trip time in milliseconds
    pub round_trip_time: u32,
    /// Round-trip time variance
    pub round_trip_time_variance: u32,
    /// Last raw round-trip sample
    pub last_round_trip_time: u32,
    /// Current unreliable-traffic throttle, out of 32
    pub packet_throttle: u32,
    pub total_packets_sent: u64,
    pub total_packets_lost: u64,
    pub total_data_sent: u64,
    pub total_data_received: u64,
    /// Negotiated MTU
    pub mtu: u32,
    /// Negotiated send window in bytes
    pub window_size: u32,
}

/// One logical connection multiplexing several channels.
///
/// Peers live in the host's fixed slot table and hold no reference back to
/// it; every operation that needs host context goes through the host.
#[derive(Debug)]
pub(crate) struct Peer {
    pub incoming_peer_id: u16,
    pub generation: u32,
    pub outgoing_peer_id: u16,
    pub connect_id: u32,
    pub outgoing_session_id: u8,
    pub incoming_session_id: u8,
    pub address: Option<SocketAddr>,
    pub state: PeerState,
    pub channels: Vec<Channel>,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub incoming_bandwidth_throttle_epoch: Timestamp,
    pub outgoing_bandwidth_throttle_epoch: Timestamp,
    pub incoming_data_total: u32,
    pub outgoing_data_total: u32,
    pub total_data_received: u64,
    pub total_data_sent: u64,
    pub last_send_time: Timestamp,
    pub last_receive_time: Timestamp,
    pub next_timeout: Timestamp,
    pub earliest_timeout: Timestamp,
    pub total_packets_sent: u64,
    pub total_packets_lost: u64,
    pub packet_throttle: u32,
    pub packet_throttle_threshold: u32,
    pub packet_throttle_limit: u32,
    pub packet_throttle_counter: u32,
    pub packet_throttle_epoch: Timestamp,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub packet_throttle_interval: u32,
    pub ping_interval: u32,
    pub timeout_limit: u32,
    pub timeout_minimum: u32,
    pub timeout_maximum: u32,
    pub last_round_trip_time: u32,
    pub lowest_round_trip_time: u32,
    pub last_round_trip_time_variance: u32,
    pub highest_round_trip_time_variance: u32,
    pub round_trip_time: u32,
    pub round_trip_time_variance: u32,
    pub mtu: u32,
    pub window_size: u32,
    pub reliable_data_in_transit: u32,
    pub outgoing_reliable_sequence_number: SeqNum,
    pub acknowledgements: VecDeque<Acknowledgement>,
    pub sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub sent_unreliable_commands: VecDeque<OutgoingCommand>,
    pub outgoing_commands: VecDeque<OutgoingCommand>,
    pub dispatched_commands: VecDeque<IncomingCommand>,
    pub needs_dispatch: bool,
    pub incoming_unsequenced_group: u16,
    pub outgoing_unsequenced_group: u16,
    pub unsequenced_window: [u32; PEER_UNSEQUENCED_WINDOW_SIZE as usize / 32],
    pub event_data: u32,
    pub total_waiting_data: usize,
    pub user_data: u64,
}

impl Peer {
    pub(crate) fn new(incoming_peer_id: u16, host_mtu: u32) -> Self {
        let mut peer = Self {
            incoming_peer_id,
            generation: 0,
            outgoing_peer_id: PROTOCOL_MAXIMUM_PEER_ID,
            connect_id: 0,
            outgoing_session_id: 0xFF,
            incoming_session_id: 0xFF,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            total_data_received: 0,
            total_data_sent: 0,
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            total_packets_sent: 0,
            total_packets_lost: 0,
            packet_throttle: PEER_DEFAULT_PACKET_THROTTLE,
            packet_throttle_threshold: PEER_PACKET_THROTTLE_THRESHOLD,
            packet_throttle_limit: PEER_PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: PEER_PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: PEER_PACKET_THROTTLE_DECELERATION,
            packet_throttle_interval: PEER_PACKET_THROTTLE_INTERVAL,
            ping_interval: PEER_PING_INTERVAL,
            timeout_limit: PEER_TIMEOUT_LIMIT,
            timeout_minimum: PEER_TIMEOUT_MINIMUM,
            timeout_maximum: PEER_TIMEOUT_MAXIMUM,
            last_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            lowest_round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            round_trip_time: PEER_DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            mtu: host_mtu,
            window_size: PROTOCOL_MAXIMUM_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            sent_unreliable_commands: VecDeque::new(),
            outgoing_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
            needs_dispatch: false,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; PEER_UNSEQUENCED_WINDOW_SIZE as usize / 32],
            event_data: 0,
            total_waiting_data: 0,
            user_data: 0,
        };

        peer.reset(host_mtu);
        peer
    }

    /// Return the slot to its pristine disconnected state, releasing every
    /// queued buffer. The slot index, generation, and user data survive.
    pub(crate) fn reset(&mut self, host_mtu: u32) {
        self.outgoing_peer_id = PROTOCOL_MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.state = PeerState::Disconnected;
        self.address = None;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.total_data_received = 0;
        self.total_data_sent = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.total_packets_sent = 0;
        self.total_packets_lost = 0;
        self.packet_throttle = PEER_DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_threshold = PEER_PACKET_THROTTLE_THRESHOLD;
        self.packet_throttle_limit = PEER_PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.packet_throttle_acceleration = PEER_PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PEER_PACKET_THROTTLE_DECELERATION;
        self.packet_throttle_interval = PEER_PACKET_THROTTLE_INTERVAL;
        self.ping_interval = PEER_PING_INTERVAL;
        self.timeout_limit = PEER_TIMEOUT_LIMIT;
        self.timeout_minimum = PEER_TIMEOUT_MINIMUM;
        self.timeout_maximum = PEER_TIMEOUT_MAXIMUM;
        self.last_round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.round_trip_time = PEER_DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.mtu = host_mtu;
        self.window_size = PROTOCOL_MAXIMUM_WINDOW_SIZE;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.unsequenced_window = [0; PEER_UNSEQUENCED_WINDOW_SIZE as usize / 32];

        self.reset_queues();
    }

    pub(crate) fn reset_queues(&mut self) {
        self.needs_dispatch = false;
        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.sent_unreliable_commands.clear();
        self.outgoing_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
    }

    pub(crate) fn setup_channels(&mut self, count: usize) {
        self.channels = (0..count).map(|_| Channel::new()).collect();
    }

    pub(crate) fn stats(&self) -> PeerStats {
        PeerStats {
            round_trip_time: self.round_trip_time,
            round_trip_time_variance: self.round_trip_time_variance,
            last_round_trip_time: self.last_round_trip_time,
            packet_throttle: self.packet_throttle,
            total_packets_sent: self.total_packets_sent,
            total_packets_lost: self.total_packets_lost,
            total_data_sent: self.total_data_sent,
            total_data_received: self.total_data_received,
            mtu: self.mtu,
            window_size: self.window_size,
        }
    }

    /// Adapt the unreliable-traffic throttle to a fresh round-trip sample.
    ///
    /// Trips faster than the recent mean open the throttle additively; trips
    /// slower than mean + threshold close it. Returns the direction taken.
    pub(crate) fn throttle(&mut self, rtt: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt < self.last_round_trip_time + (self.last_round_trip_time_variance + 1) / 2 {
            self.packet_throttle += self.packet_throttle_acceleration;

            if self.packet_throttle > self.packet_throttle_limit {
                self.packet_throttle = self.packet_throttle_limit;
            }

            return 1;
        } else if rtt
            > self.last_round_trip_time
                + self.packet_throttle_threshold
                + 2 * self.last_round_trip_time_variance
        {
            if self.packet_throttle > self.packet_throttle_deceleration {
                self.packet_throttle -= self.packet_throttle_deceleration;
            } else {
                self.packet_throttle = 0;
            }

            return -1;
        }

        0
    }

    /// Fold a round-trip sample into the smoothed estimate and variance.
    pub(crate) fn update_round_trip_time(&mut self, rtt: u32) {
        if self.last_receive_time > 0 {
            if rtt >= self.round_trip_time {
                let diff = rtt - self.round_trip_time;
                self.round_trip_time_variance -= self.round_trip_time_variance / 4;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time += diff / 8;
            } else {
                let diff = self.round_trip_time - rtt;

                if diff <= self.round_trip_time_variance {
                    self.round_trip_time_variance -= self.round_trip_time_variance / 4;
                    self.round_trip_time_variance += diff / 4;
                } else {
                    self.round_trip_time_variance -= self.round_trip_time_variance / 32;
                    self.round_trip_time_variance += diff / 32;
                }

                self.round_trip_time -= diff / 8;
            }
        } else {
            self.round_trip_time = rtt;
            self.round_trip_time_variance = rtt / 2;
        }

        if self.round_trip_time < self.lowest_round_trip_time {
            self.lowest_round_trip_time = self.round_trip_time;
        }

        if self.round_trip_time_variance > self.highest_round_trip_time_variance {
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
        }
    }

    /// Roll the throttle measurement epoch if its interval has elapsed.
    pub(crate) fn update_throttle_epoch(&mut self, service_time: Timestamp) {
        if self.packet_throttle_epoch == 0
            || time_difference(service_time, self.packet_throttle_epoch)
                >= self.packet_throttle_interval
        {
            self.last_round_trip_time = self.lowest_round_trip_time;
            self.last_round_trip_time_variance = self.highest_round_trip_time_variance;
            self.lowest_round_trip_time = self.round_trip_time;
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
            self.packet_throttle_epoch = service_time;
        }
    }

    /// Queue a command for transmission, assigning its sequence numbers.
    pub(crate) fn queue_outgoing_command(
        &mut self,
        command: Command,
        packet: Option<Packet>,
        fragment_offset: u32,
        fragment_length: u16,
    ) {
        let outgoing = OutgoingCommand {
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            fragment_offset,
            fragment_length,
            send_attempts: 0,
            command,
            packet,
        };

        self.setup_outgoing_command(outgoing);
    }

    fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        self.outgoing_data_total +=
            (outgoing.command.size() + outgoing.fragment_length as usize) as u32;

        if outgoing.command.header.channel_id == 0xFF {
            // Connection-level commands sequence against the peer itself.
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[outgoing.command.header.channel_id as usize];

            if outgoing.command.wants_acknowledge() {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_unreliable_sequence_number = 0;
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = 0;
            } else if outgoing.command.is_unsequenced() {
                self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
                outgoing.reliable_sequence_number = 0;
                outgoing.unreliable_sequence_number = 0;
            } else {
                if outgoing.fragment_offset == 0 {
                    channel.outgoing_unreliable_sequence_number =
                        channel.outgoing_unreliable_sequence_number.wrapping_add(1);
                }

                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
            }
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.round_trip_timeout_limit = 0;
        outgoing.command.header.reliable_sequence_number = outgoing.reliable_sequence_number;

        match &mut outgoing.command.body {
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => {
                *unreliable_sequence_number = outgoing.unreliable_sequence_number;
            }
            CommandBody::SendUnsequenced {
                unsequenced_group, ..
            } => {
                *unsequenced_group = self.outgoing_unsequenced_group;
            }
            _ => {}
        }

        self.outgoing_commands.push_back(outgoing);
    }

    /// Queue an acknowledgement for a received reliable command, unless its
    /// window is one the receiver refuses to acknowledge yet.
    pub(crate) fn queue_acknowledgement(&mut self, header: &CommandHeader, sent_time: u16) -> bool {
        if (header.channel_id as usize) < self.channels.len() {
            let channel = &self.channels[header.channel_id as usize];
            let mut reliable_window =
                header.reliable_sequence_number / crate::channel::PEER_RELIABLE_WINDOW_SIZE;
            let current_window = channel.incoming_reliable_sequence_number
                / crate::channel::PEER_RELIABLE_WINDOW_SIZE;

            if header.reliable_sequence_number < channel.incoming_reliable_sequence_number {
                reliable_window += crate::channel::PEER_RELIABLE_WINDOWS;
            }

            if reliable_window >= current_window + crate::channel::PEER_FREE_RELIABLE_WINDOWS - 1
                && reliable_window <= current_window + crate::channel::PEER_FREE_RELIABLE_WINDOWS
            {
                return false;
            }
        }

        self.outgoing_data_total += crate::protocol::command_size(COMMAND_ACKNOWLEDGE) as u32;

        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            command_number: header.command & COMMAND_MASK,
            channel_id: header.channel_id,
            reliable_sequence_number: header.reliable_sequence_number,
        });

        true
    }

    /// Queue a received send command on its channel, releasing any commands
    /// that became deliverable.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn queue_incoming_command(
        &mut self,
        command: u8,
        channel_id: u8,
        reliable_sequence_number: SeqNum,
        unreliable_sequence_number: SeqNum,
        payload: IncomingPayload,
        packet_flags: u32,
        fragment_count: u32,
        maximum_waiting_data: usize,
    ) -> IncomingResult {
        let number = command & COMMAND_MASK;
        let channel = &mut self.channels[channel_id as usize];

        let placement = if self.state == PeerState::DisconnectLater {
            Placement::Discard
        } else if number != COMMAND_SEND_UNSEQUENCED
            && !channel.in_free_window(reliable_sequence_number)
        {
            Placement::Discard
        } else {
            match number {
                COMMAND_SEND_RELIABLE | COMMAND_SEND_FRAGMENT => {
                    channel.place_reliable(reliable_sequence_number)
                }
                COMMAND_SEND_UNRELIABLE | COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                    channel.place_unreliable(reliable_sequence_number, unreliable_sequence_number)
                }
                COMMAND_SEND_UNSEQUENCED => {
                    Placement::Unreliable(channel.incoming_unreliable_commands.len())
                }
                _ => Placement::Discard,
            }
        };

        if placement == Placement::Discard {
            // A discarded fragment start would lose the whole reassembly.
            if fragment_count > 0 {
                return IncomingResult::Refused;
            }

            return IncomingResult::Discarded;
        }

        if self.total_waiting_data >= maximum_waiting_data {
            return IncomingResult::Refused;
        }

        let mut incoming = IncomingCommand {
            command,
            channel_id,
            reliable_sequence_number,
            unreliable_sequence_number,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments: Vec::new(),
            payload,
            packet_flags,
        };

        if fragment_count > 0 {
            if fragment_count > PROTOCOL_MAXIMUM_FRAGMENT_COUNT {
                return IncomingResult::Refused;
            }

            incoming.fragments = vec![0u32; (fragment_count as usize + 31) / 32];
        }

        self.total_waiting_data += incoming.data_len();

        match placement {
            Placement::Reliable(at) => {
                channel.incoming_reliable_commands.insert(at, incoming);
                channel.dispatch_ready_reliable(&mut self.dispatched_commands);
            }
            Placement::Unreliable(at) => {
                channel.incoming_unreliable_commands.insert(at, incoming);
                channel.dispatch_ready_unreliable(&mut self.dispatched_commands);
            }
            Placement::Discard => unreachable!(),
        }

        IncomingResult::Queued
    }

    /// Pop the next dispatched command as an application packet.
    pub(crate) fn receive(&mut self) -> Option<(u8, Packet)> {
        let incoming = self.dispatched_commands.pop_front()?;
        let channel_id = incoming.channel_id;
        let packet = incoming.into_packet();

        self.total_waiting_data = self.total_waiting_data.saturating_sub(packet.len());

        Some((channel_id, packet))
    }

    /// Drop unreliable commands that went out in the last datagram; they are
    /// fire-and-forget. Returns true when a deferred disconnect can proceed.
    pub(crate) fn remove_sent_unreliable_commands(&mut self) -> bool {
        if self.sent_unreliable_commands.is_empty() {
            return false;
        }

        self.sent_unreliable_commands.clear();

        self.state == PeerState::DisconnectLater
            && self.outgoing_commands.is_empty()
            && self.sent_reliable_commands.is_empty()
    }

    /// Remove the sent reliable command matching an acknowledgement and
    /// release its window slot. Returns the command's number, or
    /// `COMMAND_NONE` when nothing matched.
    pub(crate) fn remove_sent_reliable_command(
        &mut self,
        reliable_sequence_number: SeqNum,
        channel_id: u8,
    ) -> u8 {
        let mut was_sent = true;

        let position = self.sent_reliable_commands.iter().position(|outgoing| {
            outgoing.reliable_sequence_number == reliable_sequence_number
                && outgoing.command.header.channel_id == channel_id
        });

        let outgoing = match position {
            Some(at) => self.sent_reliable_commands.remove(at).unwrap(),
            None => {
                // The ack may race a command still queued for its first send.
                let mut found = None;

                for (at, outgoing) in self.outgoing_commands.iter().enumerate() {
                    if outgoing.send_attempts < 1 {
                        return COMMAND_NONE;
                    }

                    if outgoing.reliable_sequence_number == reliable_sequence_number
                        && outgoing.command.header.channel_id == channel_id
                    {
                        found = Some(at);
                        break;
                    }
                }

                match found {
                    Some(at) => {
                        was_sent = false;
                        self.outgoing_commands.remove(at).unwrap()
                    }
                    None => return COMMAND_NONE,
                }
            }
        };

        if (channel_id as usize) < self.channels.len() {
            let channel = &mut self.channels[channel_id as usize];
            let reliable_window =
                (reliable_sequence_number / crate::channel::PEER_RELIABLE_WINDOW_SIZE) as usize;

            if channel.reliable_windows[reliable_window] > 0 {
                channel.reliable_windows[reliable_window] -= 1;

                if channel.reliable_windows[reliable_window] == 0 {
                    channel.used_reliable_windows &= !(1 << reliable_window);
                }
            }
        }

        let command_number = outgoing.command.number();

        if outgoing.packet.is_some() && was_sent {
            self.reliable_data_in_transit = self
                .reliable_data_in_transit
                .saturating_sub(outgoing.fragment_length as u32);
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }

        command_number
    }

    /// Retransmission check: requeue every sent reliable command whose RTO
    /// has elapsed. Returns true when the peer itself must be declared dead.
    pub(crate) fn check_timeouts(&mut self, service_time: Timestamp) -> bool {
        let mut requeue = Vec::new();
        let mut idx = 0;

        while idx < self.sent_reliable_commands.len() {
            let outgoing = &self.sent_reliable_commands[idx];

            if time_difference(service_time, outgoing.sent_time) < outgoing.round_trip_timeout {
                idx += 1;
                continue;
            }

            if self.earliest_timeout == 0 || time_less(outgoing.sent_time, self.earliest_timeout) {
                self.earliest_timeout = outgoing.sent_time;
            }

            if self.earliest_timeout != 0
                && (time_difference(service_time, self.earliest_timeout) >= self.timeout_maximum
                    || (outgoing.round_trip_timeout >= outgoing.round_trip_timeout_limit
                        && time_difference(service_time, self.earliest_timeout)
                            >= self.timeout_minimum))
            {
                return true;
            }

            let mut outgoing = self.sent_reliable_commands.remove(idx).unwrap();

            if outgoing.packet.is_some() {
                self.reliable_data_in_transit = self
                    .reliable_data_in_transit
                    .saturating_sub(outgoing.fragment_length as u32);
            }

            self.total_packets_lost += 1;
            outgoing.round_trip_timeout = self.round_trip_time + 4 * self.round_trip_time_variance;
            outgoing.round_trip_timeout_limit = self.timeout_limit * outgoing.round_trip_timeout;
            requeue.push(outgoing);
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }

        // Timed-out commands go back to the head of the queue, oldest first.
        for outgoing in requeue.into_iter().rev() {
            self.outgoing_commands.push_front(outgoing);
        }

        false
    }

    /// Has this unsequenced group already been seen? Updates the dedup
    /// window as a side effect; stale groups report as duplicates.
    pub(crate) fn check_unsequenced_group(&mut self, group: u16) -> bool {
        let index = (group as u32 % PEER_UNSEQUENCED_WINDOW_SIZE) as usize;
        let mut extended_group = group as u32;

        if extended_group < self.incoming_unsequenced_group as u32 {
            extended_group += 0x10000;
        }

        if extended_group
            >= self.incoming_unsequenced_group as u32
                + PEER_FREE_UNSEQUENCED_WINDOWS * PEER_UNSEQUENCED_WINDOW_SIZE
        {
            return true;
        }

        let extended_group = (extended_group & 0xFFFF) as u16;

        if extended_group.wrapping_sub(index as u16) != self.incoming_unsequenced_group {
            self.incoming_unsequenced_group = extended_group.wrapping_sub(index as u16);
            self.unsequenced_window = [0; PEER_UNSEQUENCED_WINDOW_SIZE as usize / 32];
        } else if self.unsequenced_window[index / 32] & (1 << (index % 32)) != 0 {
            return true;
        }

        self.unsequenced_window[index / 32] |= 1 << (index % 32);

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer() -> Peer {
        let mut peer = Peer::new(0, 1280);
        peer.setup_channels(2);
        peer.state = PeerState::Connected;
        peer
    }

    #[test]
    fn throttle_opens_on_fast_trips_and_closes_on_slow_ones() {
        let mut peer = test_peer();
        peer.packet_throttle = 16;
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 10;

        assert_eq!(peer.throttle(50), 1);
        assert_eq!(peer.packet_throttle, 16 + PEER_PACKET_THROTTLE_ACCELERATION);

        assert_eq!(peer.throttle(500), -1);
        assert_eq!(peer.packet_throttle, 16);

        // Within the tolerance band: unchanged.
        assert_eq!(peer.throttle(110), 0);
        assert_eq!(peer.packet_throttle, 16);
    }

    #[test]
    fn unsequenced_window_detects_duplicates() {
        let mut peer = test_peer();

        assert!(!peer.check_unsequenced_group(1));
        assert!(peer.check_unsequenced_group(1));
        assert!(!peer.check_unsequenced_group(2));

        // Far-future groups are rejected outright.
        assert!(peer.check_unsequenced_group(40000));
    }

    #[test]
    fn reliable_sequence_numbers_increase_per_channel() {
        let mut peer = test_peer();

        let command = Command::new(
            COMMAND_SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE,
            0,
            CommandBody::SendReliable { data_length: 1 },
        );

        peer.queue_outgoing_command(command.clone(), Some(Packet::reliable(vec![1u8])), 0, 1);
        peer.queue_outgoing_command(command, Some(Packet::reliable(vec![2u8])), 0, 1);

        let numbers: Vec<u16> = peer
            .outgoing_commands
            .iter()
            .map(|c| c.reliable_sequence_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(peer.channels[0].outgoing_reliable_sequence_number, 2);
        assert_eq!(peer.channels[1].outgoing_reliable_sequence_number, 0);
    }
}
