//! Host engine: peer table ownership, datagram routing, command
//! coalescing, and event production.
//!
//! The engine performs no I/O of its own. Callers feed received datagrams
//! to [`HostEngine::input`], drive timers through [`HostEngine::update`],
//! take wire traffic from [`HostEngine::drain_outgoing`], and observe
//! connection activity through [`HostEngine::poll_event`]. All timestamps
//! are caller-supplied wrapping milliseconds, which keeps the engine fully
//! deterministic under test.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::channel::{
    IncomingPayload, PEER_FREE_RELIABLE_WINDOWS, PEER_RELIABLE_WINDOWS, PEER_RELIABLE_WINDOW_SIZE,
};
use crate::config::HostConfig;
use crate::error::{CoreError, CoreResult};
use crate::packet::{
    Packet, PACKET_FLAG_INSTANT, PACKET_FLAG_RELIABLE, PACKET_FLAG_UNRELIABLE_FRAGMENTED,
    PACKET_FLAG_UNSEQUENCED, PACKET_FLAG_UNTHROTTLED,
};
use crate::peer::{
    IncomingResult, Peer, PeerId, PeerState, PeerStats, PEER_PACKET_THROTTLE_COUNTER,
    PEER_PACKET_THROTTLE_SCALE, PEER_WINDOW_SIZE_SCALE,
};
use crate::protocol::constants::*;
use crate::protocol::{
    command_size, time_difference, time_greater_equal, time_less, Command, CommandBody,
    ConnectCommand, FragmentCommand, ProtocolHeader, Timestamp, VerifyConnectCommand,
};

/// How often the host-wide bandwidth accounting is re-evaluated.
pub const HOST_BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;

/// Wire size of the datagram header reserved up front in each datagram.
const PROTOCOL_HEADER_SIZE: usize = 4;

/// One observed connection activity, produced by [`HostEngine::poll_event`].
#[derive(Debug, Clone)]
pub enum Event {
    /// The handshake with a peer completed; `data` is the 32-bit value the
    /// connecting side supplied.
    Connect { peer: PeerId, data: u32 },
    /// The peer disconnected; `data` carries the remote side's disconnect
    /// value, or 0 for a locally observed teardown.
    Disconnect { peer: PeerId, data: u32 },
    /// A packet arrived and is released in order for its channel.
    Receive {
        peer: PeerId,
        channel_id: u8,
        packet: Packet,
    },
    /// The peer stopped acknowledging traffic and was declared dead.
    Timeout { peer: PeerId },
}

/// Host-wide monotonically increasing traffic counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostStats {
    pub total_sent_data: u64,
    pub total_sent_packets: u64,
    pub total_received_data: u64,
    pub total_received_packets: u64,
    pub connected_peers: usize,
}

/// In-progress datagram for one peer: encoded commands plus accounting.
struct DatagramBuilder {
    buf: BytesMut,
    command_count: usize,
    packet_size: usize,
    header_flags: u16,
}

impl DatagramBuilder {
    fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            command_count: 0,
            packet_size: PROTOCOL_HEADER_SIZE,
            header_flags: 0,
        }
    }
}

/// The transport engine for one endpoint: a fixed table of peer slots plus
/// the service machinery that multiplexes them onto datagrams.
pub struct HostEngine {
    peers: Vec<Peer>,
    channel_limit: usize,
    incoming_bandwidth: u32,
    outgoing_bandwidth: u32,
    bandwidth_throttle_epoch: Timestamp,
    recalculate_bandwidth_limits: bool,
    prevent_connections: bool,
    mtu: u32,
    random_seed: u32,
    service_time: Timestamp,
    continue_sending: bool,
    dispatch_queue: VecDeque<u16>,
    events: VecDeque<Event>,
    outgoing: VecDeque<(SocketAddr, Bytes)>,
    connected_peers: usize,
    bandwidth_limited_peers: usize,
    max_duplicate_peers: usize,
    maximum_packet_size: usize,
    maximum_waiting_data: usize,
    total_sent_data: u64,
    total_sent_packets: u64,
    total_received_data: u64,
    total_received_packets: u64,
}

impl HostEngine {
    /// Create an engine with `config.peer_limit` empty peer slots.
    pub fn new(config: HostConfig) -> CoreResult<Self> {
        config.validate()?;

        let peers = (0..config.peer_limit)
            .map(|index| Peer::new(index as u16, config.mtu))
            .collect();

        Ok(Self {
            peers,
            channel_limit: config.channel_limit,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            prevent_connections: false,
            mtu: config.mtu,
            random_seed: config.seed.rotate_left(16) | 1,
            service_time: 0,
            continue_sending: false,
            dispatch_queue: VecDeque::new(),
            events: VecDeque::new(),
            outgoing: VecDeque::new(),
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            max_duplicate_peers: config.max_duplicate_peers,
            maximum_packet_size: config.maximum_packet_size,
            maximum_waiting_data: config.maximum_waiting_data,
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
        })
    }

    // ------------------------------------------------------------------
    // Application-facing operations
    // ------------------------------------------------------------------

    /// Begin connecting to `address` with up to `channel_count` channels.
    ///
    /// Non-blocking: the returned handle starts in [`PeerState::Connecting`]
    /// and the handshake completes asynchronously, observed as a later
    /// [`Event::Connect`] (or [`Event::Timeout`] on failure).
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> CoreResult<PeerId> {
        let channel_count =
            channel_count.clamp(PROTOCOL_MINIMUM_CHANNEL_COUNT, PROTOCOL_MAXIMUM_CHANNEL_COUNT);

        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
            .ok_or(CoreError::PeerLimitReached)?;

        self.random_seed = self.random_seed.wrapping_add(1);

        let outgoing_bandwidth = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];
        peer.setup_channels(channel_count);
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = self.random_seed;

        peer.window_size = if outgoing_bandwidth == 0 {
            PROTOCOL_MAXIMUM_WINDOW_SIZE
        } else {
            ((outgoing_bandwidth / PEER_WINDOW_SIZE_SCALE) * PROTOCOL_MINIMUM_WINDOW_SIZE)
                .clamp(PROTOCOL_MINIMUM_WINDOW_SIZE, PROTOCOL_MAXIMUM_WINDOW_SIZE)
        };

        let command = Command::new(
            COMMAND_CONNECT | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Connect(ConnectCommand {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id: peer.incoming_session_id,
                outgoing_session_id: peer.outgoing_session_id,
                mtu: peer.mtu,
                window_size: peer.window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: self.incoming_bandwidth,
                outgoing_bandwidth: self.outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id: peer.connect_id,
                data,
            }),
        );

        peer.queue_outgoing_command(command, None, 0, 0);

        debug!(peer = index, %address, channels = channel_count, "connecting");

        Ok(PeerId {
            index: index as u16,
            generation: peer.generation,
        })
    }

    /// Queue `packet` for delivery on `channel_id`, fragmenting it when it
    /// exceeds what fits in a single datagram.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> CoreResult<()> {
        let maximum_packet_size = self.maximum_packet_size;
        let index = self.resolve(peer)?;
        let target = &mut self.peers[index];

        if !target.state.is_connected() {
            return Err(CoreError::NotConnected);
        }

        if channel_id as usize >= target.channels.len() {
            return Err(CoreError::InvalidChannel);
        }

        if packet.len() > maximum_packet_size {
            return Err(CoreError::PacketTooLarge);
        }

        let instant = packet.flags & PACKET_FLAG_INSTANT != 0;
        let fragment_length = target.mtu as usize
            - PROTOCOL_HEADER_SIZE
            - command_size(COMMAND_SEND_FRAGMENT)
            - command_size(COMMAND_ACKNOWLEDGE);

        if packet.len() > fragment_length {
            let fragment_count = packet.len().div_ceil(fragment_length) as u32;

            if fragment_count > PROTOCOL_MAXIMUM_FRAGMENT_COUNT {
                return Err(CoreError::TooManyFragments);
            }

            let channel = &target.channels[channel_id as usize];

            let (command_number, start_sequence_number) = if packet.flags
                & (PACKET_FLAG_RELIABLE | PACKET_FLAG_UNRELIABLE_FRAGMENTED)
                == PACKET_FLAG_UNRELIABLE_FRAGMENTED
                && channel.outgoing_unreliable_sequence_number < 0xFFFF
            {
                (
                    COMMAND_SEND_UNRELIABLE_FRAGMENT,
                    channel.outgoing_unreliable_sequence_number.wrapping_add(1),
                )
            } else {
                (
                    COMMAND_SEND_FRAGMENT | COMMAND_FLAG_ACKNOWLEDGE,
                    channel.outgoing_reliable_sequence_number.wrapping_add(1),
                )
            };

            let total_length = packet.len() as u32;
            let mut fragment_number = 0u32;
            let mut fragment_offset = 0usize;

            while fragment_offset < packet.len() {
                let length = fragment_length.min(packet.len() - fragment_offset);

                let command = Command::new(
                    command_number,
                    channel_id,
                    CommandBody::SendFragment(FragmentCommand {
                        start_sequence_number,
                        data_length: length as u16,
                        fragment_count,
                        fragment_number,
                        total_length,
                        fragment_offset: fragment_offset as u32,
                    }),
                );

                // Every fragment holds a clone of the packet, so the payload
                // stays alive until the last fragment is acknowledged.
                target.queue_outgoing_command(
                    command,
                    Some(packet.clone()),
                    fragment_offset as u32,
                    length as u16,
                );

                fragment_number += 1;
                fragment_offset += length;
            }
        } else {
            let data_length = packet.len() as u16;
            let channel = &target.channels[channel_id as usize];

            let command = if packet.flags & (PACKET_FLAG_RELIABLE | PACKET_FLAG_UNSEQUENCED)
                == PACKET_FLAG_UNSEQUENCED
            {
                Command::new(
                    COMMAND_SEND_UNSEQUENCED | COMMAND_FLAG_UNSEQUENCED,
                    channel_id,
                    CommandBody::SendUnsequenced {
                        unsequenced_group: 0,
                        data_length,
                    },
                )
            } else if packet.is_reliable() || channel.outgoing_unreliable_sequence_number >= 0xFFFF
            {
                Command::new(
                    COMMAND_SEND_RELIABLE | COMMAND_FLAG_ACKNOWLEDGE,
                    channel_id,
                    CommandBody::SendReliable { data_length },
                )
            } else {
                Command::new(
                    COMMAND_SEND_UNRELIABLE,
                    channel_id,
                    CommandBody::SendUnreliable {
                        unreliable_sequence_number: 0,
                        data_length,
                    },
                )
            };

            let length = packet.len() as u16;
            target.queue_outgoing_command(command, Some(packet), 0, length);
        }

        if instant {
            self.flush(self.service_time);
        }

        Ok(())
    }

    /// Queue `packet` to every connected peer.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        self.broadcast_where(channel_id, packet, |_| true);
    }

    /// Queue `packet` to every connected peer except `excluded`.
    pub fn broadcast_exclude(&mut self, channel_id: u8, packet: Packet, excluded: PeerId) {
        self.broadcast_where(channel_id, packet, |peer| peer != excluded);
    }

    fn broadcast_where(&mut self, channel_id: u8, packet: Packet, keep: impl Fn(PeerId) -> bool) {
        for index in 0..self.peers.len() {
            if self.peers[index].state != PeerState::Connected {
                continue;
            }

            let id = PeerId {
                index: index as u16,
                generation: self.peers[index].generation,
            };

            if !keep(id) {
                continue;
            }

            let _ = self.send(id, channel_id, packet.clone());
        }
    }

    /// Gracefully disconnect: notify the peer and wait for the
    /// acknowledgement before tearing state down.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) -> CoreResult<()> {
        let index = self.resolve(peer)?;
        self.disconnect_index(index, data);
        Ok(())
    }

    /// Disconnect immediately: fire one unsequenced notice and forget the
    /// peer without waiting for a reply.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) -> CoreResult<()> {
        let index = self.resolve(peer)?;
        let state = self.peers[index].state;

        if state == PeerState::Disconnected {
            return Ok(());
        }

        if state != PeerState::Zombie && state != PeerState::Disconnecting {
            let target = &mut self.peers[index];
            target.reset_queues();

            let command = Command::new(
                COMMAND_DISCONNECT | COMMAND_FLAG_UNSEQUENCED,
                0xFF,
                CommandBody::Disconnect { data },
            );
            target.queue_outgoing_command(command, None, 0, 0);

            self.flush(self.service_time);
        }

        self.reset_peer(index);
        Ok(())
    }

    /// Disconnect once every queued outgoing command has been delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) -> CoreResult<()> {
        let index = self.resolve(peer)?;
        let target = &self.peers[index];

        if target.state.is_connected()
            && !(target.outgoing_commands.is_empty() && target.sent_reliable_commands.is_empty())
        {
            let target = &mut self.peers[index];
            target.state = PeerState::DisconnectLater;
            target.event_data = data;
        } else {
            self.disconnect_index(index, data);
        }

        Ok(())
    }

    /// Forget the peer locally with no notice to the remote side.
    pub fn reset(&mut self, peer: PeerId) -> CoreResult<()> {
        let index = self.resolve(peer)?;
        self.reset_peer(index);
        Ok(())
    }

    /// Force an out-of-band keepalive, refreshing RTT and the timeout clock.
    pub fn ping(&mut self, peer: PeerId) -> CoreResult<()> {
        let index = self.resolve(peer)?;
        self.ping_index(index);
        Ok(())
    }

    /// Set the keepalive interval in milliseconds (0 restores the default).
    pub fn set_ping_interval(&mut self, peer: PeerId, interval: u32) -> CoreResult<()> {
        let index = self.resolve(peer)?;
        self.peers[index].ping_interval = if interval != 0 {
            interval
        } else {
            crate::peer::PEER_PING_INTERVAL
        };
        Ok(())
    }

    /// Tune the failure-detection policy; 0 restores each default.
    pub fn set_timeout(
        &mut self,
        peer: PeerId,
        limit: u32,
        minimum: u32,
        maximum: u32,
    ) -> CoreResult<()> {
        let index = self.resolve(peer)?;
        let target = &mut self.peers[index];
        target.timeout_limit = if limit != 0 {
            limit
        } else {
            crate::peer::PEER_TIMEOUT_LIMIT
        };
        target.timeout_minimum = if minimum != 0 {
            minimum
        } else {
            crate::peer::PEER_TIMEOUT_MINIMUM
        };
        target.timeout_maximum = if maximum != 0 {
            maximum
        } else {
            crate::peer::PEER_TIMEOUT_MAXIMUM
        };
        Ok(())
    }

    /// Reconfigure the unreliable-traffic throttle and notify the remote
    /// side of the new parameters.
    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
        threshold: u32,
    ) -> CoreResult<()> {
        let index = self.resolve(peer)?;
        let target = &mut self.peers[index];

        target.packet_throttle_interval = interval;
        target.packet_throttle_acceleration = acceleration;
        target.packet_throttle_deceleration = deceleration;
        target.packet_throttle_threshold = threshold;

        let command = Command::new(
            COMMAND_THROTTLE_CONFIGURE | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::ThrottleConfigure {
                packet_throttle_interval: interval,
                packet_throttle_acceleration: acceleration,
                packet_throttle_deceleration: deceleration,
            },
        );
        target.queue_outgoing_command(command, None, 0, 0);

        Ok(())
    }

    /// Adjust the channel limit granted to future connections.
    pub fn set_channel_limit(&mut self, limit: usize) {
        self.channel_limit = if limit == 0 || limit > PROTOCOL_MAXIMUM_CHANNEL_COUNT {
            PROTOCOL_MAXIMUM_CHANNEL_COUNT
        } else {
            limit.max(PROTOCOL_MINIMUM_CHANNEL_COUNT)
        };
    }

    /// Adjust the host bandwidth caps; peers learn of the change through
    /// bandwidth-limit notices on the next throttle tick.
    pub fn set_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.incoming_bandwidth = incoming;
        self.outgoing_bandwidth = outgoing;
        self.recalculate_bandwidth_limits = true;
    }

    /// Refuse or allow new incoming connections.
    pub fn prevent_connections(&mut self, prevent: bool) {
        self.prevent_connections = prevent;
    }

    /// Attach an opaque application value to the peer slot.
    pub fn set_user_data(&mut self, peer: PeerId, data: u64) -> CoreResult<()> {
        let index = self.resolve(peer)?;
        self.peers[index].user_data = data;
        Ok(())
    }

    pub fn user_data(&self, peer: PeerId) -> CoreResult<u64> {
        Ok(self.peers[self.resolve(peer)?].user_data)
    }

    pub fn peer_state(&self, peer: PeerId) -> CoreResult<PeerState> {
        Ok(self.peers[self.resolve(peer)?].state)
    }

    pub fn peer_address(&self, peer: PeerId) -> CoreResult<Option<SocketAddr>> {
        Ok(self.peers[self.resolve(peer)?].address)
    }

    pub fn peer_round_trip_time(&self, peer: PeerId) -> CoreResult<u32> {
        Ok(self.peers[self.resolve(peer)?].round_trip_time)
    }

    pub fn peer_channel_count(&self, peer: PeerId) -> CoreResult<usize> {
        Ok(self.peers[self.resolve(peer)?].channels.len())
    }

    pub fn peer_stats(&self, peer: PeerId) -> CoreResult<PeerStats> {
        Ok(self.peers[self.resolve(peer)?].stats())
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            total_sent_data: self.total_sent_data,
            total_sent_packets: self.total_sent_packets,
            total_received_data: self.total_received_data,
            total_received_packets: self.total_received_packets,
            connected_peers: self.connected_peers,
        }
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    // ------------------------------------------------------------------
    // Service interface
    // ------------------------------------------------------------------

    /// Feed one received datagram into the engine. Malformed input is
    /// dropped without affecting other peers.
    pub fn input(&mut self, source: SocketAddr, datagram: Bytes, now: Timestamp) {
        self.service_time = now;
        self.total_received_data += datagram.len() as u64;
        self.total_received_packets += 1;

        self.handle_datagram(source, datagram);
    }

    /// Advance timers: the bandwidth throttle, retransmission timeouts,
    /// keepalives, and pending sends.
    pub fn update(&mut self, now: Timestamp) {
        self.service_time = now;

        if time_difference(self.service_time, self.bandwidth_throttle_epoch)
            >= HOST_BANDWIDTH_THROTTLE_INTERVAL
        {
            self.bandwidth_throttle();
        }

        self.send_outgoing_commands(true);
    }

    /// Push queued commands onto the wire without running timeout checks.
    pub fn flush(&mut self, now: Timestamp) {
        self.service_time = now;
        self.send_outgoing_commands(false);
    }

    /// Take every datagram queued for transmission.
    pub fn drain_outgoing(&mut self) -> Vec<(SocketAddr, Bytes)> {
        self.outgoing.drain(..).collect()
    }

    /// Earliest moment a peer needs timer service again, if any.
    pub fn next_timeout(&self) -> Option<Timestamp> {
        self.peers
            .iter()
            .filter(|peer| {
                !matches!(peer.state, PeerState::Disconnected | PeerState::Zombie)
                    && !peer.sent_reliable_commands.is_empty()
            })
            .map(|peer| peer.next_timeout)
            .min_by(|a, b| {
                if time_less(*a, *b) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
    }

    /// Drain one pending event, visiting peers with ready data in arrival
    /// order. Returns `None` once nothing further is deliverable.
    pub fn poll_event(&mut self) -> Option<Event> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }

        while let Some(index) = self.dispatch_queue.pop_front() {
            let index = index as usize;

            if !self.peers[index].needs_dispatch {
                continue;
            }

            self.peers[index].needs_dispatch = false;

            let id = PeerId {
                index: index as u16,
                generation: self.peers[index].generation,
            };

            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.change_state(index, PeerState::Connected);

                    let peer = &mut self.peers[index];
                    peer.total_data_sent = 0;
                    peer.total_data_received = 0;
                    peer.total_packets_sent = 0;
                    peer.total_packets_lost = 0;
                    let data = peer.event_data;

                    return Some(Event::Connect { peer: id, data });
                }
                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;
                    let data = self.peers[index].event_data;
                    self.reset_peer(index);

                    return Some(Event::Disconnect { peer: id, data });
                }
                PeerState::Connected => {
                    let peer = &mut self.peers[index];

                    let Some((channel_id, packet)) = peer.receive() else {
                        continue;
                    };

                    if !peer.dispatched_commands.is_empty() {
                        peer.needs_dispatch = true;
                        self.dispatch_queue.push_back(index as u16);
                    }

                    return Some(Event::Receive {
                        peer: id,
                        channel_id,
                        packet,
                    });
                }
                _ => {}
            }
        }

        None
    }

    // ------------------------------------------------------------------
    // Internal: peer lifecycle
    // ------------------------------------------------------------------

    fn resolve(&self, peer: PeerId) -> CoreResult<usize> {
        let index = peer.index as usize;

        if index >= self.peers.len() {
            return Err(CoreError::InvalidPeer);
        }

        // A stale generation means the connection this handle referred to is
        // gone and the slot was reused.
        if self.peers[index].generation != peer.generation {
            return Err(CoreError::NotConnected);
        }

        Ok(index)
    }

    fn on_connect(&mut self, index: usize) {
        if !self.peers[index].state.is_connected() {
            if self.peers[index].incoming_bandwidth != 0 {
                self.bandwidth_limited_peers += 1;
            }

            self.connected_peers += 1;
        }
    }

    fn on_disconnect(&mut self, index: usize) {
        if self.peers[index].state.is_connected() {
            if self.peers[index].incoming_bandwidth != 0 {
                self.bandwidth_limited_peers -= 1;
            }

            self.connected_peers -= 1;
        }
    }

    fn change_state(&mut self, index: usize, state: PeerState) {
        if state.is_connected() {
            self.on_connect(index);
        } else {
            self.on_disconnect(index);
        }

        self.peers[index].state = state;
    }

    fn dispatch_state(&mut self, index: usize, state: PeerState) {
        self.change_state(index, state);
        self.enqueue_dispatch(index);
    }

    fn enqueue_dispatch(&mut self, index: usize) {
        if !self.peers[index].needs_dispatch {
            self.peers[index].needs_dispatch = true;
            self.dispatch_queue.push_back(index as u16);
        }
    }

    /// Queue the peer for a Receive dispatch if it has undelivered data.
    fn check_dispatch(&mut self, index: usize) {
        if !self.peers[index].dispatched_commands.is_empty() {
            self.enqueue_dispatch(index);
        }
    }

    fn reset_peer(&mut self, index: usize) {
        self.on_disconnect(index);

        let mtu = self.mtu;
        let peer = &mut self.peers[index];
        peer.reset(mtu);
        peer.generation = peer.generation.wrapping_add(1);
    }

    fn disconnect_index(&mut self, index: usize, data: u32) {
        let state = self.peers[index].state;

        if matches!(
            state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return;
        }

        let target = &mut self.peers[index];
        target.reset_queues();

        let mut command_number = COMMAND_DISCONNECT;

        if state.is_connected() {
            command_number |= COMMAND_FLAG_ACKNOWLEDGE;
        } else {
            command_number |= COMMAND_FLAG_UNSEQUENCED;
        }

        let command = Command::new(command_number, 0xFF, CommandBody::Disconnect { data });
        target.queue_outgoing_command(command, None, 0, 0);

        if state.is_connected() {
            self.on_disconnect(index);
            self.peers[index].state = PeerState::Disconnecting;
        } else {
            self.flush(self.service_time);
            self.reset_peer(index);
        }
    }

    fn ping_index(&mut self, index: usize) {
        let target = &mut self.peers[index];

        if target.state != PeerState::Connected {
            return;
        }

        let command = Command::new(
            COMMAND_PING | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Ping,
        );
        target.queue_outgoing_command(command, None, 0, 0);
    }

    fn notify_connect(&mut self, index: usize) {
        self.recalculate_bandwidth_limits = true;

        let pending = if self.peers[index].state == PeerState::Connecting {
            PeerState::ConnectionSucceeded
        } else {
            PeerState::ConnectionPending
        };

        self.dispatch_state(index, pending);
    }

    fn notify_disconnect(&mut self, index: usize) {
        let state = self.peers[index].state;

        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }

        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            self.reset_peer(index);
        } else {
            let id = PeerId {
                index: index as u16,
                generation: self.peers[index].generation,
            };
            self.reset_peer(index);
            self.events.push_back(Event::Disconnect { peer: id, data: 0 });
        }
    }

    fn notify_disconnect_timeout(&mut self, index: usize) {
        let state = self.peers[index].state;

        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }

        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            self.reset_peer(index);
        } else {
            let id = PeerId {
                index: index as u16,
                generation: self.peers[index].generation,
            };
            self.reset_peer(index);
            self.events.push_back(Event::Timeout { peer: id });
        }
    }

    // ------------------------------------------------------------------
    // Internal: incoming datagram processing
    // ------------------------------------------------------------------

    fn handle_datagram(&mut self, source: SocketAddr, datagram: Bytes) {
        let mut buf = datagram.clone();

        let Some(header) = ProtocolHeader::decode(&mut buf) else {
            return;
        };

        let target_peer_id = header.target_peer_id();
        let session_id = header.session_id();

        let mut peer_index: Option<usize> = if target_peer_id == PROTOCOL_MAXIMUM_PEER_ID {
            None
        } else if target_peer_id as usize >= self.peers.len() {
            return;
        } else {
            let peer = &mut self.peers[target_peer_id as usize];

            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
                return;
            }

            if peer.address != Some(source) {
                return;
            }

            if peer.outgoing_peer_id < PROTOCOL_MAXIMUM_PEER_ID
                && session_id != peer.incoming_session_id
            {
                return;
            }

            peer.incoming_data_total = peer.incoming_data_total.wrapping_add(datagram.len() as u32);
            peer.total_data_received += datagram.len() as u64;

            Some(target_peer_id as usize)
        };

        while !buf.is_empty() {
            let Some(command) = Command::decode(&mut buf) else {
                break;
            };

            let payload_length = command.data_length();

            if payload_length > self.maximum_packet_size || payload_length > buf.len() {
                break;
            }

            let payload = buf.split_to(payload_length);

            let handled = if command.number() == COMMAND_CONNECT {
                if peer_index.is_some() {
                    None
                } else if self.prevent_connections {
                    Some(())
                } else if !buf.is_empty() {
                    // A connect from an unknown sender must stand alone.
                    None
                } else {
                    peer_index = self.handle_connect(source, &command);
                    peer_index.map(|_| ())
                }
            } else {
                // Anything but a connect needs an established peer.
                match peer_index {
                    None => None,
                    Some(index) => match command.number() {
                        COMMAND_ACKNOWLEDGE => self.handle_acknowledge(index, &command),
                        COMMAND_VERIFY_CONNECT => self.handle_verify_connect(index, &command),
                        COMMAND_DISCONNECT => self.handle_disconnect(index, &command),
                        COMMAND_PING => self.handle_ping(index),
                        COMMAND_SEND_RELIABLE => {
                            self.handle_send_reliable(index, &command, payload)
                        }
                        COMMAND_SEND_UNRELIABLE => {
                            self.handle_send_unreliable(index, &command, payload)
                        }
                        COMMAND_SEND_UNSEQUENCED => {
                            self.handle_send_unsequenced(index, &command, payload)
                        }
                        COMMAND_SEND_FRAGMENT => {
                            self.handle_send_fragment(index, &command, payload)
                        }
                        COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                            self.handle_send_unreliable_fragment(index, &command, payload)
                        }
                        COMMAND_BANDWIDTH_LIMIT => self.handle_bandwidth_limit(index, &command),
                        COMMAND_THROTTLE_CONFIGURE => {
                            self.handle_throttle_configure(index, &command)
                        }
                        _ => None,
                    },
                }
            };

            if handled.is_none() {
                trace!(%source, command = command.name(), "dropping rest of datagram");
                break;
            }

            let Some(index) = peer_index else {
                continue;
            };

            if command.wants_acknowledge() {
                let Some(sent_time) = header.sent_time else {
                    break;
                };

                let peer = &mut self.peers[index];

                match peer.state {
                    PeerState::Disconnecting
                    | PeerState::AcknowledgingConnect
                    | PeerState::Disconnected
                    | PeerState::Zombie => {}
                    PeerState::AcknowledgingDisconnect => {
                        if command.number() == COMMAND_DISCONNECT {
                            peer.queue_acknowledgement(&command.header, sent_time);
                        }
                    }
                    _ => {
                        peer.queue_acknowledgement(&command.header, sent_time);
                    }
                }
            }
        }
    }

    fn handle_connect(&mut self, source: SocketAddr, command: &Command) -> Option<usize> {
        let CommandBody::Connect(connect) = &command.body else {
            return None;
        };

        let channel_count = connect.channel_count as usize;

        if !(PROTOCOL_MINIMUM_CHANNEL_COUNT..=PROTOCOL_MAXIMUM_CHANNEL_COUNT)
            .contains(&channel_count)
        {
            return None;
        }

        let mut free_slot = None;
        let mut duplicate_peers = 0usize;

        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if free_slot.is_none() {
                    free_slot = Some(index);
                }
            } else if peer.state != PeerState::Connecting
                && peer.address.map(|a| a.ip()) == Some(source.ip())
            {
                if peer.address.map(|a| a.port()) == Some(source.port())
                    && peer.connect_id == connect.connect_id
                {
                    // Replayed connect for a connection we already hold.
                    return None;
                }

                duplicate_peers += 1;
            }
        }

        let index = free_slot?;

        if duplicate_peers >= self.max_duplicate_peers {
            warn!(%source, "refusing connect: too many connections from address");
            return None;
        }

        let channel_count = channel_count.min(self.channel_limit);
        let host_incoming_bandwidth = self.incoming_bandwidth;
        let host_outgoing_bandwidth = self.outgoing_bandwidth;

        let peer = &mut self.peers[index];
        peer.setup_channels(channel_count);
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = connect.connect_id;
        peer.address = Some(source);
        peer.outgoing_peer_id = connect.outgoing_peer_id;
        peer.incoming_bandwidth = connect.incoming_bandwidth;
        peer.outgoing_bandwidth = connect.outgoing_bandwidth;
        peer.packet_throttle_interval = connect.packet_throttle_interval;
        peer.packet_throttle_acceleration = connect.packet_throttle_acceleration;
        peer.packet_throttle_deceleration = connect.packet_throttle_deceleration;
        peer.event_data = connect.data;

        // Rotate session ids so datagrams from a previous incarnation of
        // this address pair are rejected.
        let session_shift = HEADER_SESSION_SHIFT;
        let session_mask = (HEADER_SESSION_MASK >> session_shift) as u8;

        let mut incoming_session_id = if connect.incoming_session_id == 0xFF {
            peer.outgoing_session_id
        } else {
            connect.incoming_session_id
        };
        incoming_session_id = incoming_session_id.wrapping_add(1) & session_mask;

        if incoming_session_id == peer.outgoing_session_id {
            incoming_session_id = incoming_session_id.wrapping_add(1) & session_mask;
        }

        peer.outgoing_session_id = incoming_session_id;

        let mut outgoing_session_id = if connect.outgoing_session_id == 0xFF {
            peer.incoming_session_id
        } else {
            connect.outgoing_session_id
        };
        outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_mask;

        if outgoing_session_id == peer.incoming_session_id {
            outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_mask;
        }

        peer.incoming_session_id = outgoing_session_id;

        peer.mtu = connect
            .mtu
            .clamp(PROTOCOL_MINIMUM_MTU, PROTOCOL_MAXIMUM_MTU);

        peer.window_size = if host_outgoing_bandwidth == 0 && peer.incoming_bandwidth == 0 {
            PROTOCOL_MAXIMUM_WINDOW_SIZE
        } else if host_outgoing_bandwidth == 0 || peer.incoming_bandwidth == 0 {
            (host_outgoing_bandwidth.max(peer.incoming_bandwidth) / PEER_WINDOW_SIZE_SCALE)
                * PROTOCOL_MINIMUM_WINDOW_SIZE
        } else {
            (host_outgoing_bandwidth.min(peer.incoming_bandwidth) / PEER_WINDOW_SIZE_SCALE)
                * PROTOCOL_MINIMUM_WINDOW_SIZE
        }
        .clamp(PROTOCOL_MINIMUM_WINDOW_SIZE, PROTOCOL_MAXIMUM_WINDOW_SIZE);

        let mut window_size = if host_incoming_bandwidth == 0 {
            PROTOCOL_MAXIMUM_WINDOW_SIZE
        } else {
            (host_incoming_bandwidth / PEER_WINDOW_SIZE_SCALE) * PROTOCOL_MINIMUM_WINDOW_SIZE
        };

        if window_size > connect.window_size {
            window_size = connect.window_size;
        }

        window_size = window_size.clamp(PROTOCOL_MINIMUM_WINDOW_SIZE, PROTOCOL_MAXIMUM_WINDOW_SIZE);

        let verify = Command::new(
            COMMAND_VERIFY_CONNECT | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::VerifyConnect(VerifyConnectCommand {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id,
                outgoing_session_id,
                mtu: peer.mtu,
                window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: host_incoming_bandwidth,
                outgoing_bandwidth: host_outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id: peer.connect_id,
            }),
        );

        peer.queue_outgoing_command(verify, None, 0, 0);

        debug!(peer = index, %source, channels = channel_count, "incoming connection");

        Some(index)
    }

    fn handle_verify_connect(&mut self, index: usize, command: &Command) -> Option<()> {
        let CommandBody::VerifyConnect(verify) = &command.body else {
            return None;
        };

        if self.peers[index].state != PeerState::Connecting {
            return Some(());
        }

        let channel_count = verify.channel_count as usize;

        {
            let peer = &self.peers[index];

            if !(PROTOCOL_MINIMUM_CHANNEL_COUNT..=PROTOCOL_MAXIMUM_CHANNEL_COUNT)
                .contains(&channel_count)
                || verify.packet_throttle_interval != peer.packet_throttle_interval
                || verify.packet_throttle_acceleration != peer.packet_throttle_acceleration
                || verify.packet_throttle_deceleration != peer.packet_throttle_deceleration
                || verify.connect_id != peer.connect_id
            {
                self.peers[index].event_data = 0;
                self.dispatch_state(index, PeerState::Zombie);

                return None;
            }
        }

        self.peers[index].remove_sent_reliable_command(1, 0xFF);

        let peer = &mut self.peers[index];

        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }

        peer.outgoing_peer_id = verify.outgoing_peer_id;
        peer.incoming_session_id = verify.incoming_session_id;
        peer.outgoing_session_id = verify.outgoing_session_id;

        let mtu = verify
            .mtu
            .clamp(PROTOCOL_MINIMUM_MTU, PROTOCOL_MAXIMUM_MTU);

        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        let window_size = verify
            .window_size
            .clamp(PROTOCOL_MINIMUM_WINDOW_SIZE, PROTOCOL_MAXIMUM_WINDOW_SIZE);

        if window_size < peer.window_size {
            peer.window_size = window_size;
        }

        peer.incoming_bandwidth = verify.incoming_bandwidth;
        peer.outgoing_bandwidth = verify.outgoing_bandwidth;

        self.notify_connect(index);

        Some(())
    }

    fn handle_acknowledge(&mut self, index: usize, command: &Command) -> Option<()> {
        let CommandBody::Acknowledge {
            received_reliable_sequence_number,
            received_sent_time,
        } = command.body
        else {
            return None;
        };

        if matches!(
            self.peers[index].state,
            PeerState::Disconnected | PeerState::Zombie
        ) {
            return Some(());
        }

        // Reconstruct the full 32-bit send time from its 16 echoed bits.
        let mut received_sent_time = received_sent_time as u32;
        received_sent_time |= self.service_time & 0xFFFF_0000;

        if (received_sent_time & 0x8000) > (self.service_time & 0x8000) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }

        if time_less(self.service_time, received_sent_time) {
            return Some(());
        }

        let round_trip_time = time_difference(self.service_time, received_sent_time).max(1);
        let service_time = self.service_time;

        let command_number = {
            let peer = &mut self.peers[index];

            peer.throttle(round_trip_time);
            peer.update_round_trip_time(round_trip_time);
            peer.update_throttle_epoch(service_time);

            peer.last_receive_time = service_time.max(1);
            peer.earliest_timeout = 0;

            peer.remove_sent_reliable_command(
                received_reliable_sequence_number,
                command.header.channel_id,
            )
        };

        match self.peers[index].state {
            PeerState::AcknowledgingConnect => {
                if command_number != COMMAND_VERIFY_CONNECT {
                    return None;
                }

                self.notify_connect(index);
            }
            PeerState::Disconnecting => {
                if command_number != COMMAND_DISCONNECT {
                    return None;
                }

                self.notify_disconnect(index);
            }
            PeerState::DisconnectLater => {
                let peer = &self.peers[index];

                if peer.outgoing_commands.is_empty() && peer.sent_reliable_commands.is_empty() {
                    let data = peer.event_data;
                    self.disconnect_index(index, data);
                }
            }
            _ => {}
        }

        Some(())
    }

    fn handle_disconnect(&mut self, index: usize, command: &Command) -> Option<()> {
        let CommandBody::Disconnect { data } = command.body else {
            return None;
        };

        let state = self.peers[index].state;

        if matches!(
            state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return Some(());
        }

        self.peers[index].reset_queues();

        if matches!(
            state,
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting
        ) {
            self.dispatch_state(index, PeerState::Zombie);
        } else if !state.is_connected() {
            if state == PeerState::ConnectionPending {
                self.recalculate_bandwidth_limits = true;
            }

            self.reset_peer(index);
        } else if command.wants_acknowledge() {
            self.change_state(index, PeerState::AcknowledgingDisconnect);
        } else {
            self.dispatch_state(index, PeerState::Zombie);
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }

        Some(())
    }

    fn handle_ping(&mut self, index: usize) -> Option<()> {
        if !self.peers[index].state.is_connected() {
            return None;
        }

        Some(())
    }

    fn handle_bandwidth_limit(&mut self, index: usize, command: &Command) -> Option<()> {
        let CommandBody::BandwidthLimit {
            incoming_bandwidth,
            outgoing_bandwidth,
        } = command.body
        else {
            return None;
        };

        if !self.peers[index].state.is_connected() {
            return None;
        }

        let host_outgoing_bandwidth = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];

        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers -= 1;
        }

        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;

        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers += 1;
        }

        peer.window_size = if peer.incoming_bandwidth == 0 && host_outgoing_bandwidth == 0 {
            PROTOCOL_MAXIMUM_WINDOW_SIZE
        } else if peer.incoming_bandwidth == 0 || host_outgoing_bandwidth == 0 {
            (peer.incoming_bandwidth.max(host_outgoing_bandwidth) / PEER_WINDOW_SIZE_SCALE)
                * PROTOCOL_MINIMUM_WINDOW_SIZE
        } else {
            (peer.incoming_bandwidth.min(host_outgoing_bandwidth) / PEER_WINDOW_SIZE_SCALE)
                * PROTOCOL_MINIMUM_WINDOW_SIZE
        }
        .clamp(PROTOCOL_MINIMUM_WINDOW_SIZE, PROTOCOL_MAXIMUM_WINDOW_SIZE);

        Some(())
    }

    fn handle_throttle_configure(&mut self, index: usize, command: &Command) -> Option<()> {
        let CommandBody::ThrottleConfigure {
            packet_throttle_interval,
            packet_throttle_acceleration,
            packet_throttle_deceleration,
        } = command.body
        else {
            return None;
        };

        if !self.peers[index].state.is_connected() {
            return None;
        }

        let peer = &mut self.peers[index];
        peer.packet_throttle_interval = packet_throttle_interval;
        peer.packet_throttle_acceleration = packet_throttle_acceleration;
        peer.packet_throttle_deceleration = packet_throttle_deceleration;

        Some(())
    }

    fn handle_send_reliable(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> Option<()> {
        let maximum_waiting_data = self.maximum_waiting_data;
        let peer = &mut self.peers[index];

        if command.header.channel_id as usize >= peer.channels.len()
            || !peer.state.is_connected()
        {
            return None;
        }

        let result = peer.queue_incoming_command(
            command.header.command,
            command.header.channel_id,
            command.header.reliable_sequence_number,
            0,
            IncomingPayload::Complete(payload),
            PACKET_FLAG_RELIABLE,
            0,
            maximum_waiting_data,
        );

        if result == IncomingResult::Refused {
            return None;
        }

        self.check_dispatch(index);

        Some(())
    }

    fn handle_send_unreliable(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> Option<()> {
        let CommandBody::SendUnreliable {
            unreliable_sequence_number,
            ..
        } = command.body
        else {
            return None;
        };

        let maximum_waiting_data = self.maximum_waiting_data;
        let peer = &mut self.peers[index];

        if command.header.channel_id as usize >= peer.channels.len()
            || !peer.state.is_connected()
        {
            return None;
        }

        let result = peer.queue_incoming_command(
            command.header.command,
            command.header.channel_id,
            command.header.reliable_sequence_number,
            unreliable_sequence_number,
            IncomingPayload::Complete(payload),
            0,
            0,
            maximum_waiting_data,
        );

        if result == IncomingResult::Refused {
            return None;
        }

        self.check_dispatch(index);

        Some(())
    }

    fn handle_send_unsequenced(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> Option<()> {
        let CommandBody::SendUnsequenced {
            unsequenced_group, ..
        } = command.body
        else {
            return None;
        };

        let maximum_waiting_data = self.maximum_waiting_data;
        let peer = &mut self.peers[index];

        if command.header.channel_id as usize >= peer.channels.len()
            || !peer.state.is_connected()
        {
            return None;
        }

        if peer.check_unsequenced_group(unsequenced_group) {
            return Some(());
        }

        let result = peer.queue_incoming_command(
            command.header.command,
            command.header.channel_id,
            0,
            0,
            IncomingPayload::Complete(payload),
            PACKET_FLAG_UNSEQUENCED,
            0,
            maximum_waiting_data,
        );

        if result == IncomingResult::Refused {
            return None;
        }

        self.check_dispatch(index);

        Some(())
    }

    fn handle_send_fragment(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> Option<()> {
        let CommandBody::SendFragment(fragment) = &command.body else {
            return None;
        };

        let maximum_waiting_data = self.maximum_waiting_data;
        let maximum_packet_size = self.maximum_packet_size;
        let channel_id = command.header.channel_id;
        let peer = &mut self.peers[index];

        if channel_id as usize >= peer.channels.len() || !peer.state.is_connected() {
            return None;
        }

        let start_sequence_number = fragment.start_sequence_number;

        if !peer.channels[channel_id as usize].in_free_window(start_sequence_number) {
            return Some(());
        }

        if fragment.fragment_count > PROTOCOL_MAXIMUM_FRAGMENT_COUNT
            || fragment.fragment_number >= fragment.fragment_count
            || fragment.total_length as usize > maximum_packet_size
            || fragment.fragment_offset >= fragment.total_length
            || fragment.data_length as u32 > fragment.total_length - fragment.fragment_offset
        {
            return None;
        }

        let start = {
            let channel = &peer.channels[channel_id as usize];
            let mut found = None;

            for (at, pending) in channel.incoming_reliable_commands.iter().enumerate().rev() {
                if start_sequence_number >= channel.incoming_reliable_sequence_number {
                    if pending.reliable_sequence_number < channel.incoming_reliable_sequence_number
                    {
                        continue;
                    }
                } else if pending.reliable_sequence_number
                    >= channel.incoming_reliable_sequence_number
                {
                    break;
                }

                if pending.reliable_sequence_number <= start_sequence_number {
                    if pending.reliable_sequence_number < start_sequence_number {
                        break;
                    }

                    if pending.number() != COMMAND_SEND_FRAGMENT
                        || fragment.total_length as usize != pending.data_len()
                        || fragment.fragment_count != pending.fragment_count
                    {
                        return None;
                    }

                    found = Some(at);
                    break;
                }
            }

            found
        };

        let start = match start {
            Some(at) => at,
            None => {
                let result = peer.queue_incoming_command(
                    command.header.command,
                    channel_id,
                    start_sequence_number,
                    0,
                    IncomingPayload::Assembling(BytesMut::zeroed(fragment.total_length as usize)),
                    PACKET_FLAG_RELIABLE,
                    fragment.fragment_count,
                    maximum_waiting_data,
                );

                if result != IncomingResult::Queued {
                    return if result == IncomingResult::Refused {
                        None
                    } else {
                        Some(())
                    };
                }

                let channel = &peer.channels[channel_id as usize];
                let found = channel
                    .incoming_reliable_commands
                    .iter()
                    .position(|pending| {
                        pending.reliable_sequence_number == start_sequence_number
                            && pending.number() == COMMAND_SEND_FRAGMENT
                    });

                match found {
                    Some(at) => at,
                    // Superseded by newer traffic in the same dispatch pass.
                    None => return Some(()),
                }
            }
        };

        let channel = &mut peer.channels[channel_id as usize];
        let pending = &mut channel.incoming_reliable_commands[start];

        if !pending.has_fragment(fragment.fragment_number) {
            let fragment_length =
                (fragment.data_length as usize).min(pending.data_len() - fragment.fragment_offset as usize);

            pending.store_fragment(
                fragment.fragment_number,
                fragment.fragment_offset as usize,
                &payload[..fragment_length.min(payload.len())],
            );

            if pending.fragments_remaining == 0 {
                channel.dispatch_ready_reliable(&mut peer.dispatched_commands);
            }
        }

        self.check_dispatch(index);

        Some(())
    }

    fn handle_send_unreliable_fragment(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> Option<()> {
        let CommandBody::SendUnreliableFragment(fragment) = &command.body else {
            return None;
        };

        let maximum_waiting_data = self.maximum_waiting_data;
        let maximum_packet_size = self.maximum_packet_size;
        let channel_id = command.header.channel_id;
        let peer = &mut self.peers[index];

        if channel_id as usize >= peer.channels.len() || !peer.state.is_connected() {
            return None;
        }

        let reliable_sequence_number = command.header.reliable_sequence_number;
        let start_sequence_number = fragment.start_sequence_number;

        if !peer.channels[channel_id as usize].in_free_window(reliable_sequence_number) {
            return Some(());
        }

        {
            let channel = &peer.channels[channel_id as usize];

            if reliable_sequence_number == channel.incoming_reliable_sequence_number
                && start_sequence_number <= channel.incoming_unreliable_sequence_number
            {
                return Some(());
            }
        }

        if fragment.fragment_count > PROTOCOL_MAXIMUM_FRAGMENT_COUNT
            || fragment.fragment_number >= fragment.fragment_count
            || fragment.total_length as usize > maximum_packet_size
            || fragment.fragment_offset >= fragment.total_length
            || fragment.data_length as u32 > fragment.total_length - fragment.fragment_offset
        {
            return None;
        }

        let start = {
            let channel = &peer.channels[channel_id as usize];
            let mut found = None;

            for (at, pending) in channel
                .incoming_unreliable_commands
                .iter()
                .enumerate()
                .rev()
            {
                if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                    if pending.reliable_sequence_number < channel.incoming_reliable_sequence_number
                    {
                        continue;
                    }
                } else if pending.reliable_sequence_number
                    >= channel.incoming_reliable_sequence_number
                {
                    break;
                }

                if pending.reliable_sequence_number < reliable_sequence_number {
                    break;
                }

                if pending.reliable_sequence_number > reliable_sequence_number {
                    continue;
                }

                if pending.unreliable_sequence_number <= start_sequence_number {
                    if pending.unreliable_sequence_number < start_sequence_number {
                        break;
                    }

                    if pending.number() != COMMAND_SEND_UNRELIABLE_FRAGMENT
                        || fragment.total_length as usize != pending.data_len()
                        || fragment.fragment_count != pending.fragment_count
                    {
                        return None;
                    }

                    found = Some(at);
                    break;
                }
            }

            found
        };

        let start = match start {
            Some(at) => at,
            None => {
                let result = peer.queue_incoming_command(
                    command.header.command,
                    channel_id,
                    reliable_sequence_number,
                    start_sequence_number,
                    IncomingPayload::Assembling(BytesMut::zeroed(fragment.total_length as usize)),
                    PACKET_FLAG_UNRELIABLE_FRAGMENTED,
                    fragment.fragment_count,
                    maximum_waiting_data,
                );

                if result != IncomingResult::Queued {
                    return if result == IncomingResult::Refused {
                        None
                    } else {
                        Some(())
                    };
                }

                let channel = &peer.channels[channel_id as usize];
                let found = channel
                    .incoming_unreliable_commands
                    .iter()
                    .position(|pending| {
                        pending.reliable_sequence_number == reliable_sequence_number
                            && pending.unreliable_sequence_number == start_sequence_number
                            && pending.number() == COMMAND_SEND_UNRELIABLE_FRAGMENT
                    });

                match found {
                    Some(at) => at,
                    // Superseded by newer traffic in the same dispatch pass.
                    None => return Some(()),
                }
            }
        };

        let channel = &mut peer.channels[channel_id as usize];
        let pending = &mut channel.incoming_unreliable_commands[start];

        if !pending.has_fragment(fragment.fragment_number) {
            let fragment_length = (fragment.data_length as usize)
                .min(pending.data_len() - fragment.fragment_offset as usize);

            pending.store_fragment(
                fragment.fragment_number,
                fragment.fragment_offset as usize,
                &payload[..fragment_length.min(payload.len())],
            );

            if pending.fragments_remaining == 0 {
                channel.dispatch_ready_unreliable(&mut peer.dispatched_commands);
            }
        }

        self.check_dispatch(index);

        Some(())
    }

    // ------------------------------------------------------------------
    // Internal: outgoing command transmission
    // ------------------------------------------------------------------

    fn send_outgoing_commands(&mut self, check_for_timeouts: bool) {
        self.continue_sending = true;

        while self.continue_sending {
            self.continue_sending = false;

            for index in 0..self.peers.len() {
                if matches!(
                    self.peers[index].state,
                    PeerState::Disconnected | PeerState::Zombie
                ) {
                    continue;
                }

                let mtu = self.peers[index].mtu as usize;
                let mut builder = DatagramBuilder::new(mtu);

                if !self.peers[index].acknowledgements.is_empty() {
                    self.send_acknowledgements(index, &mut builder);
                }

                if check_for_timeouts
                    && !self.peers[index].sent_reliable_commands.is_empty()
                    && time_greater_equal(self.service_time, self.peers[index].next_timeout)
                    && self.peers[index].check_timeouts(self.service_time)
                {
                    self.notify_disconnect_timeout(index);
                    continue;
                }

                let mut can_ping = true;

                if !self.peers[index].outgoing_commands.is_empty() {
                    can_ping = self.check_outgoing_commands(index, &mut builder);
                }

                if can_ping
                    && self.peers[index].sent_reliable_commands.is_empty()
                    && time_difference(self.service_time, self.peers[index].last_receive_time)
                        >= self.peers[index].ping_interval
                    && mtu - builder.packet_size >= command_size(COMMAND_PING)
                {
                    self.ping_index(index);
                    self.check_outgoing_commands(index, &mut builder);
                }

                // A drained queue completes a deferred disconnect; the
                // notice itself goes out on the next pass.
                let peer = &self.peers[index];

                if peer.state == PeerState::DisconnectLater
                    && peer.outgoing_commands.is_empty()
                    && peer.sent_reliable_commands.is_empty()
                    && peer.sent_unreliable_commands.is_empty()
                {
                    let data = peer.event_data;
                    self.disconnect_index(index, data);
                    self.continue_sending = true;
                }

                if builder.command_count == 0 {
                    continue;
                }

                self.emit_datagram(index, builder);
            }
        }
    }

    fn send_acknowledgements(&mut self, index: usize, builder: &mut DatagramBuilder) {
        loop {
            let mtu = self.peers[index].mtu as usize;

            if self.peers[index].acknowledgements.is_empty() {
                break;
            }

            if builder.command_count >= PROTOCOL_MAXIMUM_PACKET_COMMANDS
                || mtu - builder.packet_size < command_size(COMMAND_ACKNOWLEDGE)
            {
                self.continue_sending = true;
                break;
            }

            let peer = &mut self.peers[index];
            let acknowledgement = peer.acknowledgements.pop_front().expect("checked above");

            let command = Command {
                header: crate::protocol::CommandHeader {
                    command: COMMAND_ACKNOWLEDGE,
                    channel_id: acknowledgement.channel_id,
                    reliable_sequence_number: acknowledgement.reliable_sequence_number,
                },
                body: CommandBody::Acknowledge {
                    received_reliable_sequence_number: acknowledgement.reliable_sequence_number,
                    received_sent_time: acknowledgement.sent_time,
                },
            };

            command.encode(&mut builder.buf);
            builder.command_count += 1;
            builder.packet_size += command_size(COMMAND_ACKNOWLEDGE);

            // Acknowledging the remote's disconnect finishes the handshake.
            if acknowledgement.command_number == COMMAND_DISCONNECT {
                self.dispatch_state(index, PeerState::Zombie);
            }
        }
    }

    /// Move sendable commands from the peer's outgoing queue into the
    /// datagram, respecting the reliable window, the throttle window, and
    /// the datagram budget. Returns whether a keepalive ping is warranted.
    fn check_outgoing_commands(&mut self, index: usize, builder: &mut DatagramBuilder) -> bool {
        let service_time = self.service_time;
        let mut continue_sending = false;

        let peer = &mut self.peers[index];
        let mtu = peer.mtu as usize;
        let mut can_ping = true;
        let mut window_wrap = false;
        let mut window_exceeded = false;
        let mut at = 0usize;

        while at < peer.outgoing_commands.len() {
            let outgoing = &peer.outgoing_commands[at];
            let reliable = outgoing.command.wants_acknowledge();

            if reliable {
                let channel_id = outgoing.command.header.channel_id as usize;
                let reliable_window =
                    (outgoing.reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE) as u32;

                if channel_id < peer.channels.len() {
                    let channel = &peer.channels[channel_id];

                    if !window_wrap
                        && outgoing.send_attempts < 1
                        && outgoing.reliable_sequence_number % PEER_RELIABLE_WINDOW_SIZE == 0
                    {
                        let windows = PEER_RELIABLE_WINDOWS as u32;
                        let free_span = (1u32 << (PEER_FREE_RELIABLE_WINDOWS as u32 + 2)) - 1;
                        let wrap_mask = (free_span << reliable_window)
                            | (free_span >> (windows - reliable_window));

                        let previous_window =
                            ((reliable_window + windows - 1) % windows) as usize;

                        if channel.reliable_windows[previous_window] >= PEER_RELIABLE_WINDOW_SIZE
                            || channel.used_reliable_windows as u32 & wrap_mask != 0
                        {
                            window_wrap = true;
                        }
                    }

                    if window_wrap {
                        at += 1;
                        continue;
                    }
                }

                if outgoing.packet.is_some() {
                    if !window_exceeded {
                        let window_size =
                            (peer.packet_throttle * peer.window_size) / PEER_PACKET_THROTTLE_SCALE;

                        if peer.reliable_data_in_transit + outgoing.fragment_length as u32
                            > window_size.max(peer.mtu)
                        {
                            window_exceeded = true;
                        }
                    }

                    if window_exceeded {
                        at += 1;
                        continue;
                    }
                }

                can_ping = false;
            }

            let size = outgoing.command.size();

            if builder.command_count >= PROTOCOL_MAXIMUM_PACKET_COMMANDS
                || mtu - builder.packet_size < size
                || (outgoing.packet.is_some()
                    && mtu - builder.packet_size < size + outgoing.fragment_length as usize)
            {
                continue_sending = true;
                break;
            }

            let mut outgoing = peer.outgoing_commands.remove(at).expect("index in range");

            if reliable {
                let channel_id = outgoing.command.header.channel_id as usize;

                if channel_id < peer.channels.len() && outgoing.send_attempts < 1 {
                    let window =
                        (outgoing.reliable_sequence_number / PEER_RELIABLE_WINDOW_SIZE) as usize;
                    peer.channels[channel_id].used_reliable_windows |= 1 << window;
                    peer.channels[channel_id].reliable_windows[window] += 1;
                }

                outgoing.send_attempts += 1;

                if outgoing.round_trip_timeout == 0 {
                    outgoing.round_trip_timeout =
                        peer.round_trip_time + 4 * peer.round_trip_time_variance;
                    outgoing.round_trip_timeout_limit =
                        peer.timeout_limit * outgoing.round_trip_timeout;
                }

                if peer.sent_reliable_commands.is_empty() {
                    peer.next_timeout = service_time.wrapping_add(outgoing.round_trip_timeout);
                }

                outgoing.sent_time = service_time;
                builder.header_flags |= HEADER_FLAG_SENT_TIME;
                peer.reliable_data_in_transit += outgoing.fragment_length as u32;

                Self::encode_outgoing(&mut outgoing, builder, size);
                peer.total_packets_sent += 1;
                peer.sent_reliable_commands.push_back(outgoing);
            } else {
                if let Some(packet) = &outgoing.packet {
                    if outgoing.fragment_offset == 0 && packet.flags & PACKET_FLAG_UNTHROTTLED == 0
                    {
                        peer.packet_throttle_counter += PEER_PACKET_THROTTLE_COUNTER;
                        peer.packet_throttle_counter %= PEER_PACKET_THROTTLE_SCALE;

                        if peer.packet_throttle_counter > peer.packet_throttle {
                            // Locally drop this unreliable packet and every
                            // remaining fragment of it.
                            let reliable_sequence_number = outgoing.reliable_sequence_number;
                            let unreliable_sequence_number = outgoing.unreliable_sequence_number;

                            while at < peer.outgoing_commands.len() {
                                let next = &peer.outgoing_commands[at];

                                if next.reliable_sequence_number != reliable_sequence_number
                                    || next.unreliable_sequence_number
                                        != unreliable_sequence_number
                                {
                                    break;
                                }

                                peer.outgoing_commands.remove(at);
                            }

                            continue;
                        }
                    }
                }

                let has_packet = outgoing.packet.is_some();
                Self::encode_outgoing(&mut outgoing, builder, size);
                peer.total_packets_sent += 1;

                if has_packet {
                    peer.sent_unreliable_commands.push_back(outgoing);
                }
            }
        }

        if continue_sending {
            self.continue_sending = true;
        }

        can_ping
    }

    fn encode_outgoing(
        outgoing: &mut crate::peer::OutgoingCommand,
        builder: &mut DatagramBuilder,
        size: usize,
    ) {
        outgoing.command.encode(&mut builder.buf);
        builder.packet_size += size;
        builder.command_count += 1;

        if let Some(packet) = &outgoing.packet {
            let start = outgoing.fragment_offset as usize;
            let end = start + outgoing.fragment_length as usize;
            builder.buf.extend_from_slice(&packet.data[start..end]);
            builder.packet_size += outgoing.fragment_length as usize;
        }
    }

    fn emit_datagram(&mut self, index: usize, builder: DatagramBuilder) {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];

        let Some(address) = peer.address else {
            return;
        };

        let mut header_flags = builder.header_flags;

        let sent_time = if header_flags & HEADER_FLAG_SENT_TIME != 0 {
            Some((service_time & 0xFFFF) as u16)
        } else {
            None
        };

        if peer.outgoing_peer_id < PROTOCOL_MAXIMUM_PEER_ID {
            header_flags |= (peer.outgoing_session_id as u16) << HEADER_SESSION_SHIFT;
        }

        let header = ProtocolHeader {
            peer_id: peer.outgoing_peer_id | header_flags,
            sent_time,
        };

        let mut datagram = BytesMut::with_capacity(PROTOCOL_HEADER_SIZE + builder.buf.len());
        header.encode(&mut datagram);
        datagram.extend_from_slice(&builder.buf);

        peer.last_send_time = service_time;
        peer.total_data_sent += datagram.len() as u64;
        self.total_sent_data += datagram.len() as u64;
        self.total_sent_packets += 1;

        trace!(
            peer = index,
            %address,
            commands = builder.command_count,
            bytes = datagram.len(),
            "datagram out"
        );

        self.outgoing.push_back((address, datagram.freeze()));

        let should_disconnect = self.peers[index].remove_sent_unreliable_commands();

        if should_disconnect {
            let data = self.peers[index].event_data;
            self.disconnect_index(index, data);
        }
    }

    // ------------------------------------------------------------------
    // Internal: host bandwidth accounting
    // ------------------------------------------------------------------

    /// Once a second, split the host's outgoing bandwidth across peers by
    /// lowering the throttle ceiling of the ones consuming more than their
    /// share, and tell peers about changed incoming limits.
    fn bandwidth_throttle(&mut self) {
        let time_current = self.service_time;
        let elapsed_time = time_difference(time_current, self.bandwidth_throttle_epoch);
        let mut peers_remaining = self.connected_peers as u32;
        let mut data_total = u32::MAX;
        let mut bandwidth = u32::MAX;
        let mut throttle;
        let mut bandwidth_limit = 0u32;
        let mut needs_adjustment = self.bandwidth_limited_peers > 0;

        if elapsed_time < HOST_BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }

        if self.outgoing_bandwidth == 0 && self.incoming_bandwidth == 0 {
            return;
        }

        self.bandwidth_throttle_epoch = time_current;

        if peers_remaining == 0 {
            return;
        }

        if self.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = (self.outgoing_bandwidth as u64 * elapsed_time as u64 / 1000) as u32;

            for peer in &self.peers {
                if !peer.state.is_connected() {
                    continue;
                }

                data_total = data_total.wrapping_add(peer.outgoing_data_total);
            }
        }

        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;

            throttle = if data_total <= bandwidth {
                PEER_PACKET_THROTTLE_SCALE
            } else {
                (bandwidth * PEER_PACKET_THROTTLE_SCALE) / data_total
            };

            for peer in self.peers.iter_mut() {
                if !peer.state.is_connected()
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                let peer_bandwidth =
                    (peer.incoming_bandwidth as u64 * elapsed_time as u64 / 1000) as u32;

                if (throttle * peer.outgoing_data_total) / PEER_PACKET_THROTTLE_SCALE
                    <= peer_bandwidth
                {
                    continue;
                }

                peer.packet_throttle_limit =
                    ((peer_bandwidth * PEER_PACKET_THROTTLE_SCALE) / peer.outgoing_data_total)
                        .max(1);

                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }

                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                PEER_PACKET_THROTTLE_SCALE
            } else {
                (bandwidth * PEER_PACKET_THROTTLE_SCALE) / data_total
            };

            for peer in self.peers.iter_mut() {
                if !peer.state.is_connected()
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                peer.packet_throttle_limit = throttle;

                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }

                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;
            peers_remaining = self.connected_peers as u32;
            bandwidth = self.incoming_bandwidth;
            needs_adjustment = true;

            if bandwidth == 0 {
                bandwidth_limit = 0;
            } else {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;

                    for peer in self.peers.iter_mut() {
                        if !peer.state.is_connected()
                            || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }

                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }

                        peer.incoming_bandwidth_throttle_epoch = time_current;
                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.saturating_sub(peer.outgoing_bandwidth);
                    }
                }
            }

            let outgoing_bandwidth = self.outgoing_bandwidth;

            for peer in self.peers.iter_mut() {
                if !peer.state.is_connected() {
                    continue;
                }

                let incoming = if peer.incoming_bandwidth_throttle_epoch == time_current {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };

                let command = Command::new(
                    COMMAND_BANDWIDTH_LIMIT | COMMAND_FLAG_ACKNOWLEDGE,
                    0xFF,
                    CommandBody::BandwidthLimit {
                        incoming_bandwidth: incoming,
                        outgoing_bandwidth,
                    },
                );

                peer.queue_outgoing_command(command, None, 0, 0);
            }
        }
    }
}
