//! Async host driving the protocol engine over a datagram transport
//!
//! [`Host`] pairs a [`HostEngine`] with a [`Datagram`] transport and a
//! monotonic millisecond clock. `service` is the single suspension point:
//! it pushes queued traffic out, waits for datagrams up to the caller's
//! deadline, and surfaces at most one event per call. Nothing runs in the
//! background — the protocol only makes progress while the application
//! polls, so the host composes with any scheduling loop the application
//! already has.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rudp_core::{Event, HostConfig, HostEngine, HostStats, Packet, PeerId, PeerState, PeerStats};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::{Result, RudpError};
use crate::metrics;
use crate::transport::{Datagram, UdpDatagram};
use std::collections::VecDeque;

/// Largest datagram the receive path accepts; oversized ones are truncated
/// by the transport and dropped by the engine's framing checks.
const RECEIVE_BUFFER_SIZE: usize = 4096;

/// One transport endpoint: a bound (or outgoing-only) socket, a peer
/// table, and the polling interface that drives the protocol.
pub struct Host<T: Datagram = UdpDatagram> {
    engine: HostEngine,
    transport: Arc<T>,
    started: Instant,
    recv_buf: Vec<u8>,
    deferred_events: VecDeque<Event>,
    last_stats: HostStats,
}

impl Host<UdpDatagram> {
    /// Bind a listening host to `addr`.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs, config: HostConfig) -> Result<Self> {
        let transport = UdpDatagram::bind(addr).await.map_err(RudpError::Io)?;
        Self::with_transport(Arc::new(transport), config)
    }

    /// Create an outgoing-only host on an ephemeral port.
    pub async fn client(config: HostConfig) -> Result<Self> {
        Self::bind("0.0.0.0:0", config).await
    }
}

impl<T: Datagram> Host<T> {
    /// Create a host over a custom [`Datagram`] transport.
    pub fn with_transport(transport: Arc<T>, config: HostConfig) -> Result<Self> {
        // Mix clock entropy into the connect-id seed so two hosts created
        // from the same configuration do not generate colliding ids.
        let mut config = config;
        config.seed ^= std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u32)
            .unwrap_or(0);

        let engine = HostEngine::new(config)?;

        metrics::global_metrics().host_created();

        if let Ok(addr) = transport.local_addr() {
            info!(%addr, "host created");
        }

        Ok(Self {
            engine,
            transport,
            started: Instant::now(),
            recv_buf: vec![0u8; RECEIVE_BUFFER_SIZE],
            deferred_events: VecDeque::new(),
            last_stats: HostStats::default(),
        })
    }

    /// The transport's local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr().map_err(RudpError::Io)
    }

    /// Wrapping millisecond clock used for all protocol timestamps.
    fn now(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    // ------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------

    /// Begin connecting to `address`; completion arrives as a later
    /// [`Event::Connect`] from [`Host::service`].
    pub fn connect(&mut self, address: SocketAddr, channels: usize, data: u32) -> Result<PeerId> {
        Ok(self.engine.connect(address, channels, data)?)
    }

    /// Connect and drive the host until the handshake completes or
    /// `timeout` elapses. Events for other peers are deferred, not lost.
    pub async fn connect_wait(
        &mut self,
        address: SocketAddr,
        channels: usize,
        data: u32,
        timeout: Duration,
    ) -> Result<PeerId> {
        let peer = self.engine.connect(address, channels, data)?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                let _ = self.engine.reset(peer);

                return Err(RudpError::timeout(timeout.as_millis() as u64));
            }

            let slice = remaining.min(Duration::from_millis(50));

            match self.service(slice).await? {
                Some(Event::Connect {
                    peer: connected, ..
                }) if connected == peer => {
                    return Ok(peer);
                }
                Some(Event::Timeout { peer: failed }) if failed == peer => {
                    return Err(RudpError::timeout(timeout.as_millis() as u64));
                }
                Some(other) => self.deferred_events.push_back(other),
                None => {}
            }
        }
    }

    /// Queue `packet` on `channel` toward `peer`.
    pub async fn send(&mut self, peer: PeerId, channel: u8, packet: Packet) -> Result<()> {
        let instant = packet.flags & rudp_core::PACKET_FLAG_INSTANT != 0;

        self.engine.send(peer, channel, packet)?;

        if instant {
            self.pump().await?;
        }

        Ok(())
    }

    /// Queue `packet` to every connected peer.
    pub fn broadcast(&mut self, channel: u8, packet: Packet) {
        self.engine.broadcast(channel, packet);
    }

    /// Queue `packet` to every connected peer except `excluded`.
    pub fn broadcast_exclude(&mut self, channel: u8, packet: Packet, excluded: PeerId) {
        self.engine.broadcast_exclude(channel, packet, excluded);
    }

    /// Gracefully disconnect `peer`; completion arrives as a Disconnect
    /// event once the remote side acknowledges.
    pub async fn disconnect(&mut self, peer: PeerId, data: u32) -> Result<()> {
        self.engine.disconnect(peer, data)?;
        self.pump().await
    }

    /// Notify the peer once and forget it immediately.
    pub async fn disconnect_now(&mut self, peer: PeerId, data: u32) -> Result<()> {
        self.engine.disconnect_now(peer, data)?;
        self.pump().await
    }

    /// Disconnect after the outgoing queue drains.
    pub async fn disconnect_later(&mut self, peer: PeerId, data: u32) -> Result<()> {
        self.engine.disconnect_later(peer, data)?;
        self.pump().await
    }

    /// Forget `peer` locally with no notice on the wire.
    pub fn reset(&mut self, peer: PeerId) -> Result<()> {
        Ok(self.engine.reset(peer)?)
    }

    /// Force a keepalive ping.
    pub async fn ping(&mut self, peer: PeerId) -> Result<()> {
        self.engine.ping(peer)?;
        self.pump().await
    }

    pub fn set_ping_interval(&mut self, peer: PeerId, interval: u32) -> Result<()> {
        Ok(self.engine.set_ping_interval(peer, interval)?)
    }

    pub fn set_timeout(
        &mut self,
        peer: PeerId,
        limit: u32,
        minimum: u32,
        maximum: u32,
    ) -> Result<()> {
        Ok(self.engine.set_timeout(peer, limit, minimum, maximum)?)
    }

    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
        threshold: u32,
    ) -> Result<()> {
        Ok(self
            .engine
            .throttle_configure(peer, interval, acceleration, deceleration, threshold)?)
    }

    pub fn set_channel_limit(&mut self, limit: usize) {
        self.engine.set_channel_limit(limit);
    }

    pub fn set_bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.engine.set_bandwidth_limit(incoming, outgoing);
    }

    pub fn prevent_connections(&mut self, prevent: bool) {
        self.engine.prevent_connections(prevent);
    }

    pub fn set_user_data(&mut self, peer: PeerId, data: u64) -> Result<()> {
        Ok(self.engine.set_user_data(peer, data)?)
    }

    pub fn user_data(&self, peer: PeerId) -> Result<u64> {
        Ok(self.engine.user_data(peer)?)
    }

    pub fn peer_state(&self, peer: PeerId) -> Result<PeerState> {
        Ok(self.engine.peer_state(peer)?)
    }

    pub fn peer_address(&self, peer: PeerId) -> Result<Option<SocketAddr>> {
        Ok(self.engine.peer_address(peer)?)
    }

    pub fn peer_round_trip_time(&self, peer: PeerId) -> Result<u32> {
        Ok(self.engine.peer_round_trip_time(peer)?)
    }

    pub fn peer_stats(&self, peer: PeerId) -> Result<PeerStats> {
        Ok(self.engine.peer_stats(peer)?)
    }

    pub fn stats(&self) -> HostStats {
        self.engine.stats()
    }

    // ------------------------------------------------------------------
    // Service loop
    // ------------------------------------------------------------------

    /// Drive the protocol and wait up to `timeout` for an event.
    ///
    /// Flushes queued traffic, advances retransmission and keepalive
    /// timers, then blocks on the socket until something arrives or the
    /// deadline passes. Returns the first ready event; further ready
    /// events are drained with [`Host::check_events`].
    pub async fn service(&mut self, timeout: Duration) -> Result<Option<Event>> {
        if let Some(event) = self.next_event() {
            return Ok(Some(event));
        }

        let now = self.now();
        self.engine.update(now);
        self.pump().await?;

        if let Some(event) = self.next_event() {
            self.record_traffic();
            return Ok(Some(event));
        }

        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                break;
            }

            let received = {
                let transport = &self.transport;

                match tokio::time::timeout(remaining, transport.recv_from(&mut self.recv_buf))
                    .await
                {
                    Err(_) => None,
                    Ok(result) => Some(result.map_err(RudpError::Io)?),
                }
            };

            let Some((length, source)) = received else {
                break;
            };

            trace!(%source, bytes = length, "datagram in");

            let now = self.now();
            let datagram = Bytes::copy_from_slice(&self.recv_buf[..length]);
            self.engine.input(source, datagram, now);
            self.engine.update(now);
            self.pump().await?;

            if let Some(event) = self.next_event() {
                self.record_traffic();
                return Ok(Some(event));
            }
        }

        self.record_traffic();

        Ok(None)
    }

    /// Drain one already-queued event without touching the network.
    pub fn check_events(&mut self) -> Option<Event> {
        self.next_event()
    }

    /// Push all queued outgoing commands onto the wire immediately.
    pub async fn flush(&mut self) -> Result<()> {
        let now = self.now();
        self.engine.flush(now);
        self.pump().await
    }

    /// Send every datagram the engine has queued.
    async fn pump(&mut self) -> Result<()> {
        for (destination, datagram) in self.engine.drain_outgoing() {
            self.transport
                .send_to(&datagram, destination)
                .await
                .map_err(RudpError::Io)?;
        }

        Ok(())
    }

    fn next_event(&mut self) -> Option<Event> {
        if let Some(event) = self.deferred_events.pop_front() {
            return Some(event);
        }

        let event = self.engine.poll_event()?;

        match &event {
            Event::Connect { peer, .. } => {
                debug!(peer = peer.index(), "peer connected");
                metrics::global_metrics().peer_connected();
            }
            Event::Disconnect { peer, .. } => {
                debug!(peer = peer.index(), "peer disconnected");
                metrics::global_metrics().peer_disconnected();
            }
            Event::Timeout { peer } => {
                debug!(peer = peer.index(), "peer timed out");
                metrics::global_metrics().peer_disconnected();
            }
            Event::Receive { .. } => {}
        }

        Some(event)
    }

    /// Fold this host's counter growth into the global metrics.
    fn record_traffic(&mut self) {
        let current = self.engine.stats();

        metrics::global_metrics().record_traffic(
            current.total_sent_data - self.last_stats.total_sent_data,
            current.total_sent_packets - self.last_stats.total_sent_packets,
            current.total_received_data - self.last_stats.total_received_data,
            current.total_received_packets - self.last_stats.total_received_packets,
        );

        self.last_stats = current;
    }
}
