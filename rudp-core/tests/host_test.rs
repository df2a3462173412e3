//! Core-only integration tests — two engines wired back to back through an
//! in-memory datagram exchange with deterministic fault injection.

use std::net::SocketAddr;

use bytes::Bytes;
use rudp_core::{CoreError, Event, HostConfig, HostEngine, Packet, PeerState};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

struct Endpoint {
    engine: HostEngine,
    address: SocketAddr,
}

impl Endpoint {
    fn new(port: u16) -> Self {
        let config = HostConfig::new().peer_limit(8).seed(0x1234_5678 + port as u32);

        Self {
            engine: HostEngine::new(config).expect("valid config"),
            address: addr(port),
        }
    }

    fn events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();

        while let Some(event) = self.engine.poll_event() {
            events.push(event);
        }

        events
    }
}

/// Deterministic xorshift generator for reproducible fault patterns.
struct XorShift(u32);

impl XorShift {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    fn chance(&mut self, percent: u32) -> bool {
        self.next() % 100 < percent
    }
}

/// Tick both engines and exchange their datagrams; `keep` decides per
/// datagram whether the simulated network delivers it.
fn drive_filtered(
    a: &mut Endpoint,
    b: &mut Endpoint,
    now: u32,
    keep: &mut impl FnMut(&Bytes) -> bool,
) {
    a.engine.update(now);
    b.engine.update(now);

    for (destination, datagram) in a.engine.drain_outgoing() {
        if destination == b.address && keep(&datagram) {
            b.engine.input(a.address, datagram, now);
        }
    }

    for (destination, datagram) in b.engine.drain_outgoing() {
        if destination == a.address && keep(&datagram) {
            a.engine.input(b.address, datagram, now);
        }
    }
}

fn drive(a: &mut Endpoint, b: &mut Endpoint, now: u32) {
    drive_filtered(a, b, now, &mut |_| true);
}

/// Run the handshake to completion, returning (client handle, server handle).
fn connect_pair(
    client: &mut Endpoint,
    server: &mut Endpoint,
    channels: usize,
    data: u32,
    now: &mut u32,
) -> (rudp_core::PeerId, rudp_core::PeerId) {
    let client_peer = client
        .engine
        .connect(server.address, channels, data)
        .expect("free peer slot");

    let mut server_peer = None;
    let mut client_connected = false;

    for _ in 0..50 {
        *now += 10;
        drive(client, server, *now);

        for event in client.events() {
            if let Event::Connect { .. } = event {
                client_connected = true;
            }
        }

        for event in server.events() {
            if let Event::Connect { peer, data: seen } = event {
                assert_eq!(seen, data);
                server_peer = Some(peer);
            }
        }

        if client_connected && server_peer.is_some() {
            break;
        }
    }

    assert!(client_connected, "client never saw a Connect event");
    let server_peer = server_peer.expect("server never saw a Connect event");

    (client_peer, server_peer)
}

#[test]
fn handshake_completes_and_negotiates_channels() {
    let mut client = Endpoint::new(5001);
    let mut server = Endpoint::new(5002);
    let mut now = 0;

    let (client_peer, server_peer) = connect_pair(&mut client, &mut server, 2, 42, &mut now);

    assert_eq!(
        client.engine.peer_state(client_peer).unwrap(),
        PeerState::Connected
    );
    assert_eq!(
        server.engine.peer_state(server_peer).unwrap(),
        PeerState::Connected
    );
    assert_eq!(client.engine.peer_channel_count(client_peer).unwrap(), 2);
    assert_eq!(server.engine.peer_channel_count(server_peer).unwrap(), 2);
    assert_eq!(
        server.engine.peer_address(server_peer).unwrap(),
        Some(client.address)
    );
}

#[test]
fn reliable_delivery_survives_reordering_and_duplication() {
    let mut client = Endpoint::new(5011);
    let mut server = Endpoint::new(5012);
    let mut now = 0;

    let (client_peer, _) = connect_pair(&mut client, &mut server, 1, 0, &mut now);

    for value in 0u8..10 {
        client
            .engine
            .send(client_peer, 0, Packet::reliable(vec![value]))
            .unwrap();
    }

    let mut received = Vec::new();

    for _ in 0..100 {
        now += 10;

        // Deliver the client's datagrams reversed and duplicated.
        client.engine.update(now);
        let mut outgoing = client.engine.drain_outgoing();
        outgoing.reverse();

        for (destination, datagram) in outgoing {
            if destination == server.address {
                server.engine.input(client.address, datagram.clone(), now);
                server.engine.input(client.address, datagram, now);
            }
        }

        server.engine.update(now);

        for (destination, datagram) in server.engine.drain_outgoing() {
            if destination == client.address {
                client.engine.input(server.address, datagram, now);
            }
        }

        for event in server.events() {
            if let Event::Receive { packet, .. } = event {
                received.push(packet.data[0]);
            }
        }

        if received.len() >= 10 {
            break;
        }
    }

    // In order, no duplicates, no gaps.
    assert_eq!(received, (0u8..10).collect::<Vec<_>>());
}

#[test]
fn fragmented_reliable_transfer_survives_loss() {
    let mut client = Endpoint::new(5021);
    let mut server = Endpoint::new(5022);
    let mut now = 0;

    let (client_peer, _) = connect_pair(&mut client, &mut server, 2, 0, &mut now);

    // Well above the single-datagram threshold: must fragment.
    let payload: Vec<u8> = (0..10 * 1024).map(|i| (i * 7 % 251) as u8).collect();

    client
        .engine
        .send(client_peer, 0, Packet::reliable(payload.clone()))
        .unwrap();

    let mut rng = XorShift(0xBEEF_CAFE);
    let mut delivered = None;

    for _ in 0..400 {
        now += 10;
        drive_filtered(&mut client, &mut server, now, &mut |_| !rng.chance(5));

        for event in server.events() {
            if let Event::Receive {
                channel_id, packet, ..
            } = event
            {
                assert_eq!(channel_id, 0);
                delivered = Some(packet);
            }
        }

        if delivered.is_some() {
            break;
        }
    }

    let delivered = delivered.expect("fragmented packet never reassembled");
    assert_eq!(delivered.len(), payload.len());
    assert_eq!(&delivered.data[..], &payload[..]);
}

#[test]
fn unreliable_losses_are_not_retransmitted() {
    let mut client = Endpoint::new(5031);
    let mut server = Endpoint::new(5032);
    let mut now = 0;

    let (client_peer, _) = connect_pair(&mut client, &mut server, 2, 0, &mut now);

    let mut received = Vec::new();

    // One packet per tick so each rides its own datagram; the simulated
    // network eats the 3rd and 4th.
    for value in 1u8..=5 {
        client
            .engine
            .send(client_peer, 1, Packet::unreliable(vec![value]))
            .unwrap();

        now += 10;
        drive_filtered(&mut client, &mut server, now, &mut |_| {
            value != 3 && value != 4
        });

        for event in server.events() {
            if let Event::Receive {
                channel_id, packet, ..
            } = event
            {
                assert_eq!(channel_id, 1);
                received.push(packet.data[0]);
            }
        }
    }

    // Give retransmission a chance to (incorrectly) happen.
    for _ in 0..20 {
        now += 10;
        drive(&mut client, &mut server, now);

        for event in server.events() {
            if let Event::Receive { packet, .. } = event {
                received.push(packet.data[0]);
            }
        }
    }

    assert_eq!(received, vec![1, 2, 5]);
}

#[test]
fn sequenced_unreliable_drops_stale_packets() {
    let mut client = Endpoint::new(5041);
    let mut server = Endpoint::new(5042);
    let mut now = 0;

    let (client_peer, _) = connect_pair(&mut client, &mut server, 1, 0, &mut now);

    // Capture three sequenced packets as separate datagrams.
    let mut datagrams = Vec::new();

    for value in 1u8..=3 {
        client
            .engine
            .send(client_peer, 0, Packet::unreliable(vec![value]))
            .unwrap();

        now += 10;
        client.engine.update(now);

        for (destination, datagram) in client.engine.drain_outgoing() {
            assert_eq!(destination, server.address);
            datagrams.push(datagram);
        }
    }

    assert!(datagrams.len() >= 3);

    // Deliver newest first: packet 3 arrives, then 1 and 2 arrive late.
    now += 10;
    for datagram in datagrams.into_iter().rev() {
        server.engine.input(client.address, datagram, now);
    }

    let mut received = Vec::new();

    for event in server.events() {
        if let Event::Receive { packet, .. } = event {
            received.push(packet.data[0]);
        }
    }

    assert_eq!(received, vec![3], "stale sequenced packets must be dropped");
}

#[test]
fn unsequenced_duplicates_are_delivered_once() {
    let mut client = Endpoint::new(5051);
    let mut server = Endpoint::new(5052);
    let mut now = 0;

    let (client_peer, _) = connect_pair(&mut client, &mut server, 1, 0, &mut now);

    client
        .engine
        .send(client_peer, 0, Packet::unsequenced(vec![9u8]))
        .unwrap();

    now += 10;
    client.engine.update(now);
    let outgoing = client.engine.drain_outgoing();

    now += 10;
    for (_, datagram) in &outgoing {
        server.engine.input(client.address, datagram.clone(), now);
        server.engine.input(client.address, datagram.clone(), now);
    }

    let receives = server
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::Receive { .. }))
        .count();

    assert_eq!(receives, 1);
}

#[test]
fn graceful_disconnect_yields_one_event_per_side() {
    let mut client = Endpoint::new(5061);
    let mut server = Endpoint::new(5062);
    let mut now = 0;

    let (client_peer, server_peer) = connect_pair(&mut client, &mut server, 1, 0, &mut now);

    client.engine.disconnect(client_peer, 77).unwrap();

    let mut client_disconnects = Vec::new();
    let mut server_disconnects = Vec::new();

    for _ in 0..50 {
        now += 10;
        drive(&mut client, &mut server, now);

        for event in client.events() {
            if let Event::Disconnect { data, .. } = event {
                client_disconnects.push(data);
            }
        }

        for event in server.events() {
            if let Event::Disconnect { data, .. } = event {
                server_disconnects.push(data);
            }
        }
    }

    assert_eq!(client_disconnects.len(), 1);
    assert_eq!(server_disconnects, vec![77]);

    // Both handles are dead now.
    assert_eq!(
        client
            .engine
            .send(client_peer, 0, Packet::reliable(vec![1]))
            .unwrap_err(),
        CoreError::NotConnected
    );
    assert!(server
        .engine
        .send(server_peer, 0, Packet::reliable(vec![1]))
        .is_err());
}

#[test]
fn unresponsive_peer_times_out_exactly_once() {
    let mut client = Endpoint::new(5071);
    let mut server = Endpoint::new(5072);
    let mut now = 0;

    let (client_peer, _) = connect_pair(&mut client, &mut server, 1, 0, &mut now);

    // The server falls off the network: its datagrams stop arriving and it
    // is no longer driven at all.
    let mut timeouts = 0;

    for _ in 0..200 {
        now += 250;
        client.engine.update(now);
        client.engine.drain_outgoing();

        for event in client.events() {
            match event {
                Event::Timeout { peer } => {
                    assert_eq!(peer, client_peer);
                    timeouts += 1;
                }
                Event::Disconnect { .. } => panic!("expected a timeout, not a disconnect"),
                _ => {}
            }
        }
    }

    assert_eq!(timeouts, 1);
    assert_eq!(
        client
            .engine
            .send(client_peer, 0, Packet::reliable(vec![1]))
            .unwrap_err(),
        CoreError::NotConnected
    );
}

#[test]
fn connect_attempt_to_silent_address_times_out() {
    let mut client = Endpoint::new(5081);
    let mut now = 0;

    let peer = client.engine.connect(addr(5999), 1, 0).unwrap();
    assert_eq!(
        client.engine.peer_state(peer).unwrap(),
        PeerState::Connecting
    );

    let mut timeouts = 0;

    for _ in 0..200 {
        now += 250;
        client.engine.update(now);
        client.engine.drain_outgoing();

        for event in client.events() {
            if let Event::Timeout { .. } = event {
                timeouts += 1;
            }
        }
    }

    assert_eq!(timeouts, 1);
}

#[test]
fn broadcast_reaches_every_connected_peer() {
    let mut server = Endpoint::new(5091);
    let mut alpha = Endpoint::new(5092);
    let mut beta = Endpoint::new(5093);
    let mut now = 0;

    let (_, _) = connect_pair(&mut alpha, &mut server, 1, 0, &mut now);
    let (_, _) = connect_pair(&mut beta, &mut server, 1, 0, &mut now);

    server.engine.broadcast(0, Packet::reliable(&b"all"[..]));

    let mut alpha_got = false;
    let mut beta_got = false;

    for _ in 0..50 {
        now += 10;
        drive(&mut server, &mut alpha, now);
        drive(&mut server, &mut beta, now);

        for event in alpha.events() {
            if let Event::Receive { packet, .. } = event {
                assert_eq!(&packet.data[..], b"all");
                alpha_got = true;
            }
        }

        for event in beta.events() {
            if let Event::Receive { packet, .. } = event {
                assert_eq!(&packet.data[..], b"all");
                beta_got = true;
            }
        }

        if alpha_got && beta_got {
            break;
        }
    }

    assert!(alpha_got && beta_got);
}

#[test]
fn send_rejects_invalid_channel_and_oversized_packets() {
    let config = HostConfig::new()
        .peer_limit(8)
        .maximum_packet_size(1024)
        .seed(0x5101);
    let mut client = Endpoint {
        engine: HostEngine::new(config).unwrap(),
        address: addr(5101),
    };
    let mut server = Endpoint::new(5102);
    let mut now = 0;

    let (client_peer, _) = connect_pair(&mut client, &mut server, 2, 0, &mut now);

    assert_eq!(
        client
            .engine
            .send(client_peer, 2, Packet::reliable(vec![0]))
            .unwrap_err(),
        CoreError::InvalidChannel
    );

    assert_eq!(
        client
            .engine
            .send(client_peer, 0, Packet::reliable(vec![0u8; 2048]))
            .unwrap_err(),
        CoreError::PacketTooLarge
    );
}

#[test]
fn connect_fails_when_no_slot_is_free() {
    let config = HostConfig::new().peer_limit(1);
    let mut host = HostEngine::new(config).unwrap();

    host.connect(addr(6001), 1, 0).unwrap();
    assert_eq!(
        host.connect(addr(6002), 1, 0).unwrap_err(),
        CoreError::PeerLimitReached
    );
}

#[test]
fn statistics_accumulate_during_transfer() {
    let mut client = Endpoint::new(5111);
    let mut server = Endpoint::new(5112);
    let mut now = 0;

    let (client_peer, _) = connect_pair(&mut client, &mut server, 1, 0, &mut now);

    client
        .engine
        .send(client_peer, 0, Packet::reliable(&b"stats"[..]))
        .unwrap();

    for _ in 0..20 {
        now += 10;
        drive(&mut client, &mut server, now);
        server.events();
        client.events();
    }

    let host_stats = client.engine.stats();
    assert!(host_stats.total_sent_packets > 0);
    assert!(host_stats.total_sent_data > 0);
    assert_eq!(host_stats.connected_peers, 1);

    let peer_stats = client.engine.peer_stats(client_peer).unwrap();
    assert!(peer_stats.total_data_sent > 0);
    assert!(peer_stats.round_trip_time > 0);
}
