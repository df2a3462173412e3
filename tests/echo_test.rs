//! End-to-end tests over real localhost UDP sockets

use std::time::Duration;

use rudp_tokio::{Event, Host, HostConfig, Packet, PeerId, PeerState};

const TICK: Duration = Duration::from_millis(5);

/// Drive both hosts until the handshake completes on each side.
async fn connect_hosts(
    client: &mut Host,
    server: &mut Host,
    channels: usize,
    data: u32,
) -> (PeerId, PeerId) {
    let server_addr = server.local_addr().expect("bound socket");
    let client_peer = client
        .connect(server_addr, channels, data)
        .expect("free slot");

    let mut server_peer = None;
    let mut client_connected = false;

    for _ in 0..400 {
        if let Some(event) = client.service(TICK).await.expect("client service") {
            if matches!(event, Event::Connect { .. }) {
                client_connected = true;
            }
        }

        if let Some(event) = server.service(TICK).await.expect("server service") {
            if let Event::Connect { peer, data: seen } = event {
                assert_eq!(seen, data);
                server_peer = Some(peer);
            }
        }

        if client_connected && server_peer.is_some() {
            break;
        }
    }

    assert!(client_connected, "client handshake never completed");
    (
        client_peer,
        server_peer.expect("server handshake never completed"),
    )
}

#[tokio::test]
async fn connect_echo_disconnect_over_udp() {
    let mut server = Host::bind("127.0.0.1:0", HostConfig::new().peer_limit(4))
        .await
        .unwrap();
    let mut client = Host::client(HostConfig::new().peer_limit(1)).await.unwrap();

    let (client_peer, server_peer) = connect_hosts(&mut client, &mut server, 2, 7).await;

    assert_eq!(
        client.peer_state(client_peer).unwrap(),
        PeerState::Connected
    );

    // Client sends, server echoes, client observes the echo.
    client
        .send(client_peer, 0, Packet::reliable(&b"ping"[..]))
        .await
        .unwrap();

    let mut echoed = None;

    for _ in 0..400 {
        if let Some(Event::Receive { peer, packet, .. }) = server.service(TICK).await.unwrap() {
            server.send(peer, 0, packet).await.unwrap();
        }

        if let Some(Event::Receive { packet, .. }) = client.service(TICK).await.unwrap() {
            echoed = Some(packet);
            break;
        }
    }

    let echoed = echoed.expect("echo never arrived");
    assert_eq!(&echoed.data[..], b"ping");

    // Graceful teardown surfaces exactly one Disconnect per side.
    client.disconnect(client_peer, 3).await.unwrap();

    let mut client_gone = false;
    let mut server_gone = false;

    for _ in 0..400 {
        if let Some(Event::Disconnect { .. }) = client.service(TICK).await.unwrap() {
            client_gone = true;
        }

        if let Some(Event::Disconnect { peer, data }) = server.service(TICK).await.unwrap() {
            assert_eq!(peer, server_peer);
            assert_eq!(data, 3);
            server_gone = true;
        }

        if client_gone && server_gone {
            break;
        }
    }

    assert!(client_gone && server_gone);
    assert!(client
        .send(client_peer, 0, Packet::reliable(&b"late"[..]))
        .await
        .is_err());
}

#[tokio::test]
async fn check_events_drains_ready_events_without_io() {
    let mut server = Host::bind("127.0.0.1:0", HostConfig::new().peer_limit(4))
        .await
        .unwrap();
    let mut client = Host::client(HostConfig::new().peer_limit(1)).await.unwrap();

    let (_, server_peer) = connect_hosts(&mut client, &mut server, 1, 0).await;

    // Three small reliable packets coalesce into very few datagrams; the
    // client drains whatever arrived together without further I/O.
    for value in [b"one".as_slice(), b"two", b"three"] {
        server
            .send(server_peer, 0, Packet::reliable(value))
            .await
            .unwrap();
    }

    let mut received = Vec::new();

    for _ in 0..400 {
        if let Some(event) = client.service(TICK).await.unwrap() {
            if let Event::Receive { packet, .. } = event {
                received.push(packet.data.to_vec());
            }

            while let Some(event) = client.check_events() {
                if let Event::Receive { packet, .. } = event {
                    received.push(packet.data.to_vec());
                }
            }
        }

        if received.len() >= 3 {
            break;
        }

        // Keep the server's retransmission timers moving.
        let _ = server.service(TICK).await.unwrap();
    }

    assert_eq!(
        received,
        vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
    );
}

#[tokio::test]
async fn connect_wait_resolves_or_times_out() {
    let mut server = Host::bind("127.0.0.1:0", HostConfig::new().peer_limit(4))
        .await
        .unwrap();
    let server_addr = server.local_addr().unwrap();

    let mut client = Host::client(HostConfig::new().peer_limit(2)).await.unwrap();

    // Run the accepting side concurrently so the handshake can complete.
    let accept = tokio::spawn(async move {
        for _ in 0..1000 {
            if let Some(Event::Connect { .. }) = server.service(TICK).await.expect("server service")
            {
                return true;
            }
        }

        false
    });

    let peer = client
        .connect_wait(server_addr, 1, 0, Duration::from_secs(5))
        .await
        .expect("handshake");
    assert_eq!(client.peer_state(peer).unwrap(), PeerState::Connected);
    assert!(accept.await.unwrap());

    // The discard port has no listener; expect a timeout.
    let silent: std::net::SocketAddr = "127.0.0.1:9".parse().unwrap();
    let result = client
        .connect_wait(silent, 1, 0, Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(rudp_tokio::RudpError::Timeout { .. })));
}
