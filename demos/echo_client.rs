//! Echo client: connects, sends a few packets in each delivery mode, and
//! prints what comes back.
//!
//! Run with: `cargo run --example echo_client -- 127.0.0.1:7500`

use std::time::Duration;

use rudp_tokio::{Event, Host, HostConfig, Packet};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7500".to_string())
        .parse()?;

    let mut host = Host::client(HostConfig::new().peer_limit(1)).await?;
    let peer = host
        .connect_wait(addr, 2, 0, Duration::from_secs(5))
        .await?;

    println!("connected to {addr} (rtt {}ms)", host.peer_round_trip_time(peer)?);

    host.send(peer, 0, Packet::reliable(&b"reliable hello"[..]))
        .await?;
    host.send(peer, 1, Packet::unreliable(&b"sequenced hello"[..]))
        .await?;
    host.send(peer, 1, Packet::unsequenced(&b"unsequenced hello"[..]))
        .await?;

    let mut replies = 0;

    while replies < 3 {
        match host.service(Duration::from_millis(20)).await? {
            Some(Event::Receive {
                channel_id, packet, ..
            }) => {
                println!(
                    "reply on channel {}: {}",
                    channel_id,
                    String::from_utf8_lossy(&packet.data)
                );
                replies += 1;
            }
            Some(Event::Disconnect { .. }) | Some(Event::Timeout { .. }) => {
                eprintln!("connection lost");
                break;
            }
            _ => {}
        }
    }

    host.disconnect(peer, 0).await?;

    // Let the disconnect handshake finish.
    for _ in 0..50 {
        if let Some(Event::Disconnect { .. }) = host.service(Duration::from_millis(20)).await? {
            break;
        }
    }

    println!(
        "stats: {} datagrams sent, {} received",
        host.stats().total_sent_packets,
        host.stats().total_received_packets
    );

    Ok(())
}
