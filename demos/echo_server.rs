//! Echo server: accepts connections and mirrors every packet back on the
//! channel it arrived on.
//!
//! Run with: `cargo run --example echo_server -- 127.0.0.1:7500`

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
        .unwrap_or_else(|| "127.0.0.1:7500".to_string());

    let config = HostConfig::new().peer_limit(64).channel_limit(8);
    let mut host = Host::bind(addr.as_str(), config).await?;

    println!("echo server listening on {}", host.local_addr()?);

    loop {
        match host.service(Duration::from_millis(20)).await? {
            Some(Event::Connect { peer, data }) => {
                println!("peer {} connected (data {})", peer.index(), data);
            }
            Some(Event::Receive {
                peer,
                channel_id,
                packet,
            }) => {
                let reply = if packet.is_reliable() {
                    Packet::reliable(packet.data.clone())
                } else {
                    Packet::unreliable(packet.data.clone())
                };

                host.send(peer, channel_id, reply).await?;
            }
            Some(Event::Disconnect { peer, data }) => {
                println!("peer {} disconnected (data {})", peer.index(), data);
            }
            Some(Event::Timeout { peer }) => {
                println!("peer {} timed out", peer.index());
            }
            None => {}
        }
    }
}
