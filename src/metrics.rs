//! Process-wide metrics and per-peer monitoring

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rudp_core::HostStats;

/// Global traffic counters aggregated across every host in the process.
#[derive(Debug)]
pub struct GlobalMetrics {
    /// Total hosts created
    pub hosts_created: AtomicU64,
    /// Peers currently connected across all hosts
    pub active_peers: AtomicUsize,
    /// Total peers that completed a handshake
    pub peers_connected: AtomicU64,
    /// Total bytes sent across all hosts
    pub total_bytes_sent: AtomicU64,
    /// Total bytes received across all hosts
    pub total_bytes_received: AtomicU64,
    /// Total datagrams sent
    pub total_packets_sent: AtomicU64,
    /// Total datagrams received
    pub total_packets_received: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self {
            hosts_created: AtomicU64::new(0),
            active_peers: AtomicUsize::new(0),
            peers_connected: AtomicU64::new(0),
            total_bytes_sent: AtomicU64::new(0),
            total_bytes_received: AtomicU64::new(0),
            total_packets_sent: AtomicU64::new(0),
            total_packets_received: AtomicU64::new(0),
        }
    }
}

impl GlobalMetrics {
    /// Record a new host
    pub fn host_created(&self) {
        self.hosts_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed handshake
    pub fn peer_connected(&self) {
        self.peers_connected.fetch_add(1, Ordering::Relaxed);
        self.active_peers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a disconnect or timeout
    pub fn peer_disconnected(&self) {
        let _ = self
            .active_peers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            });
    }

    /// Fold one host's counters into the global totals.
    ///
    /// Host counters are monotonic, so callers pass the delta since the
    /// last update.
    pub fn record_traffic(&self, sent_data: u64, sent_packets: u64, recv_data: u64, recv_packets: u64) {
        self.total_bytes_sent.fetch_add(sent_data, Ordering::Relaxed);
        self.total_packets_sent.fetch_add(sent_packets, Ordering::Relaxed);
        self.total_bytes_received.fetch_add(recv_data, Ordering::Relaxed);
        self.total_packets_received
            .fetch_add(recv_packets, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hosts_created: self.hosts_created.load(Ordering::Relaxed),
            active_peers: self.active_peers.load(Ordering::Relaxed),
            peers_connected: self.peers_connected.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            total_packets_sent: self.total_packets_sent.load(Ordering::Relaxed),
            total_packets_received: self.total_packets_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of global metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub hosts_created: u64,
    pub active_peers: usize,
    pub peers_connected: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_packets_sent: u64,
    pub total_packets_received: u64,
}

impl MetricsSnapshot {
    /// Total throughput in bytes per second over `duration`.
    pub fn throughput_bps(&self, duration: Duration) -> f64 {
        let total_bytes = self.total_bytes_sent + self.total_bytes_received;
        total_bytes as f64 / duration.as_secs_f64()
    }
}

/// Rolling round-trip-time tracker for one peer.
///
/// The host owns its peers exclusively, so this needs no synchronization.
#[derive(Debug)]
pub struct RttTracker {
    started: Instant,
    samples: Vec<u32>,
    peak: u32,
    floor: u32,
}

impl Default for RttTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RttTracker {
    const MAX_SAMPLES: usize = 1000;

    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            samples: Vec::with_capacity(Self::MAX_SAMPLES),
            peak: 0,
            floor: u32::MAX,
        }
    }

    /// Record one RTT sample in milliseconds.
    pub fn record(&mut self, rtt: u32) {
        self.peak = self.peak.max(rtt);
        self.floor = self.floor.min(rtt);

        if self.samples.len() >= Self::MAX_SAMPLES {
            self.samples.remove(0);
        }

        self.samples.push(rtt);
    }

    /// Time since this tracker was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Summarize the recorded samples.
    pub fn stats(&self) -> RttSummary {
        let (average, jitter) = if self.samples.is_empty() {
            (0, 0)
        } else {
            let sum: u64 = self.samples.iter().map(|&r| r as u64).sum();
            let average = (sum / self.samples.len() as u64) as u32;

            let variance: f64 = self
                .samples
                .iter()
                .map(|&rtt| (rtt as f64 - average as f64).powi(2))
                .sum::<f64>()
                / self.samples.len() as f64;

            (average, variance.sqrt() as u32)
        };

        RttSummary {
            current: self.samples.last().copied().unwrap_or(0),
            average,
            minimum: if self.floor == u32::MAX { 0 } else { self.floor },
            maximum: self.peak,
            jitter,
            sample_count: self.samples.len(),
        }
    }
}

/// RTT statistics for one peer
#[derive(Debug, Clone)]
pub struct RttSummary {
    pub current: u32,
    pub average: u32,
    pub minimum: u32,
    pub maximum: u32,
    pub jitter: u32,
    pub sample_count: usize,
}

lazy_static::lazy_static! {
    /// Global metrics instance
    pub static ref GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::default();
}

/// Get global metrics
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Format a host's counters for human-readable display
pub fn format_host_stats(stats: &HostStats) -> String {
    format!(
        "Host: {} peers connected\n\
         Traffic: {} bytes sent, {} bytes received\n\
         Datagrams: {} sent, {} received",
        stats.connected_peers,
        stats.total_sent_data,
        stats.total_received_data,
        stats.total_sent_packets,
        stats.total_received_packets,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_metrics() {
        let metrics = GlobalMetrics::default();

        metrics.peer_connected();
        assert_eq!(metrics.active_peers.load(Ordering::Relaxed), 1);

        metrics.peer_disconnected();
        assert_eq!(metrics.active_peers.load(Ordering::Relaxed), 0);

        // Never underflows, even if disconnects outnumber connects.
        metrics.peer_disconnected();
        assert_eq!(metrics.active_peers.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_rtt_tracker() {
        let mut tracker = RttTracker::new();

        tracker.record(100);
        tracker.record(150);
        tracker.record(75);

        let stats = tracker.stats();
        assert_eq!(stats.minimum, 75);
        assert_eq!(stats.maximum, 150);
        assert_eq!(stats.current, 75);
        assert_eq!(stats.sample_count, 3);
    }
}
