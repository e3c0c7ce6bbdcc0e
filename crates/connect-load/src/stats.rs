//! Shared load-test counters and the periodic log reporters built on them.
//!
//! Counters are bumped from many tasks at once, so everything here is a plain
//! atomic. Reporters only ever read snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
pub struct ClientStats {
    initiated: AtomicU64,
    connected: AtomicU64,
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub initiated: u64,
    pub connected: u64,
    pub bytes_sent: u64,
    pub messages_sent: u64,
}

impl ClientStats {
    pub fn record_initiated(&self) {
        self.initiated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connected(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            initiated: self.initiated.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    closed: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

impl ServerStats {
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let accepted = self.accepted.load(Ordering::Relaxed);
        let closed = self.closed.load(Ordering::Relaxed);
        ServerSnapshot {
            accepted,
            active: accepted.saturating_sub(closed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Per-second rate of a counter between two readings.
pub fn per_second(previous: u64, current: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    current.saturating_sub(previous) as f64 / secs
}

/// Logs ramp-up progress until `target` connections are up, then throughput once a second.
pub async fn report_client(
    stats: Arc<ClientStats>,
    target: usize,
    ramp_interval: Duration,
    token: CancellationToken,
) {
    let target = target as u64;
    let mut previous = stats.snapshot();
    let mut ticker = tokio::time::interval(ramp_interval);
    ticker.tick().await;

    while previous.connected < target {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => return,
        }
        let current = stats.snapshot();
        info!(
            active = current.connected,
            connects_per_sec = per_second(previous.connected, current.connected, ramp_interval),
            pending = target.saturating_sub(current.connected),
            "client ramp-up"
        );
        previous = current;
    }

    let second = Duration::from_secs(1);
    let mut ticker = tokio::time::interval(second);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => return,
        }
        let current = stats.snapshot();
        info!(
            active = current.connected,
            msgs_per_sec = per_second(previous.messages_sent, current.messages_sent, second),
            bytes_per_sec = per_second(previous.bytes_sent, current.bytes_sent, second),
            total_bytes = current.bytes_sent,
            "client throughput"
        );
        previous = current;
    }
}

pub async fn report_server(stats: Arc<ServerStats>, interval: Duration, token: CancellationToken) {
    let mut previous = stats.snapshot();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => return,
        }
        let current = stats.snapshot();
        info!(
            active = current.active,
            msgs_per_sec = per_second(previous.messages_received, current.messages_received, interval),
            "server throughput"
        );
        previous = current;
    }
}
