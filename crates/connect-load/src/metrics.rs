use crate::stats::{ClientStats, ServerStats};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CLIENT_ACTIVE_CONNECTIONS: IntGauge = IntGauge::new(
        "connect_client_active_connections",
        "Number of client connections that completed the handshake"
    )
    .expect("metric can be created");
    pub static ref CLIENT_PENDING_CONNECTIONS: IntGauge = IntGauge::new(
        "connect_client_pending_connections",
        "Number of connections still to be opened before the target is reached"
    )
    .expect("metric can be created");
    pub static ref CLIENT_BYTES_SENT: IntGauge = IntGauge::new(
        "connect_client_bytes_sent_total",
        "Total bytes written by all client connections"
    )
    .expect("metric can be created");
    pub static ref CLIENT_MESSAGES_SENT: IntGauge = IntGauge::new(
        "connect_client_messages_sent_total",
        "Total messages written by all client connections"
    )
    .expect("metric can be created");
    /// Connections accepted by the server that still have a running receive pump
    pub static ref SERVER_ACTIVE_CONNECTIONS: IntGauge = IntGauge::new(
        "connect_server_active_connections",
        "Number of accepted connections currently being received on"
    )
    .expect("metric can be created");
    pub static ref SERVER_ACCEPTED_CONNECTIONS: IntGauge = IntGauge::new(
        "connect_server_accepted_connections_total",
        "Total number of connections accepted by the server"
    )
    .expect("metric can be created");
    pub static ref SERVER_MESSAGES_RECEIVED: IntGauge = IntGauge::new(
        "connect_server_messages_received_total",
        "Total non-empty receives counted by the server"
    )
    .expect("metric can be created");
    pub static ref SERVER_BYTES_RECEIVED: IntGauge = IntGauge::new(
        "connect_server_bytes_received_total",
        "Total bytes received by the server"
    )
    .expect("metric can be created");
}

pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(CLIENT_ACTIVE_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(CLIENT_PENDING_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(CLIENT_BYTES_SENT.clone()));
    let _ = REGISTRY.register(Box::new(CLIENT_MESSAGES_SENT.clone()));
    let _ = REGISTRY.register(Box::new(SERVER_ACTIVE_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(SERVER_ACCEPTED_CONNECTIONS.clone()));
    let _ = REGISTRY.register(Box::new(SERVER_MESSAGES_RECEIVED.clone()));
    let _ = REGISTRY.register(Box::new(SERVER_BYTES_RECEIVED.clone()));
}

/// Sources the exported gauges are refreshed from on every scrape. The client
/// entry carries its connection target so the pending count can be derived.
#[derive(Clone, Default)]
pub struct MetricSources {
    pub client: Option<(Arc<ClientStats>, u64)>,
    pub server: Option<Arc<ServerStats>>,
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn update_metrics(sources: &MetricSources) {
    if let Some((stats, target)) = &sources.client {
        let snapshot = stats.snapshot();
        CLIENT_ACTIVE_CONNECTIONS.set(clamp(snapshot.connected));
        CLIENT_PENDING_CONNECTIONS.set(clamp(target.saturating_sub(snapshot.connected)));
        CLIENT_BYTES_SENT.set(clamp(snapshot.bytes_sent));
        CLIENT_MESSAGES_SENT.set(clamp(snapshot.messages_sent));
    }
    if let Some(stats) = &sources.server {
        let snapshot = stats.snapshot();
        SERVER_ACTIVE_CONNECTIONS.set(clamp(snapshot.active));
        SERVER_ACCEPTED_CONNECTIONS.set(clamp(snapshot.accepted));
        SERVER_MESSAGES_RECEIVED.set(clamp(snapshot.messages_received));
        SERVER_BYTES_RECEIVED.set(clamp(snapshot.bytes_received));
    }
}

pub fn render_metrics(sources: &MetricSources) -> String {
    update_metrics(sources);

    let metric_families = REGISTRY.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| "# Error: Invalid UTF8".to_string())
}
