use crate::engine::connection::{Connection, ConnectionHooks};
use crate::engine::registry::{ConnectionRegistry, RampStep, RampUp};
use crate::fault::FailFast;
use crate::stats::ClientStats;
use connect_common::ClientConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DISPATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub target: SocketAddr,
    pub connection_limit: usize,
    /// Messages per dispatch tick across all connections.
    pub message_rate: usize,
    pub message_size: usize,
}

impl ClientSettings {
    /// Resolves `target_host` once, preferring an IPv4 address.
    pub async fn resolve(config: &ClientConfig) -> io::Result<Self> {
        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((config.target_host.as_str(), config.port))
                .await?
                .collect();
        let target = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {}", config.target_host),
                )
            })?;

        Ok(Self {
            target,
            connection_limit: config.connection_limit,
            message_rate: config.message_rate,
            message_size: config.message_size,
        })
    }
}

/// Drives the client side: ramps connections up one completed connect at a
/// time, then sends `message_rate` messages per second round-robin across
/// them.
pub struct ClientHarness {
    settings: ClientSettings,
    registry: ConnectionRegistry,
    ramp: RampUp,
    stats: Arc<ClientStats>,
    fail_fast: FailFast,
    next_id: AtomicUsize,
    ramp_done: watch::Sender<bool>,
    token: CancellationToken,
}

impl ClientHarness {
    pub fn new(
        settings: ClientSettings,
        stats: Arc<ClientStats>,
        fail_fast: FailFast,
        token: CancellationToken,
    ) -> Arc<Self> {
        let (ramp_done, _) = watch::channel(false);
        Arc::new(Self {
            registry: ConnectionRegistry::with_capacity(settings.connection_limit),
            ramp: RampUp::new(settings.connection_limit),
            settings,
            stats,
            fail_fast,
            next_id: AtomicUsize::new(0),
            ramp_done,
            token,
        })
    }

    pub fn start(self: &Arc<Self>) {
        info!(
            target = %self.settings.target,
            connections = self.settings.connection_limit,
            rate = self.settings.message_rate,
            "Client starting"
        );
        if self.ramp.begin() {
            self.open_connection();
        }
    }

    fn open_connection(self: &Arc<Self>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let harness = Arc::downgrade(self);
        let stats = Arc::clone(&self.stats);
        let hooks = ConnectionHooks::new()
            .on_connected(move |_| {
                if let Some(harness) = harness.upgrade() {
                    harness.on_connected();
                }
            })
            .on_sent(move |bytes, _| stats.record_sent(bytes));

        let connection = Connection::new(
            id,
            self.settings.message_size,
            hooks,
            self.fail_fast.clone(),
        );
        self.registry.add(Arc::clone(&connection));
        self.stats.record_initiated();

        let target = self.settings.target;
        let fail_fast = self.fail_fast.clone();
        debug!(connection = id, target = %target, "Connecting");
        tokio::spawn(async move {
            if let Err(e) = connection.connect(target).await {
                fail_fast.fatal(e);
            }
        });
    }

    fn on_connected(self: &Arc<Self>) {
        self.stats.record_connected();
        match self.ramp.on_connected() {
            RampStep::ConnectNext => self.open_connection(),
            RampStep::Complete => {
                info!(
                    active = self.ramp.connected(),
                    rate = self.settings.message_rate,
                    "All connections established, sending messages"
                );
                self.ramp_done.send_replace(true);
                tokio::spawn(Arc::clone(self).dispatch());
            }
            RampStep::Saturated => {}
        }
    }

    async fn dispatch(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(DISPATCH_INTERVAL);
        // The first tick of an interval fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for _ in 0..self.settings.message_rate {
                        self.registry.message_next();
                    }
                }
                _ = self.token.cancelled() => {
                    debug!("Dispatch stopped");
                    return;
                }
            }
        }
    }

    /// Resolves once the connection target has been reached.
    pub async fn ramped_up(&self) {
        let mut done = self.ramp_done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn ramp(&self) -> &RampUp {
        &self.ramp
    }

    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.stats
    }
}
