use crate::buffers::BufferPool;
use crate::engine::acceptor::{AcceptHandle, AcceptLoop, AcceptReceiver};
use crate::engine::receiver::ReceivePump;
use crate::error::{ConnectError, Result};
use crate::fault::FailFast;
use crate::stats::ServerStats;
use connect_common::ServerConfig;
use dashmap::DashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Binds a listener with address reuse and an explicit accept backlog.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Counting server: accepts connections and tallies every non-empty receive.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let ip = config.listen_address.parse::<IpAddr>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen address {}", config.listen_address),
            )
        })?;
        let listener = bind_listener(SocketAddr::new(ip, config.port), config.listen_backlog)?;
        info!(local_addr = ?listener.local_addr().ok(), "Listening");
        Ok(Self {
            listener,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn start(
        self,
        stats: Arc<ServerStats>,
        fail_fast: FailFast,
        token: CancellationToken,
    ) -> Result<ServerHandle> {
        let pool = BufferPool::new(
            self.config.receive_buffer_size,
            self.config.receive_buffer_count,
        )?;
        let local_addr = self
            .listener
            .local_addr()
            .map_err(ConnectError::Accept)?;

        let accept_loop = AcceptLoop::new(
            self.listener,
            self.config.concurrent_accepts,
            pool.clone(),
            fail_fast.clone(),
        );
        let accepted = accept_loop.subscribe();
        let accept = accept_loop.start(token.child_token());

        let pumps = Arc::new(DashMap::new());
        tokio::spawn(serve(
            accepted,
            Arc::clone(&pumps),
            stats,
            fail_fast,
            token.clone(),
        ));

        Ok(ServerHandle {
            local_addr,
            accept,
            pumps,
            pool,
            token,
        })
    }
}

async fn serve(
    mut accepted: AcceptReceiver,
    pumps: Arc<DashMap<u64, CancellationToken>>,
    stats: Arc<ServerStats>,
    fail_fast: FailFast,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = accepted.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = token.cancelled() => return,
        };

        let Some((stream, buffer)) = event.claim() else {
            continue;
        };
        let seq = event.seq();
        stats.record_accepted();

        let pump = ReceivePump::new(seq, stream, buffer, fail_fast.clone()).with_peer(event.peer());
        let subscription = token.child_token();
        // Registered before the task starts so its own removal cannot race ahead.
        pumps.insert(seq, subscription.clone());

        let pumps = Arc::clone(&pumps);
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let exit = pump
                .run(subscription, |bytes| stats.record_message(bytes))
                .await;
            pumps.remove(&seq);
            stats.record_closed();
            debug!(connection = seq, exit = ?exit, "Receive pump stopped");
        });
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    accept: AcceptHandle,
    pumps: Arc<DashMap<u64, CancellationToken>>,
    pool: BufferPool,
    token: CancellationToken,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_pumps(&self) -> usize {
        self.pumps.len()
    }

    pub fn outstanding_accepts(&self) -> usize {
        self.accept.outstanding()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Stops the receive pump for one accepted connection, releasing its socket and buffer.
    pub fn unsubscribe(&self, seq: u64) -> bool {
        match self.pumps.get(&seq) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}
