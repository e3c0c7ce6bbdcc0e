use crate::error::{ConnectError, Result};
use crate::fault::FailFast;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

pub const DEFAULT_MESSAGE_SIZE: usize = 4;

type ConnectedHook = dyn Fn(usize) + Send + Sync;
type SentHook = dyn Fn(usize, u64) + Send + Sync;

/// Callbacks a connection fires as it makes progress.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    on_connected: Option<Arc<ConnectedHook>>,
    on_sent: Option<Arc<SentHook>>,
}

impl ConnectionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once with the connection id when the handshake completes.
    pub fn on_connected<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_connected = Some(Arc::new(hook));
        self
    }

    /// Called after every completed send with the bytes written and the new
    /// cumulative total for the connection.
    pub fn on_sent<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize, u64) + Send + Sync + 'static,
    {
        self.on_sent = Some(Arc::new(hook));
        self
    }
}

/// The fixed payload every message carries: `size` bytes counting up from zero.
pub fn message_pattern(size: usize) -> Bytes {
    (0..size).map(|i| i as u8).collect::<Vec<u8>>().into()
}

/// One outbound connection and its single-flight send pump.
///
/// `send` never blocks and never writes directly: it bumps the backlog and, if
/// no send is in flight, claims the `pending` flag and spawns one write of the
/// fixed message. Each completed write releases the flag and re-arms the
/// drain on a fresh task while backlog remains, so at most one write is ever
/// outstanding per connection and long completion chains do not nest.
///
/// The flag is held from construction until the handshake finishes, so sends
/// requested while connecting are queued and drained once connected.
pub struct Connection<W = TcpStream> {
    id: usize,
    message: Bytes,
    writer: AsyncMutex<Option<W>>,
    pending: AtomicBool,
    queued: AtomicUsize,
    bytes_sent: AtomicU64,
    sends_completed: AtomicU64,
    connected: AtomicBool,
    peer: OnceCell<SocketAddr>,
    hooks: ConnectionHooks,
    fail_fast: FailFast,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: usize,
        message_size: usize,
        hooks: ConnectionHooks,
        fail_fast: FailFast,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            message: message_pattern(message_size),
            writer: AsyncMutex::new(None),
            pending: AtomicBool::new(true),
            queued: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
            sends_completed: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            peer: OnceCell::new(),
            hooks,
            fail_fast,
        })
    }

    /// Moves the connection to Connected around an already established writer.
    pub async fn attach(self: &Arc<Self>, writer: W, peer: Option<SocketAddr>) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(ConnectError::AlreadyConnected { id: self.id });
        }

        *self.writer.lock().await = Some(writer);
        if let Some(peer) = peer {
            let _ = self.peer.set(peer);
        }
        debug!(connection = self.id, peer = ?peer, "Connection established");

        if let Some(hook) = &self.hooks.on_connected {
            hook(self.id);
        }

        self.pending.store(false, Ordering::SeqCst);
        self.drain();
        Ok(())
    }

    /// Requests one more message. Must be called from within a tokio runtime.
    pub fn send(self: &Arc<Self>) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.drain();
    }

    fn drain(self: &Arc<Self>) {
        loop {
            if self.queued.load(Ordering::SeqCst) == 0 {
                return;
            }
            if self
                .pending
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // The current sender re-checks the backlog when it finishes.
                return;
            }
            if self
                .queued
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| q.checked_sub(1))
                .is_ok()
            {
                tokio::spawn(Arc::clone(self).send_one());
                return;
            }
            // Backlog was drained between the check and the claim. Release and
            // look again so a producer that lost the claim is not stranded.
            self.pending.store(false, Ordering::SeqCst);
        }
    }

    async fn send_one(self: Arc<Self>) {
        let result = match self.writer.try_lock() {
            Ok(mut writer) => match writer.as_mut() {
                Some(w) => w
                    .write_all(&self.message)
                    .await
                    .map(|()| self.message.len()),
                None => Err(io::Error::from(io::ErrorKind::NotConnected)),
            },
            Err(_) => {
                self.fail_fast
                    .fatal(ConnectError::OverlappingSend { id: self.id });
                return;
            }
        };

        match result {
            Ok(bytes) => {
                let total = self.bytes_sent.fetch_add(bytes as u64, Ordering::SeqCst) + bytes as u64;
                self.sends_completed.fetch_add(1, Ordering::SeqCst);
                if let Some(hook) = &self.hooks.on_sent {
                    hook(bytes, total);
                }
                self.pending.store(false, Ordering::SeqCst);
                self.drain();
            }
            // The flag stays claimed: a failed connection never sends again.
            Err(source) => self.fail_fast.fatal(ConnectError::Send {
                id: self.id,
                source,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn message(&self) -> &Bytes {
        &self.message
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.get().copied()
    }

    /// Sends requested but not yet started.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn sends_completed(&self) -> u64 {
        self.sends_completed.load(Ordering::SeqCst)
    }
}

impl Connection<TcpStream> {
    /// Opens the TCP connection with `TCP_NODELAY` and moves to Connected.
    ///
    /// Errors are returned to the caller, which decides whether they are fatal.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ConnectError::Connect { addr, source })?;
        stream
            .set_nodelay(true)
            .map_err(|source| ConnectError::Connect { addr, source })?;
        let peer = stream.peer_addr().unwrap_or(addr);
        self.attach(stream, Some(peer)).await
    }
}
