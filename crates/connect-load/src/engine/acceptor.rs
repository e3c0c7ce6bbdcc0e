//! Accept loop that keeps several accepts outstanding on one listener.
//!
//! A single accept-then-handle loop serializes connection bursts behind one
//! completion at a time. [`AcceptLoop`] instead runs `concurrency` independent
//! accept tasks against the same listener; each re-issues its accept as soon
//! as the previous one completes.
//!
//! Every accepted socket is paired with a receive buffer from the pool and
//! published to all subscribers. Subscribers get their own unbounded channel,
//! so a slow subscriber never causes another to miss an event.

use crate::buffers::{BufferPool, Segment};
use crate::error::ConnectError;
use crate::fault::FailFast;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_CONCURRENT_ACCEPTS: usize = 10;

/// One accepted socket together with the receive buffer reserved for it.
///
/// Every subscriber sees the same event. The first to [`claim`](Self::claim)
/// it takes ownership of the socket and buffer; if nobody does, both are
/// released when the last subscriber drops the event.
#[derive(Debug)]
pub struct Accepted {
    seq: u64,
    peer: SocketAddr,
    parts: Mutex<Option<(TcpStream, Segment)>>,
}

impl Accepted {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn claim(&self) -> Option<(TcpStream, Segment)> {
        self.parts.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

pub type AcceptReceiver = mpsc::UnboundedReceiver<Arc<Accepted>>;

struct Fanout<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Fanout<T> {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    fn publish(&self, item: T) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(item.clone()).is_ok());
    }
}

pub struct AcceptLoop {
    listener: Arc<TcpListener>,
    concurrency: usize,
    pool: BufferPool,
    fanout: Arc<Fanout<Arc<Accepted>>>,
    fail_fast: FailFast,
}

impl AcceptLoop {
    /// Nothing is accepted until [`start`](Self::start) is called.
    pub fn new(
        listener: TcpListener,
        concurrency: usize,
        pool: BufferPool,
        fail_fast: FailFast,
    ) -> Self {
        Self {
            listener: Arc::new(listener),
            concurrency: concurrency.max(1),
            pool,
            fanout: Arc::new(Fanout::new()),
            fail_fast,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registers a subscriber. Subscribers must be registered before `start`.
    pub fn subscribe(&self) -> AcceptReceiver {
        self.fanout.subscribe()
    }

    /// Spawns the accept tasks. Consumes the loop; it cannot be restarted.
    pub fn start(self, token: CancellationToken) -> AcceptHandle {
        let seq = Arc::new(AtomicU64::new(0));
        info!(
            local_addr = ?self.listener.local_addr().ok(),
            concurrency = self.concurrency,
            "Accept loop started"
        );

        let tasks = (0..self.concurrency)
            .map(|slot| {
                let worker = AcceptWorker {
                    slot,
                    listener: Arc::clone(&self.listener),
                    pool: self.pool.clone(),
                    fanout: Arc::clone(&self.fanout),
                    seq: Arc::clone(&seq),
                    fail_fast: self.fail_fast.clone(),
                };
                tokio::spawn(worker.run(token.clone()))
            })
            .collect();

        AcceptHandle { tasks, token }
    }
}

struct AcceptWorker {
    slot: usize,
    listener: Arc<TcpListener>,
    pool: BufferPool,
    fanout: Arc<Fanout<Arc<Accepted>>>,
    seq: Arc<AtomicU64>,
    fail_fast: FailFast,
}

impl AcceptWorker {
    async fn run(self, token: CancellationToken) {
        loop {
            let result = tokio::select! {
                res = self.listener.accept() => res,
                _ = token.cancelled() => return,
            };

            let (stream, peer) = match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.fail_fast.fatal(ConnectError::Accept(e));
                    return;
                }
            };

            let buffer = match self.pool.take() {
                Ok(buffer) => buffer,
                Err(e) => {
                    self.fail_fast.fatal(e.into());
                    return;
                }
            };

            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            debug!(slot = self.slot, seq, peer = %peer, "Accepted connection");
            self.fanout.publish(Arc::new(Accepted {
                seq,
                peer,
                parts: Mutex::new(Some((stream, buffer))),
            }));
        }
    }
}

pub struct AcceptHandle {
    tasks: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

impl AcceptHandle {
    /// Number of accept tasks still running.
    pub fn outstanding(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
