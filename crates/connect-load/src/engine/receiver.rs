use crate::buffers::Segment;
use crate::error::ConnectError;
use crate::fault::FailFast;
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The peer shut down its side (a zero-byte receive).
    PeerClosed,
    Unsubscribed,
    /// A fatal error was reported to the fail-fast handler.
    Faulted,
}

/// Receives continuously on one accepted connection, reporting the size of
/// every non-empty receive.
///
/// Receives that are already complete when issued are handled in place, in a
/// tight loop, without suspending the task. Only when a receive has to wait
/// does the pump suspend and resume on readiness.
///
/// The first connection reset is logged and absorbed. A second reset, or any
/// other receive error, is fatal.
pub struct ReceivePump<R> {
    id: u64,
    reader: R,
    buffer: Segment,
    tolerate_reset: bool,
    peer: Option<SocketAddr>,
    fail_fast: FailFast,
}

impl<R> ReceivePump<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(id: u64, reader: R, buffer: Segment, fail_fast: FailFast) -> Self {
        Self {
            id,
            reader,
            buffer,
            tolerate_reset: true,
            peer: None,
            fail_fast,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Runs until the peer closes, `token` is cancelled, or a fatal error.
    /// The reader and buffer are released when this returns.
    pub async fn run<F>(mut self, token: CancellationToken, mut on_message: F) -> PumpExit
    where
        F: FnMut(usize),
    {
        loop {
            if token.is_cancelled() {
                return PumpExit::Unsubscribed;
            }

            let received = match self.reader.read(&mut self.buffer).now_or_never() {
                Some(result) => result,
                None => tokio::select! {
                    result = self.reader.read(&mut self.buffer) => result,
                    _ = token.cancelled() => return PumpExit::Unsubscribed,
                },
            };

            match received {
                Ok(0) => {
                    debug!(connection = self.id, peer = ?self.peer, "Peer closed connection");
                    return PumpExit::PeerClosed;
                }
                Ok(n) => on_message(n),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    if !self.tolerate_reset {
                        self.fail_fast
                            .fatal(ConnectError::RepeatedReset { id: self.id });
                        return PumpExit::Faulted;
                    }
                    self.tolerate_reset = false;
                    warn!(connection = self.id, peer = ?self.peer, "Connection reset received");
                }
                Err(source) => {
                    self.fail_fast.fatal(ConnectError::Receive {
                        id: self.id,
                        source,
                    });
                    return PumpExit::Faulted;
                }
            }
        }
    }

    /// Runs the pump on its own task.
    pub fn spawn<F>(self, on_message: F) -> ReceiveSubscription
    where
        F: FnMut(usize) + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.run(token.clone(), on_message));
        ReceiveSubscription {
            token,
            handle: Some(handle),
        }
    }
}

/// Handle to a spawned [`ReceivePump`]. Dropping it unsubscribes.
pub struct ReceiveSubscription {
    token: CancellationToken,
    handle: Option<JoinHandle<PumpExit>>,
}

impl ReceiveSubscription {
    /// Stops the pump; the socket and buffer are released when its task ends.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Waits for the pump to stop without unsubscribing it.
    pub async fn join(mut self) -> PumpExit {
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(PumpExit::Faulted),
            None => PumpExit::Unsubscribed,
        }
    }
}

impl Drop for ReceiveSubscription {
    fn drop(&mut self) {
        // `join` takes the handle; only unsubscribe when dropped without joining.
        if self.handle.is_some() {
            self.token.cancel();
        }
    }
}
