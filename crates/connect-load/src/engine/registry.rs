use crate::engine::connection::Connection;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;

/// Round-robin set of client connections.
///
/// Connections are only ever added. One that has failed stays in rotation;
/// under fail-fast the process is already on its way out by then.
pub struct ConnectionRegistry<W = TcpStream> {
    members: Mutex<VecDeque<Arc<Connection<W>>>>,
}

impl<W> ConnectionRegistry<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            members: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            members: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn add(&self, connection: Arc<Connection<W>>) {
        self.lock().push_back(connection);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Rotates the head connection to the back and asks it to send one message.
    ///
    /// Only the rotation happens under the lock; the send request is made after
    /// it is released. Returns the id of the connection used.
    pub fn message_next(&self) -> Option<usize> {
        let next = {
            let mut members = self.lock();
            let head = members.pop_front()?;
            members.push_back(Arc::clone(&head));
            head
        };
        next.send();
        Some(next.id())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Connection<W>>>> {
        // A panic while rotating cannot leave the queue inconsistent.
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W> Default for ConnectionRegistry<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampStep {
    /// Below target: open one more connection.
    ConnectNext,
    /// This connect reached the target.
    Complete,
    /// Target was already reached; nothing to do.
    Saturated,
}

/// Paces connection setup to the rate at which connects actually complete.
///
/// One connection is opened up front and each successful connect opens at
/// most one more, so the number of in-flight handshakes stays at one instead
/// of firing the whole target at once.
#[derive(Debug)]
pub struct RampUp {
    target: usize,
    connected: AtomicUsize,
    attempts: AtomicUsize,
}

impl RampUp {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            connected: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Records the first attempt. Returns `false` when there is nothing to open.
    pub fn begin(&self) -> bool {
        if self.target == 0 {
            return false;
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn on_connected(&self) -> RampStep {
        let live = self.connected.fetch_add(1, Ordering::SeqCst) + 1;
        if live < self.target {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            RampStep::ConnectNext
        } else if live == self.target {
            RampStep::Complete
        } else {
            RampStep::Saturated
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.target.saturating_sub(self.connected())
    }

    pub fn is_complete(&self) -> bool {
        self.connected() >= self.target
    }
}
