use connect_load::buffers::BufferPool;
use connect_load::engine::receiver::{PumpExit, ReceivePump};
use connect_load::{ConnectError, FailFast};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

enum Step {
    Data(&'static [u8]),
    Fail(io::ErrorKind),
    /// Not ready yet; wakes itself so the next poll moves on.
    Wait,
}

/// Replays a fixed script of receive results, then reports end of stream.
struct ScriptedReader {
    steps: VecDeque<Step>,
}

impl ScriptedReader {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
        }
    }
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.steps.pop_front() {
            Some(Step::Data(bytes)) => {
                buf.put_slice(bytes);
                Poll::Ready(Ok(()))
            }
            Some(Step::Fail(kind)) => Poll::Ready(Err(io::Error::from(kind))),
            Some(Step::Wait) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            None => Poll::Ready(Ok(())),
        }
    }
}

fn recording_fail_fast() -> (FailFast, Arc<Mutex<Vec<String>>>) {
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&faults);
    let fail_fast = FailFast::with_hook(move |e: &ConnectError| {
        sink.lock().unwrap().push(e.to_string());
    });
    (fail_fast, faults)
}

async fn run_script(steps: Vec<Step>) -> (PumpExit, Vec<usize>, Vec<String>, BufferPool) {
    let pool = BufferPool::new(16, 1).unwrap();
    let (fail_fast, faults) = recording_fail_fast();
    let pump = ReceivePump::new(1, ScriptedReader::new(steps), pool.take().unwrap(), fail_fast);

    let mut messages = Vec::new();
    let exit = pump
        .run(CancellationToken::new(), |n| messages.push(n))
        .await;
    let faults = faults.lock().unwrap().clone();
    (exit, messages, faults, pool)
}

#[tokio::test]
async fn test_reports_every_non_empty_receive() {
    let (exit, messages, faults, pool) = run_script(vec![
        Step::Data(b"abc"),
        Step::Wait,
        Step::Data(b"hello"),
        Step::Data(b"\x00\x01\x02\x03"),
    ])
    .await;

    assert_eq!(exit, PumpExit::PeerClosed);
    assert_eq!(messages, vec![3, 5, 4]);
    assert!(faults.is_empty());
    assert_eq!(pool.available(), 1, "buffer returned when the pump stops");
}

#[tokio::test]
async fn test_zero_byte_receive_emits_no_notification() {
    let (exit, messages, faults, _) = run_script(vec![]).await;
    assert_eq!(exit, PumpExit::PeerClosed);
    assert!(messages.is_empty());
    assert!(faults.is_empty());
}

#[tokio::test]
async fn test_first_connection_reset_is_absorbed() {
    let (exit, messages, faults, _) = run_script(vec![
        Step::Data(b"one"),
        Step::Fail(io::ErrorKind::ConnectionReset),
        Step::Data(b"two"),
    ])
    .await;

    assert_eq!(exit, PumpExit::PeerClosed);
    assert_eq!(messages, vec![3, 3]);
    assert!(faults.is_empty());
}

#[tokio::test]
async fn test_second_connection_reset_is_fatal() {
    let (exit, messages, faults, pool) = run_script(vec![
        Step::Fail(io::ErrorKind::ConnectionReset),
        Step::Data(b"ok"),
        Step::Fail(io::ErrorKind::ConnectionReset),
        Step::Data(b"never read"),
    ])
    .await;

    assert_eq!(exit, PumpExit::Faulted);
    assert_eq!(messages, vec![2]);
    assert_eq!(faults, vec!["connection 1 was reset a second time".to_string()]);
    assert_eq!(pool.available(), 1);
}

#[tokio::test]
async fn test_other_receive_errors_are_fatal_immediately() {
    let (exit, messages, faults, _) = run_script(vec![
        Step::Fail(io::ErrorKind::BrokenPipe),
        Step::Data(b"never read"),
    ])
    .await;

    assert_eq!(exit, PumpExit::Faulted);
    assert!(messages.is_empty());
    assert_eq!(faults.len(), 1);
    assert!(faults[0].starts_with("receive on connection 1 failed"));
}

#[tokio::test]
async fn test_ready_receives_are_processed_back_to_back() {
    let steps = (0..10_000).map(|_| Step::Data(b"msg!")).collect();
    let (exit, messages, _, _) = run_script(steps).await;
    assert_eq!(exit, PumpExit::PeerClosed);
    assert_eq!(messages.len(), 10_000);
    assert!(messages.iter().all(|n| *n == 4));
}

#[tokio::test]
async fn test_unsubscribe_releases_socket_and_buffer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let mut client = client.unwrap();
    let (server_side, peer) = accepted.unwrap();

    let pool = BufferPool::new(64, 1).unwrap();
    let (fail_fast, faults) = recording_fail_fast();
    let received = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&received);
    let subscription = ReceivePump::new(9, server_side, pool.take().unwrap(), fail_fast)
        .with_peer(peer)
        .spawn(move |n| *counter.lock().unwrap() += n);

    client.write_all(&[0, 1, 2, 3]).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *received.lock().unwrap() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    subscription.unsubscribe();
    assert_eq!(subscription.join().await, PumpExit::Unsubscribed);
    assert_eq!(pool.available(), 1);

    // The server side of the socket was closed with the pump.
    let mut buf = [0u8; 4];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(faults.lock().unwrap().is_empty());
}
