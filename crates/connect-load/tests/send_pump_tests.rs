use connect_load::engine::connection::{message_pattern, Connection, ConnectionHooks};
use connect_load::{ConnectError, FailFast};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

fn recording_fail_fast() -> (FailFast, Arc<Mutex<Vec<String>>>) {
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&faults);
    let fail_fast = FailFast::with_hook(move |e: &ConnectError| {
        sink.lock().unwrap().push(e.to_string());
    });
    (fail_fast, faults)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test]
fn test_message_pattern_counts_up_from_zero() {
    assert_eq!(&message_pattern(4)[..], &[0, 1, 2, 3]);
    let long = message_pattern(300);
    assert_eq!(long.len(), 300);
    assert_eq!(long[255], 255);
    assert_eq!(long[256], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_issue_exactly_one_write_each() {
    const PRODUCERS: usize = 10;
    const PER_PRODUCER: usize = 20;
    const SENDS: usize = PRODUCERS * PER_PRODUCER;

    // A tiny pipe forces most writes to wait for the reader.
    let (client, mut server) = duplex(8);
    let (fail_fast, faults) = recording_fail_fast();
    let totals = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&totals);
    let hooks = ConnectionHooks::new().on_sent(move |bytes, total| {
        assert_eq!(bytes, 4);
        recorded.lock().unwrap().push(total);
    });

    let connection: Arc<Connection<DuplexStream>> = Connection::new(7, 4, hooks, fail_fast);
    connection.attach(client, None).await.unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                for _ in 0..PER_PRODUCER {
                    connection.send();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let mut received = vec![0u8; SENDS * 4];
    server.read_exact(&mut received).await.unwrap();
    for producer in producers {
        producer.await.unwrap();
    }

    // Writes never interleaved: the stream is the pattern repeated whole.
    for message in received.chunks(4) {
        assert_eq!(message, &[0, 1, 2, 3]);
    }

    wait_until(|| connection.sends_completed() == SENDS as u64).await;
    assert_eq!(connection.bytes_sent(), (SENDS * 4) as u64);
    assert_eq!(connection.queued(), 0);

    let totals = totals.lock().unwrap().clone();
    let expected: Vec<u64> = (1..=SENDS as u64).map(|n| n * 4).collect();
    assert_eq!(totals, expected, "bytes sent must grow with every completion");
    assert!(faults.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_sends_before_connect_are_drained_after_connect() {
    let (client, mut server) = duplex(64);
    let (fail_fast, faults) = recording_fail_fast();
    let connection: Arc<Connection<DuplexStream>> =
        Connection::new(1, 4, ConnectionHooks::new(), fail_fast);

    connection.send();
    connection.send();
    connection.send();
    tokio::task::yield_now().await;
    assert_eq!(connection.queued(), 3);
    assert_eq!(connection.sends_completed(), 0);

    connection.attach(client, None).await.unwrap();

    let mut received = [0u8; 12];
    server.read_exact(&mut received).await.unwrap();
    assert_eq!(received, [0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
    wait_until(|| connection.sends_completed() == 3).await;
    assert_eq!(connection.queued(), 0);
    assert!(faults.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_connected_hook_fires_once() {
    let (client, _server) = duplex(64);
    let (other, _other_server) = duplex(64);
    let (fail_fast, _) = recording_fail_fast();
    let connects = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&connects);
    let hooks = ConnectionHooks::new().on_connected(move |id| recorded.lock().unwrap().push(id));

    let connection: Arc<Connection<DuplexStream>> = Connection::new(42, 4, hooks, fail_fast);
    let peer = "10.1.2.3:8080".parse().unwrap();
    connection.attach(client, Some(peer)).await.unwrap();

    let second = connection.attach(other, None).await;
    assert!(matches!(second, Err(ConnectError::AlreadyConnected { id: 42 })));
    assert_eq!(*connects.lock().unwrap(), vec![42]);
    assert!(connection.is_connected());
    assert_eq!(connection.peer_addr(), Some(peer));
}

#[tokio::test]
async fn test_send_failure_is_reported_as_fatal() {
    let (client, server) = duplex(64);
    let (fail_fast, faults) = recording_fail_fast();
    let connection: Arc<Connection<DuplexStream>> =
        Connection::new(3, 4, ConnectionHooks::new(), fail_fast);
    connection.attach(client, None).await.unwrap();
    drop(server);

    connection.send();
    wait_until(|| !faults.lock().unwrap().is_empty()).await;

    let faults = faults.lock().unwrap().clone();
    assert_eq!(faults.len(), 1);
    assert!(faults[0].starts_with("send on connection 3 failed"), "{}", faults[0]);

    // The failed connection keeps its flag and never writes again.
    connection.send();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connection.sends_completed(), 0);
    assert_eq!(connection.queued(), 1);
}

#[tokio::test]
async fn test_connect_over_tcp_and_send() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (fail_fast, faults) = recording_fail_fast();

    let connection: Arc<Connection<TcpStream>> =
        Connection::new(0, 4, ConnectionHooks::new(), fail_fast);
    let (connected, accepted) = tokio::join!(connection.connect(addr), listener.accept());
    connected.unwrap();
    let (mut server, _) = accepted.unwrap();
    assert_eq!(connection.peer_addr(), Some(addr));

    for _ in 0..5 {
        connection.send();
    }
    let mut received = [0u8; 20];
    server.read_exact(&mut received).await.unwrap();
    assert!(received.chunks(4).all(|m| m == [0, 1, 2, 3]));
    wait_until(|| connection.sends_completed() == 5).await;
    assert!(faults.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (fail_fast, _) = recording_fail_fast();
    let connection: Arc<Connection<TcpStream>> =
        Connection::new(0, 4, ConnectionHooks::new(), fail_fast);
    let result = connection.connect(addr).await;
    assert!(matches!(result, Err(ConnectError::Connect { .. })));
    assert!(!connection.is_connected());
}
