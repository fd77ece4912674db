//! Accept limits and failure handling of `ConnectionAcceptor`.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use corewcf::connection::{
    AcceptFuture,
    AcceptListener,
    AcceptorSettings,
    BackoffConfig,
    Connection,
    ConnectionAcceptor,
    ConnectionCallback,
    Dequeued,
    ErrorCallback,
    TcpAcceptListener,
};
use corewcf_testing::{LoggerHandle, MemoryListener, TestResult, logger, unused_listener};
use futures::FutureExt as _;
use rstest::rstest;
use tokio::{sync::mpsc, time::timeout};

const SECOND: Duration = Duration::from_secs(1);

fn queueing_callback() -> (ConnectionCallback, mpsc::UnboundedReceiver<(Connection, Dequeued)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ConnectionCallback = Arc::new(move |connection, dequeued| {
        let _ = tx.send((connection, dequeued));
    });
    (callback, rx)
}

fn limits(max_accepts: usize, max_pending_connections: usize) -> AcceptorSettings {
    AcceptorSettings {
        max_accepts,
        max_pending_connections,
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
    }
}

#[tokio::test]
async fn held_connections_count_against_the_limit() {
    let (listener, dialer) = MemoryListener::new(808);
    let (callback, mut accepted) = queueing_callback();
    let acceptor = ConnectionAcceptor::new(listener, limits(1, 2), callback, None);
    acceptor.start_accepting().await.expect("start");
    assert_eq!(acceptor.pending_accepts(), 1);

    let _clients: Vec<_> = (0..3).map(|_| dialer.dial().expect("dial")).collect();
    let (_first, first_slot) = timeout(SECOND, accepted.recv()).await.expect("first").expect("open");
    let (_second, _second_slot) = timeout(SECOND, accepted.recv()).await.expect("second").expect("open");

    assert!(
        timeout(Duration::from_millis(50), accepted.recv()).await.is_err(),
        "third connection accepted past the limit"
    );
    assert_eq!(acceptor.connection_count(), 2);
    assert_eq!(acceptor.pending_accepts(), 0);

    first_slot.complete().await;
    let (_third, _third_slot) = timeout(SECOND, accepted.recv()).await.expect("third").expect("open");
    assert_eq!(acceptor.connection_count(), 2);

    acceptor.dispose().await;
    acceptor.wait().await;
}

#[tokio::test]
async fn dropped_tokens_release_their_slot() {
    let (listener, dialer) = MemoryListener::new(808);
    let (callback, mut accepted) = queueing_callback();
    let acceptor = ConnectionAcceptor::new(listener, limits(1, 1), callback, None);
    acceptor.start_accepting().await.expect("start");

    let _clients: Vec<_> = (0..2).map(|_| dialer.dial().expect("dial")).collect();
    let first = timeout(SECOND, accepted.recv()).await.expect("first").expect("open");
    drop(first);
    assert!(timeout(SECOND, accepted.recv()).await.expect("second").is_some());

    acceptor.dispose().await;
    acceptor.wait().await;
}

/// Fails every accept with a non-transient error and counts closes.
#[derive(Default)]
struct BrokenListener {
    accepts: AtomicUsize,
    closes: AtomicUsize,
}

impl AcceptListener for BrokenListener {
    fn start_accept(&self) -> io::Result<AcceptFuture> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        Ok(async { Err(io::Error::other("descriptor table full")) }.boxed())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { Ok(SocketAddr::from(([127, 0, 0, 1], 808))) }

    fn close(&self) { self.closes.fetch_add(1, Ordering::SeqCst); }
}

#[tokio::test]
async fn failures_reach_the_error_callback_and_accepting_continues() {
    let listener = Arc::new(BrokenListener::default());
    let (tx, mut errors) = mpsc::unbounded_channel();
    let on_error: ErrorCallback = Arc::new(move |error| {
        let _ = tx.send(error.to_string());
    });
    let (callback, _accepted) = queueing_callback();
    let acceptor = ConnectionAcceptor::new(listener.clone(), limits(1, 4), callback, Some(on_error));
    acceptor.start_accepting().await.expect("start");

    for _ in 0..3 {
        let error = timeout(SECOND, errors.recv()).await.expect("error").expect("open");
        assert_eq!(error, "descriptor table full");
    }
    assert!(listener.accepts.load(Ordering::SeqCst) >= 3);

    acceptor.dispose().await;
    acceptor.dispose().await;
    acceptor.wait().await;
    assert_eq!(listener.closes.load(Ordering::SeqCst), 1);
}

#[rstest]
#[tokio::test]
async fn failures_without_a_callback_are_logged(mut logger: LoggerHandle) {
    let listener = Arc::new(BrokenListener::default());
    let (callback, _accepted) = queueing_callback();
    let acceptor = ConnectionAcceptor::new(listener.clone(), limits(1, 4), callback, None);
    acceptor.start_accepting().await.expect("start");

    timeout(SECOND, async {
        while listener.accepts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("retried");
    acceptor.dispose().await;
    acceptor.wait().await;

    assert!(logger.contains("accept error"));
}

#[tokio::test]
async fn tcp_connections_are_accepted() -> TestResult {
    let listener = TcpAcceptListener::from_std(unused_listener()?)?;
    let addr = listener.local_addr()?;
    let (callback, mut accepted) = queueing_callback();
    let acceptor = ConnectionAcceptor::new(Arc::new(listener), limits(2, 8), callback, None);
    acceptor.start_accepting().await?;

    let _client = tokio::net::TcpStream::connect(addr).await?;
    let (connection, slot) = timeout(SECOND, accepted.recv())
        .await?
        .ok_or("acceptor stopped")?;
    assert!(connection.remote_addr().is_some());
    assert_eq!(acceptor.connection_count(), 1);
    slot.complete().await;
    assert_eq!(acceptor.connection_count(), 0);

    acceptor.dispose().await;
    acceptor.wait().await;
    Ok(())
}
