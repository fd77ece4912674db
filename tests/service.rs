//! Service hosts answering clients over loopback TCP and in-memory
//! listeners.

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{text, url};
use corewcf::{
    ClientBuilder,
    ClientOperation,
    CommunicationError,
    DispatchOperation,
    DispatchRuntime,
    EndpointDescription,
    InstanceContextMode,
    OperationContext,
    OperationError,
    ServiceClient,
    ServiceHost,
    TransportManager,
    TransportSettings,
    encoding::{BinaryMessageEncoder, MessageEncoder},
    operation_fn,
};
use corewcf_testing::{LoggerHandle, MemoryDialer, MemoryListener, TestResult, logger, unused_listener};
use rstest::rstest;

const SECOND: Duration = Duration::from_secs(1);
const COUNTER: &str = "net.tcp://localhost/counter";

#[derive(Default)]
struct Counter(AtomicUsize);

fn runtime() -> DispatchRuntime {
    DispatchRuntime::new()
        .with_operation(DispatchOperation::new(
            "Increment",
            "urn:counter:increment",
            operation_fn(|context: OperationContext, _| async move {
                let counter = context
                    .instance_context()
                    .instance_as::<Counter>()
                    .ok_or_else(|| OperationError::failed("no counter"))?;
                Ok::<_, OperationError>((counter.0.fetch_add(1, Ordering::SeqCst) + 1).to_string())
            }),
        ))
        .with_operation(DispatchOperation::new(
            "Shared",
            "urn:counter:shared",
            operation_fn(|context: OperationContext, _| async move {
                Ok(context.instance_context().is_singleton().to_string())
            }),
        ))
}

fn contract() -> ClientBuilder {
    ClientBuilder::new()
        .with_operation(ClientOperation::new("Increment", "urn:counter:increment"))
        .with_operation(ClientOperation::new("Shared", "urn:counter:shared"))
}

fn host(address: &str, mode: InstanceContextMode) -> ServiceHost {
    ServiceHost::builder()
        .add_endpoint(EndpointDescription::new(url(address), "Counter", text(), runtime()))
        .instance_factory(mode, Counter::default)
        .build()
        .expect("valid host")
}

async fn in_memory(mode: InstanceContextMode) -> (ServiceHost, TransportManager, MemoryDialer) {
    let transport = TransportManager::new(TransportSettings::default());
    let (memory, dialer) = MemoryListener::new(808);
    transport.adopt_listener(808, memory).await.expect("adopt");
    let host = host(COUNTER, mode);
    host.open(&transport).await.expect("open");
    (host, transport, dialer)
}

async fn connect(dialer: &MemoryDialer) -> ServiceClient {
    contract()
        .connect_over(dialer.dial().expect("dial"), &url(COUNTER))
        .await
        .expect("connect")
}

async fn call(client: &ServiceClient, operation: &str) -> String {
    client
        .call(operation, ())
        .await
        .expect("reply")
        .read_body::<String>()
        .expect("body")
}

#[rstest]
#[case::per_call(InstanceContextMode::PerCall, ["1", "1", "1"], "false")]
#[case::per_session(InstanceContextMode::PerSession, ["1", "2", "1"], "false")]
#[case::single(InstanceContextMode::Single, ["1", "2", "3"], "true")]
#[tokio::test]
async fn instance_modes_scope_service_state(
    #[case] mode: InstanceContextMode,
    #[case] counts: [&str; 3],
    #[case] shared: &str,
) {
    let (host, transport, dialer) = in_memory(mode).await;

    let first = connect(&dialer).await;
    assert_eq!(call(&first, "Increment").await, counts[0]);
    assert_eq!(call(&first, "Increment").await, counts[1]);
    let second = connect(&dialer).await;
    assert_eq!(call(&second, "Increment").await, counts[2]);
    assert_eq!(call(&second, "Shared").await, shared);

    first.close(SECOND).await.expect("close first");
    second.close(SECOND).await.expect("close second");
    host.close(SECOND).await.expect("host close");
    transport.close().await;
}

#[tokio::test]
async fn per_session_instances_are_released_with_their_session() {
    let (host, transport, dialer) = in_memory(InstanceContextMode::PerSession).await;

    let client = connect(&dialer).await;
    call(&client, "Increment").await;
    assert_eq!(host.instance_contexts().len(), 1);
    client.close(SECOND).await.expect("close");

    tokio::time::timeout(SECOND, async {
        while !host.instance_contexts().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("instance released");

    host.close(SECOND).await.expect("host close");
    transport.close().await;
}

#[tokio::test]
async fn mismatched_encoders_are_rejected_by_content_type() {
    let (host, transport, dialer) = in_memory(InstanceContextMode::PerSession).await;

    let binary: Arc<dyn MessageEncoder> = Arc::new(BinaryMessageEncoder::new());
    let err = contract()
        .with_encoder(binary)
        .connect_over(dialer.dial().expect("dial"), &url(COUNTER))
        .await
        .expect_err("rejected");
    let CommunicationError::Protocol(reason) = err else {
        panic!("expected a protocol error, got {err:?}");
    };
    assert!(reason.contains("application/soap+msbin1"), "{reason}");

    host.close(SECOND).await.expect("host close");
    transport.close().await;
}

#[tokio::test]
async fn unknown_addresses_are_not_found() {
    let (host, transport, dialer) = in_memory(InstanceContextMode::PerSession).await;

    let err = contract()
        .connect_over(dialer.dial().expect("dial"), &url("net.tcp://localhost/elsewhere"))
        .await
        .expect_err("rejected");
    assert!(matches!(err, CommunicationError::EndpointNotFound(ref via) if via.contains("/elsewhere")));

    host.close(SECOND).await.expect("host close");
    transport.close().await;
}

#[rstest]
#[tokio::test]
async fn loopback_tcp_round_trip(mut logger: LoggerHandle) -> TestResult {
    let transport = TransportManager::new(TransportSettings::default());
    let addr = transport.bind_existing_listener(unused_listener()?).await?;
    let address = format!("net.tcp://127.0.0.1:{}/counter", addr.port());
    let host = host(&address, InstanceContextMode::PerSession);
    host.open(&transport).await?;

    let client = contract().nodelay(true).connect(&url(&address)).await?;
    let mut reply = client.call("Increment", ()).await?;
    assert_eq!(reply.read_body::<String>()?, "1");
    assert!(logger.contains("dispatching"));

    client.close(SECOND).await?;
    host.close(SECOND).await?;
    transport.close().await;
    Ok(())
}
