//! Tests for the service host.

use std::sync::atomic::{AtomicUsize, Ordering};

use rstest::rstest;

use super::*;
use crate::{
    channel::{ClientDuplexSessionChannel, ClientSessionOptions},
    config::Timeouts,
    dispatcher::{DispatchOperation, OperationContext, OperationError, operation_fn},
    encoding::{BinaryMessageEncoder, TextMessageEncoder},
    message::{Message, MessageFault, MessageVersion},
    test_helpers::{MemoryDialer, MemoryListener},
};

const ADDRESS: &str = "net.tcp://localhost/calc";
const SECOND: Duration = Duration::from_secs(1);

fn url(s: &str) -> Url { Url::parse(s).expect("valid uri") }

fn text() -> Arc<dyn MessageEncoder> { Arc::new(TextMessageEncoder::soap12()) }

#[derive(Default)]
struct Counter(AtomicUsize);

fn runtime() -> DispatchRuntime {
    DispatchRuntime::new()
        .with_operation(DispatchOperation::new(
            "Echo",
            "urn:echo",
            operation_fn(|_, mut request: Message| async move {
                request.read_body::<String>().map_err(OperationError::from)
            }),
        ))
        .with_operation(DispatchOperation::new(
            "Count",
            "urn:count",
            operation_fn(|context: OperationContext, _| async move {
                let counter = context
                    .instance_context()
                    .instance_as::<Counter>()
                    .ok_or_else(|| OperationError::failed("no counter"))?;
                Ok((counter.0.fetch_add(1, Ordering::SeqCst) + 1).to_string())
            }),
        ))
        .with_operation(
            DispatchOperation::new("Bye", "urn:bye", operation_fn(|_, _| async { Ok(()) })).terminating(),
        )
}

fn endpoint() -> EndpointDescription { EndpointDescription::new(url(ADDRESS), "Calc", text(), runtime()) }

async fn serve(builder: ServiceHostBuilder) -> (ServiceHost, TransportManager, MemoryDialer) {
    let transport = TransportManager::new(TransportSettings::default());
    let (memory, dialer) = MemoryListener::new(808);
    transport.adopt_listener(808, memory).await.expect("adopt");
    let host = builder.build().expect("build");
    host.open(&transport).await.expect("open");
    (host, transport, dialer)
}

async fn connect(dialer: &MemoryDialer) -> ClientDuplexSessionChannel {
    let connection = dialer.dial().expect("dial");
    ClientDuplexSessionChannel::open(connection, ClientSessionOptions::new(ADDRESS, text()))
        .await
        .expect("client open")
}

async fn call(client: &ClientDuplexSessionChannel, action: &str, body: &str) -> Message {
    let mut request = Message::new(MessageVersion::default(), action, body);
    request.headers_mut().set_to(ADDRESS);
    request.headers_mut().set_message_id("urn:uuid:call");
    client.send(&request, SECOND).await.expect("send");
    client.receive(SECOND).await.expect("receive").expect("reply")
}

#[tokio::test]
async fn requests_are_answered_over_the_transport() {
    let (host, transport, dialer) = serve(ServiceHost::builder().add_endpoint(endpoint())).await;
    assert_eq!(host.state(), CommunicationState::Opened);

    let client = connect(&dialer).await;
    let mut reply = call(&client, "urn:echo", "hello").await;
    assert_eq!(reply.headers().action(), Some("urn:echoResponse"));
    assert_eq!(reply.headers().relates_to(), Some("urn:uuid:call"));
    assert_eq!(reply.read_body::<String>().expect("body"), "hello");

    let mut fault = call(&client, "urn:missing", "").await;
    let fault = fault.read_body::<MessageFault>().expect("fault");
    assert_eq!(fault.code.innermost().name, "ActionNotSupported");

    client.close(SECOND).await.expect("client close");
    host.close(SECOND).await.expect("host close");
    transport.close().await;
}

#[tokio::test]
async fn closing_the_host_ends_open_sessions() {
    let (host, transport, dialer) = serve(ServiceHost::builder().add_endpoint(endpoint())).await;
    let client = connect(&dialer).await;
    call(&client, "urn:echo", "x").await;
    assert_eq!(host.sessions().active_ids().len(), 1);

    let host = Arc::new(host);
    let closing = {
        let host = Arc::clone(&host);
        tokio::spawn(async move { host.close(SECOND).await })
    };
    assert!(client.receive(SECOND).await.expect("ok").is_none());
    client.close(SECOND).await.expect("client close");
    closing.await.expect("join").expect("host close");

    assert_eq!(host.state(), CommunicationState::Closed);
    assert!(host.instance_contexts().is_empty());
    assert!(host.sessions().active_ids().is_empty());
    transport.close().await;
}

#[tokio::test(start_paused = true)]
async fn unresponsive_sessions_are_aborted_when_close_times_out() {
    let (host, transport, dialer) = serve(ServiceHost::builder().add_endpoint(endpoint())).await;
    let client = connect(&dialer).await;
    call(&client, "urn:echo", "x").await;

    let err = host
        .close(Duration::from_millis(100))
        .await
        .expect_err("client never closes");
    assert!(matches!(
        err,
        HostError::Transport(CommunicationError::Timeout { operation: "service host close", .. })
    ));
    assert_eq!(host.state(), CommunicationState::Closed);
    assert!(host.instance_contexts().is_empty());
    transport.close().await;
}

#[tokio::test(start_paused = true)]
async fn terminating_operation_gives_the_client_one_close_timeout() {
    let settings = TransportSettings {
        timeouts: Timeouts {
            close: SECOND,
            ..Timeouts::default()
        },
        ..TransportSettings::default()
    };
    let (host, transport, dialer) =
        serve(ServiceHost::builder().add_endpoint(endpoint()).with_settings(settings)).await;
    let client = connect(&dialer).await;
    call(&client, "urn:bye", "").await;
    assert_eq!(host.sessions().active_ids().len(), 1);

    tokio::time::sleep(2 * SECOND).await;
    assert!(host.sessions().active_ids().is_empty());
    assert!(client.receive(SECOND).await.is_err());
    host.close(SECOND).await.expect("host close");
    transport.close().await;
}

#[tokio::test]
async fn singleton_state_is_shared_across_sessions() {
    let builder = ServiceHost::builder()
        .add_endpoint(endpoint())
        .singleton(Counter::default());
    let (host, transport, dialer) = serve(builder).await;

    let first = connect(&dialer).await;
    let second = connect(&dialer).await;
    let mut a = call(&first, "urn:count", "").await;
    let mut b = call(&second, "urn:count", "").await;
    assert_eq!(a.read_body::<String>().expect("body"), "1");
    assert_eq!(b.read_body::<String>().expect("body"), "2");
    assert_eq!(host.instance_contexts().len(), 1);

    first.close(SECOND).await.expect("close");
    second.close(SECOND).await.expect("close");
    host.close(SECOND).await.expect("host close");
    transport.close().await;
}

#[tokio::test]
async fn per_session_state_is_private() {
    let builder = ServiceHost::builder()
        .add_endpoint(endpoint())
        .instance_factory(InstanceContextMode::PerSession, Counter::default);
    let (host, transport, dialer) = serve(builder).await;

    let first = connect(&dialer).await;
    let second = connect(&dialer).await;
    call(&first, "urn:count", "").await;
    let mut again = call(&first, "urn:count", "").await;
    let mut other = call(&second, "urn:count", "").await;
    assert_eq!(again.read_body::<String>().expect("body"), "2");
    assert_eq!(other.read_body::<String>().expect("body"), "1");

    first.close(SECOND).await.expect("close");
    second.close(SECOND).await.expect("close");
    host.close(SECOND).await.expect("host close");
    transport.close().await;
}

#[rstest]
#[case::duplicate(
    vec![endpoint(), EndpointDescription::new(url("net.tcp://localhost/CALC/"), "Calc", text(), runtime())],
    "DuplicateEndpoint"
)]
#[case::empty(
    vec![EndpointDescription::new(url(ADDRESS), "Nothing", text(), DispatchRuntime::new())],
    "EmptyContract"
)]
#[case::content_type(
    vec![endpoint(), EndpointDescription::new(url(ADDRESS), "Other", Arc::new(BinaryMessageEncoder::new()), runtime())],
    "ContentTypeConflict"
)]
fn invalid_endpoint_sets_are_rejected(#[case] endpoints: Vec<EndpointDescription>, #[case] expected: &str) {
    let builder = endpoints
        .into_iter()
        .fold(ServiceHost::builder(), ServiceHostBuilder::add_endpoint);
    let err = builder.build().expect_err("invalid");
    assert!(format!("{err:?}").starts_with(expected), "{err:?}");
}

#[tokio::test]
async fn second_open_is_rejected_and_failed_opens_release_listeners() {
    let (host, transport, _dialer) = serve(ServiceHost::builder().add_endpoint(endpoint())).await;
    assert!(matches!(
        host.open(&transport).await,
        Err(HostError::InvalidState(CommunicationState::Opened))
    ));

    let clash = ServiceHost::builder()
        .add_endpoint(EndpointDescription::new(url("net.tcp://localhost/free"), "Free", text(), runtime()))
        .add_endpoint(EndpointDescription::new(url(ADDRESS), "Calc", text(), runtime()))
        .build()
        .expect("build");
    assert!(matches!(
        clash.open(&transport).await,
        Err(HostError::Transport(CommunicationError::AddressAlreadyInUse(_)))
    ));
    assert_eq!(clash.state(), CommunicationState::Faulted);

    let retry = ServiceHost::builder()
        .add_endpoint(EndpointDescription::new(url("net.tcp://localhost/free"), "Free", text(), runtime()))
        .build()
        .expect("build");
    retry.open(&transport).await.expect("address was released");

    retry.close(SECOND).await.expect("close");
    host.close(SECOND).await.expect("close");
    transport.close().await;
}
