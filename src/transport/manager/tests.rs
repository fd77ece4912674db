//! Tests for the transport manager.

use std::time::Duration;

use tokio::sync::oneshot;

use super::*;
use crate::{
    channel::{ClientDuplexSessionChannel, ClientSessionOptions},
    encoding::TextMessageEncoder,
    message::{Message, MessageVersion},
    test_helpers::{MemoryDialer, MemoryListener},
};

const SECOND: Duration = Duration::from_secs(1);

fn url(s: &str) -> Url { Url::parse(s).expect("valid uri") }

fn listener(uri: &str) -> Arc<ChannelListener> {
    Arc::new(ChannelListener::new(url(uri), Arc::new(TextMessageEncoder::soap12())))
}

async fn memory_manager() -> (TransportManager, MemoryDialer) {
    let manager = TransportManager::new(TransportSettings::default());
    let (memory, incoming) = MemoryListener::new(808);
    manager.adopt_listener(808, memory).await.expect("adopt");
    (manager, incoming)
}

fn dial(incoming: &MemoryDialer) -> Connection { incoming.dial().expect("manager accepting") }

async fn open(connection: Connection, via: &str) -> ClientDuplexSessionChannel {
    let options = ClientSessionOptions::new(via, Arc::new(TextMessageEncoder::soap12()));
    ClientDuplexSessionChannel::open(connection, options)
        .await
        .expect("client open")
}

fn message(action: &str) -> Message { Message::new(MessageVersion::default(), action, "payload") }

#[tokio::test]
async fn sessions_reach_the_registered_listener() {
    let (manager, incoming) = memory_manager().await;
    let calc = manager
        .register(listener("net.tcp://localhost/calc"))
        .await
        .expect("register");
    assert_eq!(calc.listener().state(), CommunicationState::Opened);

    let client = open(dial(&incoming), "net.tcp://localhost/calc").await;
    let server = calc.listener().accept_channel().await.expect("channel");
    client.send(&message("urn:add"), SECOND).await.expect("send");
    let request = server.receive(SECOND).await.expect("ok").expect("request");
    assert_eq!(request.headers().action(), Some("urn:add"));

    manager.close().await;
    assert_eq!(calc.listener().state(), CommunicationState::Closed);
}

#[tokio::test]
async fn longest_registered_prefix_wins() {
    let (manager, incoming) = memory_manager().await;
    let svc = manager.register(listener("net.tcp://localhost/svc")).await.expect("svc");
    let admin = manager
        .register(listener("net.tcp://localhost/svc/admin"))
        .await
        .expect("admin");

    let _client = open(dial(&incoming), "net.tcp://localhost/SVC/Admin/users").await;
    let channel = admin.listener().accept_channel().await.expect("admin channel");
    assert_eq!(channel.via(), "net.tcp://localhost/SVC/Admin/users");

    let _other = open(dial(&incoming), "net.tcp://localhost/svc/orders").await;
    assert!(svc.listener().accept_channel().await.is_some());
    manager.close().await;
}

#[tokio::test]
async fn duplicate_uri_is_already_in_use() {
    let (manager, _incoming) = memory_manager().await;
    let _first = manager.register(listener("net.tcp://localhost/calc")).await.expect("first");
    let err = manager
        .register(listener("net.tcp://otherhost/Calc"))
        .await
        .expect_err("duplicate");
    assert!(matches!(err, CommunicationError::AddressAlreadyInUse(_)));
    manager.close().await;
}

#[tokio::test]
async fn adopting_a_served_port_fails() {
    let (manager, _incoming) = memory_manager().await;
    let (again, _dialer) = MemoryListener::new(808);
    assert!(matches!(
        manager.adopt_listener(808, again).await,
        Err(CommunicationError::AddressAlreadyInUse(_))
    ));
    manager.close().await;
}

#[tokio::test]
async fn unregistering_closes_the_listener() {
    let (manager, incoming) = memory_manager().await;
    let calc = manager.register(listener("net.tcp://localhost/calc")).await.expect("register");
    let channel_listener = Arc::clone(calc.listener());
    calc.unregister().await;
    assert_eq!(channel_listener.state(), CommunicationState::Closed);

    let options = ClientSessionOptions::new(
        "net.tcp://localhost/calc",
        Arc::new(TextMessageEncoder::soap12()),
    );
    let err = ClientDuplexSessionChannel::open(dial(&incoming), options)
        .await
        .expect_err("nothing registered");
    assert!(matches!(err, CommunicationError::EndpointNotFound(_)));
    manager.close().await;
}

#[tokio::test]
async fn connection_is_reused_after_a_clean_session_end() {
    let (manager, incoming) = memory_manager().await;
    let calc = manager.register(listener("net.tcp://localhost/calc")).await.expect("register");

    let (tx, rx) = oneshot::channel();
    let client = open(dial(&incoming), "net.tcp://localhost/calc")
        .await
        .with_connection_reuse(Box::new(move |connection| {
            let _ = tx.send(connection);
        }));
    let server = calc.listener().accept_channel().await.expect("first channel");

    let closing = tokio::spawn(async move { client.close(SECOND).await });
    assert!(server.receive(SECOND).await.expect("ok").is_none());
    server.close(SECOND).await.expect("server close");
    closing.await.expect("join").expect("client close");

    let connection = rx.await.expect("client connection back");
    let again = open(connection, "net.tcp://localhost/calc").await;
    let second = calc.listener().accept_channel().await.expect("second channel");
    again.send(&message("urn:again"), SECOND).await.expect("send");
    let request = second.receive(SECOND).await.expect("ok").expect("request");
    assert_eq!(request.headers().action(), Some("urn:again"));
    manager.close().await;
}

#[tokio::test]
async fn existing_tcp_socket_serves_registrations() {
    let manager = TransportManager::new(TransportSettings::default());
    let socket = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = manager.bind_existing_listener(socket).await.expect("adopt socket");
    let via = format!("net.tcp://127.0.0.1:{}/echo", addr.port());
    let echo = manager.register(listener(&via)).await.expect("register");

    let stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let client = open(Connection::new(stream, 1024), &via).await;
    let server = echo.listener().accept_channel().await.expect("channel");
    assert!(server.remote_addr().is_some());

    server.send(&message("urn:hello"), SECOND).await.expect("send");
    let hello = client.receive(SECOND).await.expect("ok").expect("hello");
    assert_eq!(hello.headers().action(), Some("urn:hello"));
    manager.close().await;
}
