//! Duplex session channels exchanging messages over in-memory connections.

mod common;

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use common::{SOAP12, VIA, routed_listener, text};
use corewcf::{
    ClientDuplexSessionChannel,
    CommunicationError,
    CommunicationState,
    ServerDuplexSessionChannel,
    channel::ClientSessionOptions,
    config::TransportSettings,
    connection::Connection,
    framing::{FramingFault, writer::PREAMBLE_ACK},
    message::{Message, MessageError, MessageHeader, MessageVersion},
    transport::ServerPreambleReader,
};
use corewcf_testing::{CONNECTION_BUFFER, RecordBuilder, connection_pair, first_fault};
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

const SECOND: Duration = Duration::from_secs(1);

struct Session {
    client: Arc<ClientDuplexSessionChannel>,
    server: ServerDuplexSessionChannel,
}

async fn open_session(settings: TransportSettings) -> Session {
    let (client_stream, server_stream) = duplex(64 * 1024);
    let (table, listener) = routed_listener(settings);
    let reader = ServerPreambleReader::new(settings);
    let options = ClientSessionOptions::new(VIA, text()).with_settings(settings);
    let (client, accepted) = tokio::join!(
        ClientDuplexSessionChannel::open(Connection::new(client_stream, CONNECTION_BUFFER), options),
        reader.accept(Connection::new(server_stream, CONNECTION_BUFFER), &table),
    );
    accepted.expect("server accepted");
    let server = listener.accept_channel().await.expect("queued channel");
    Session {
        client: Arc::new(client.expect("client opened")),
        server,
    }
}

#[fixture]
fn settings() -> TransportSettings { TransportSettings::default() }

#[rstest]
#[tokio::test]
async fn concurrent_sends_arrive_whole(settings: TransportSettings) {
    let session = open_session(settings).await;

    let sends = (0..16).map(|i| {
        let client = Arc::clone(&session.client);
        tokio::spawn(async move {
            let body = format!("message {i} {}", "x".repeat(i * 97));
            let message = Message::new(MessageVersion::default(), "urn:burst", body);
            client.send(&message, SECOND).await
        })
    });
    for send in futures::future::join_all(sends).await {
        send.expect("task").expect("send");
    }

    let mut seen = BTreeSet::new();
    for _ in 0..16 {
        let mut message = session
            .server
            .receive(SECOND)
            .await
            .expect("receive")
            .expect("message");
        assert_eq!(message.headers().action(), Some("urn:burst"));
        seen.insert(message.read_body::<String>().expect("body"));
    }
    let expected: BTreeSet<_> = (0..16)
        .map(|i| format!("message {i} {}", "x".repeat(i * 97)))
        .collect();
    assert_eq!(seen, expected);

    session.client.close_output_session(SECOND).await.expect("end");
    assert!(session.server.receive(SECOND).await.expect("end").is_none());
    session.server.close(SECOND).await.expect("server close");
    session.client.close(SECOND).await.expect("client close");
    assert_eq!(session.server.state(), CommunicationState::Closed);
    assert_eq!(session.client.state(), CommunicationState::Closed);
}

#[rstest]
#[tokio::test]
async fn headers_and_body_survive_the_trip(settings: TransportSettings) {
    let session = open_session(settings).await;

    let mut message = Message::new(MessageVersion::default(), "urn:greet", "hello");
    message.headers_mut().set_to(VIA);
    message.headers_mut().set_message_id("urn:uuid:0f1e2d3c-0000-4000-8000-000000000001");
    message
        .headers_mut()
        .add(MessageHeader::new("Tenant", "urn:test:tenancy", "blue"));
    session.client.send(&message, SECOND).await.expect("send");

    let mut received = session
        .server
        .receive(SECOND)
        .await
        .expect("receive")
        .expect("message");
    let headers = received.headers();
    assert_eq!(headers.action(), Some("urn:greet"));
    assert_eq!(headers.to(), Some(VIA));
    assert_eq!(
        headers.message_id(),
        Some("urn:uuid:0f1e2d3c-0000-4000-8000-000000000001")
    );
    let tenant = headers.get("Tenant", "urn:test:tenancy").expect("custom header");
    assert_eq!(tenant.value, "blue");
    assert!(!tenant.must_understand);

    assert_eq!(received.read_body::<String>().expect("body"), "hello");
    assert!(matches!(
        received.read_body::<String>(),
        Err(MessageError::BodyAlreadyRead)
    ));

    session.client.abort().await;
    session.server.abort().await;
}

#[rstest]
#[tokio::test]
async fn replies_flow_back_to_the_client(settings: TransportSettings) {
    let session = open_session(settings).await;

    let request = Message::new(MessageVersion::default(), "urn:ping", ());
    session.client.send(&request, SECOND).await.expect("send");
    let ping = session.server.receive(SECOND).await.expect("receive").expect("ping");
    assert_eq!(ping.headers().action(), Some("urn:ping"));

    let reply = Message::new(MessageVersion::default(), "urn:pong", "pong");
    session.server.send(&reply, SECOND).await.expect("reply");
    let mut pong = session.client.receive(SECOND).await.expect("receive").expect("pong");
    assert_eq!(pong.read_body::<String>().expect("body"), "pong");

    session.server.close_output_session(SECOND).await.expect("server end");
    assert!(session.client.receive(SECOND).await.expect("end").is_none());
    session.client.close(SECOND).await.expect("client close");
    session.server.close(SECOND).await.expect("server close");
}

#[rstest]
#[tokio::test]
async fn receive_timeouts_leave_the_channel_open(settings: TransportSettings) {
    let session = open_session(settings).await;

    let err = session
        .server
        .receive(Duration::from_millis(20))
        .await
        .expect_err("nothing sent");
    assert!(err.is_timeout());
    assert_eq!(session.server.state(), CommunicationState::Opened);

    let message = Message::new(MessageVersion::default(), "urn:late", "late");
    session.client.send(&message, SECOND).await.expect("send");
    assert!(session.server.receive(SECOND).await.expect("receive").is_some());

    session.client.abort().await;
    session.server.abort().await;
}

#[tokio::test]
async fn oversized_sends_are_refused_without_writing() {
    let settings = TransportSettings {
        max_buffer_size: 512,
        ..TransportSettings::default()
    };
    let session = open_session(settings).await;

    let message = Message::new(MessageVersion::default(), "urn:big", "x".repeat(2048));
    let err = session.client.send(&message, SECOND).await.expect_err("quota");
    assert!(matches!(err, CommunicationError::QuotaExceeded { max: 512, .. }));
    assert_eq!(session.client.state(), CommunicationState::Opened);

    let small = Message::new(MessageVersion::default(), "urn:small", "ok");
    session.client.send(&small, SECOND).await.expect("send");
    let mut received = session.server.receive(SECOND).await.expect("receive").expect("message");
    assert_eq!(received.read_body::<String>().expect("body"), "ok");

    session.client.abort().await;
    session.server.abort().await;
}

#[tokio::test]
async fn oversized_envelopes_fault_the_session() {
    let settings = TransportSettings {
        max_buffer_size: 1024,
        ..TransportSettings::default()
    };
    let (table, listener) = routed_listener(settings);
    let (connection, mut client) = connection_pair(16 * 1024);
    let bytes = RecordBuilder::new()
        .duplex_preamble(VIA, SOAP12)
        .preamble_end()
        .envelope_declaring(4096, b"<s:Envelope")
        .build();
    client.write_all(&bytes).await.expect("write");

    ServerPreambleReader::new(settings)
        .accept(connection, &table)
        .await
        .expect("accepted");
    let server = listener.accept_channel().await.expect("queued channel");
    let err = server.receive(SECOND).await.expect_err("quota");
    assert!(matches!(
        err,
        CommunicationError::QuotaExceeded { size: 4096, max: 1024 }
    ));
    assert_eq!(server.state(), CommunicationState::Faulted);

    let mut out = Vec::new();
    client.read_to_end(&mut out).await.expect("read");
    assert_eq!(out[0], PREAMBLE_ACK[0]);
    assert_eq!(first_fault(&out[1..]), Some(FramingFault::MaxMessageSizeExceeded));
    assert_eq!(
        out[1..].to_vec(),
        corewcf::framing::writer::fault(&FramingFault::MaxMessageSizeExceeded).to_vec()
    );
}

#[tokio::test]
async fn eof_inside_an_envelope_is_a_protocol_error() {
    let settings = TransportSettings::default();
    let (table, listener) = routed_listener(settings);
    let (connection, mut client) = connection_pair(16 * 1024);
    let bytes = RecordBuilder::new()
        .duplex_preamble(VIA, SOAP12)
        .preamble_end()
        .envelope_declaring(100, b"<s:Envelope")
        .build();
    client.write_all(&bytes).await.expect("write");
    client.shutdown().await.expect("shutdown");

    ServerPreambleReader::new(settings)
        .accept(connection, &table)
        .await
        .expect("accepted");
    let server = listener.accept_channel().await.expect("queued channel");
    let err = server.receive(SECOND).await.expect_err("premature eof");
    assert!(err.is_protocol());
    assert_eq!(server.state(), CommunicationState::Faulted);
}
