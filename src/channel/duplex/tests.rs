//! Tests for the duplex session channel.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
    sync::oneshot,
};

use super::*;
use crate::{
    encoding::TextMessageEncoder,
    framing::{
        DecoderLimits,
        writer::{ClientPreamble, PREAMBLE_ACK, PREAMBLE_END},
    },
    message::MessageVersion,
};

const VIA: &str = "net.tcp://localhost/echo";
const SECOND: Duration = Duration::from_secs(1);

fn encoder() -> Arc<dyn MessageEncoder> { Arc::new(TextMessageEncoder::soap12()) }

fn server_decoder() -> ServerSessionDecoder {
    let mut decoder = ServerSessionDecoder::new(DecoderLimits::default());
    let preamble = ClientPreamble::new(VIA, encoder().content_type())
        .encode()
        .expect("preamble");
    decoder.decode(&preamble).expect("preamble decodes");
    decoder.decode(&PREAMBLE_END).expect("preamble end decodes");
    decoder
}

fn client_decoder() -> ClientDuplexDecoder {
    let mut decoder = ClientDuplexDecoder::awaiting_ack();
    decoder.decode(&PREAMBLE_ACK).expect("ack decodes");
    decoder
}

fn channel<D: SessionDecoder>(
    stream: DuplexStream,
    decoder: D,
    settings: TransportSettings,
    report_faults: bool,
) -> DuplexSessionChannel<D> {
    DuplexSessionChannel::from_parts(ChannelParts {
        connection: Connection::new(stream, 64),
        decoder,
        encoder: encoder(),
        buffers: BufferManager::new(4, settings.max_buffer_size),
        session: SessionInfo::new(VIA, encoder().content_type()),
        settings,
        report_faults,
    })
}

fn pair() -> (ServerDuplexSessionChannel, ClientDuplexSessionChannel) {
    let (a, b) = duplex(1 << 16);
    let settings = TransportSettings::default();
    (
        channel(a, server_decoder(), settings, true),
        channel(b, client_decoder(), settings, false),
    )
}

fn client_with_raw_peer(settings: TransportSettings) -> (ClientDuplexSessionChannel, DuplexStream) {
    let (a, peer) = duplex(1 << 16);
    (channel(a, client_decoder(), settings, false), peer)
}

fn message(action: &str) -> Message { Message::new(MessageVersion::default(), action, "payload") }

#[tokio::test]
async fn messages_flow_both_ways() {
    let (server, client) = pair();
    client.send(&message("urn:request"), SECOND).await.expect("send");
    let mut request = server.receive(SECOND).await.expect("ok").expect("request");
    assert_eq!(request.headers().action(), Some("urn:request"));
    assert_eq!(request.properties().session_id.as_deref(), Some(server.session_id()));
    assert_eq!(request.read_body::<String>().expect("body"), "payload");

    server.send(&message("urn:reply"), SECOND).await.expect("send");
    let reply = client.receive(SECOND).await.expect("ok").expect("reply");
    assert_eq!(reply.headers().action(), Some("urn:reply"));
}

#[tokio::test]
async fn concurrent_sends_never_interleave() {
    let (server, client) = pair();
    let client = Arc::new(client);
    let mut tasks = Vec::new();
    for sender in 0..16 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            for n in 0..4 {
                client
                    .send(&message(&format!("urn:m{sender}-{n}")), SECOND)
                    .await
                    .expect("send");
            }
        }));
    }
    for task in tasks {
        task.await.expect("sender task");
    }

    let mut seen = HashSet::new();
    for _ in 0..64 {
        let received = server.receive(SECOND).await.expect("intact record").expect("message");
        seen.insert(received.headers().action().map(str::to_owned));
    }
    assert_eq!(seen.len(), 64);
}

#[tokio::test]
async fn close_handshake_drains_both_sides() {
    let (server, client) = pair();
    let client = Arc::new(client);
    let closing = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.close(SECOND).await })
    };

    assert!(server.receive(SECOND).await.expect("ok").is_none());
    server.close(SECOND).await.expect("server close");
    closing.await.expect("join").expect("client close");

    assert_eq!(server.state(), CommunicationState::Closed);
    assert_eq!(client.state(), CommunicationState::Closed);
}

#[tokio::test]
async fn message_while_closing_is_a_protocol_error() {
    let (server, client) = pair();
    server.send(&message("urn:late"), SECOND).await.expect("send");

    let err = client.close(SECOND).await.expect_err("undrained message");
    assert!(matches!(err, CommunicationError::Protocol(ref m) if m.contains("unexpected message")));
    assert_eq!(client.state(), CommunicationState::Closed);
}

#[tokio::test(start_paused = true)]
async fn send_lock_timeout_leaves_the_channel_open() {
    let (_server, client) = pair();
    let held = client.writer.lock().await;
    let err = client
        .send(&message("urn:blocked"), Duration::from_millis(10))
        .await
        .expect_err("lock held");
    assert!(matches!(err, CommunicationError::Timeout { operation: "send", .. }));
    drop(held);

    assert_eq!(client.state(), CommunicationState::Opened);
    client.send(&message("urn:after"), SECOND).await.expect("send after release");
}

#[tokio::test]
async fn malformed_input_faults_the_channel() {
    let (local, mut peer) = duplex(1024);
    let server = channel(local, server_decoder(), TransportSettings::default(), true);
    peer.write_all(&[0xff]).await.expect("write");

    let err = server.receive(SECOND).await.expect_err("bad record");
    assert!(err.is_protocol());
    assert_eq!(server.state(), CommunicationState::Faulted);
    assert!(matches!(
        server.send(&message("urn:x"), SECOND).await,
        Err(CommunicationError::ObjectFaulted(_))
    ));
}

#[tokio::test]
async fn oversized_send_is_refused_without_faulting() {
    let settings = TransportSettings {
        max_buffer_size: 64,
        ..TransportSettings::default()
    };
    let (client, mut peer) = client_with_raw_peer(settings);
    let err = client
        .send(&message("urn:too-big"), SECOND)
        .await
        .expect_err("over quota");
    assert!(matches!(err, CommunicationError::QuotaExceeded { max: 64, .. }));
    assert_eq!(client.state(), CommunicationState::Opened);

    client.abort().await;
    let mut written = Vec::new();
    peer.read_to_end(&mut written).await.expect("read");
    assert!(written.is_empty());
}

#[tokio::test]
async fn abort_fails_a_pending_receive() {
    let (server, _client) = pair();
    let server = Arc::new(server);
    let pending = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.receive(Duration::from_secs(60)).await })
    };
    tokio::task::yield_now().await;

    server.abort().await;
    let result = pending.await.expect("join");
    assert!(matches!(result, Err(CommunicationError::Aborted(_))));
    assert_eq!(server.state(), CommunicationState::Closed);
}

#[tokio::test]
async fn graceful_close_hands_the_connection_back() {
    let (server, client) = pair();
    let (tx, rx) = oneshot::channel();
    let server = server.with_connection_reuse(Box::new(move |connection| {
        let _ = tx.send(connection);
    }));
    let client = Arc::new(client);
    let closing = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.close(SECOND).await })
    };

    assert!(server.receive(SECOND).await.expect("ok").is_none());
    server.close(SECOND).await.expect("server close");
    closing.await.expect("join").expect("client close");
    let connection = rx.await.expect("connection handed back");
    assert!(connection.buffered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_timeout_degrades_to_abort() {
    let (client, _peer) = client_with_raw_peer(TransportSettings::default());
    let err = client
        .close(Duration::from_millis(50))
        .await
        .expect_err("peer never ends");
    assert!(matches!(err, CommunicationError::Timeout { operation: "close", .. }));
    assert_eq!(client.state(), CommunicationState::Closed);
}

#[tokio::test]
async fn output_session_closes_once() {
    let (client, mut peer) = client_with_raw_peer(TransportSettings::default());
    client.close_output_session(SECOND).await.expect("first");
    client.close_output_session(SECOND).await.expect("second is a no-op");
    assert!(matches!(
        client.send(&message("urn:x"), SECOND).await,
        Err(CommunicationError::InvalidState { object: "output session", .. })
    ));

    client.abort().await;
    let mut written = Vec::new();
    peer.read_to_end(&mut written).await.expect("read");
    assert_eq!(written, END.to_vec());
}
