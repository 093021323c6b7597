//! End-to-end tests: a real TCP client speaking framed MessagePack
//! envelopes against the relay server, with scripted fake processes
//! behind the registry.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use relay::process::fake::FakeSpawner;
use relay::registry::{RegistryLimits, SessionRegistry};
use relay::server;

use protocol::{
    Envelope, ErrorCode, Frame, FrameCodec, Message, SessionAttach, SessionClose, SessionCreate,
    SessionInput,
};

/// Starts a relay on an ephemeral port with fake processes behind it.
async fn start_relay() -> (SocketAddr, SessionRegistry<FakeSpawner>, CancellationToken) {
    let registry = SessionRegistry::new(
        FakeSpawner::default(),
        RegistryLimits {
            max_sessions: 10,
            history_limit: 100,
            output_buffer_chunks: 64,
            grace_period: Duration::from_secs(60),
            remove_timeout: Duration::from_secs(10),
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    tokio::spawn(server::serve(listener, registry.clone(), shutdown.clone()));

    (addr, registry, shutdown)
}

/// Minimal test client speaking the relay's framed envelope protocol.
struct TestClient {
    stream: TcpStream,
    codec: FrameCodec,
    pending: Vec<u8>,
    sequence: u64,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(Duration::from_secs(5), TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self {
            stream,
            codec: FrameCodec::new(),
            pending: Vec::new(),
            sequence: 0,
        }
    }

    async fn send(&mut self, msg: Message) {
        let envelope = Envelope::new(self.sequence, msg);
        self.sequence += 1;
        let payload = envelope.to_msgpack().unwrap();
        let bytes = self.codec.encode(&Frame::new(payload)).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        loop {
            if let Some((frame, consumed)) = self.codec.try_decode(&self.pending).unwrap() {
                self.pending.drain(..consumed);
                return Envelope::from_msgpack(&frame.payload).unwrap().payload;
            }

            let mut buf = [0u8; 4096];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for message")
                .expect("read failed");
            assert!(n > 0, "connection closed while waiting for message");
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    async fn create_session(&mut self) -> String {
        self.send(Message::SessionCreate(SessionCreate::default()))
            .await;
        match self.recv().await {
            Message::SessionCreated(created) => created.session_id,
            other => panic!("expected created, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_create_and_echo_roundtrip() {
    let (addr, _registry, _shutdown) = start_relay().await;
    let mut client = TestClient::connect(addr).await;

    let id = client.create_session().await;

    client
        .send(Message::SessionInput(SessionInput {
            session_id: id.clone(),
            data: b"echo-1\n".to_vec(),
        }))
        .await;

    match client.recv().await {
        Message::SessionOutput(out) => {
            assert_eq!(out.session_id, id);
            assert_eq!(out.data, b"echo-1\n");
        }
        other => panic!("expected output, got {:?}", other),
    }
}

#[tokio::test]
async fn test_two_sessions_interleaved_on_one_connection() {
    let (addr, _registry, _shutdown) = start_relay().await;
    let mut client = TestClient::connect(addr).await;

    let id_a = client.create_session().await;
    let id_b = client.create_session().await;
    assert_ne!(id_a, id_b);

    client
        .send(Message::SessionInput(SessionInput {
            session_id: id_a.clone(),
            data: b"from-a\n".to_vec(),
        }))
        .await;
    client
        .send(Message::SessionInput(SessionInput {
            session_id: id_b.clone(),
            data: b"from-b\n".to_vec(),
        }))
        .await;

    let mut seen = Vec::new();
    for _ in 0..2 {
        match client.recv().await {
            Message::SessionOutput(out) => seen.push((out.session_id, out.data)),
            other => panic!("expected output, got {:?}", other),
        }
    }
    assert!(seen.contains(&(id_a, b"from-a\n".to_vec())));
    assert!(seen.contains(&(id_b, b"from-b\n".to_vec())));
}

#[tokio::test]
async fn test_output_order_within_session() {
    let (addr, _registry, _shutdown) = start_relay().await;
    let mut client = TestClient::connect(addr).await;

    let id = client.create_session().await;

    for i in 0..10 {
        client
            .send(Message::SessionInput(SessionInput {
                session_id: id.clone(),
                data: format!("line-{}\n", i).into_bytes(),
            }))
            .await;
    }

    for i in 0..10 {
        match client.recv().await {
            Message::SessionOutput(out) => {
                assert_eq!(out.data, format!("line-{}\n", i).into_bytes());
            }
            other => panic!("expected output, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_disconnect_buffers_and_reattach_replays() {
    let (addr, registry, _shutdown) = start_relay().await;

    let id = {
        let mut client = TestClient::connect(addr).await;
        let id = client.create_session().await;
        // Dropping the client severs the transport
        id
    };

    // Wait for the server to notice the disconnect and detach
    for _ in 0..100 {
        if registry.state(&id).await == Some(relay::SessionState::Detached) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.state(&id).await, Some(relay::SessionState::Detached));

    // Output produced while detached lands in the replay buffer
    registry.write(&id, b"while-away\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client2 = TestClient::connect(addr).await;
    client2
        .send(Message::SessionAttach(SessionAttach {
            session_id: id.clone(),
        }))
        .await;

    match client2.recv().await {
        Message::SessionOutput(out) => {
            assert_eq!(out.session_id, id);
            assert_eq!(out.data, b"while-away\n");
        }
        other => panic!("expected replayed output, got {:?}", other),
    }
}

#[tokio::test]
async fn test_second_connection_supersedes_first() {
    let (addr, _registry, _shutdown) = start_relay().await;

    let mut client1 = TestClient::connect(addr).await;
    let id = client1.create_session().await;

    let mut client2 = TestClient::connect(addr).await;
    client2
        .send(Message::SessionAttach(SessionAttach {
            session_id: id.clone(),
        }))
        .await;

    match client1.recv().await {
        Message::SessionSuperseded(s) => assert_eq!(s.session_id, id),
        other => panic!("expected superseded, got {:?}", other),
    }

    // Output flows to the new connection only
    client2
        .send(Message::SessionInput(SessionInput {
            session_id: id.clone(),
            data: b"for-client2\n".to_vec(),
        }))
        .await;
    match client2.recv().await {
        Message::SessionOutput(out) => assert_eq!(out.data, b"for-client2\n"),
        other => panic!("expected output, got {:?}", other),
    }
}

#[tokio::test]
async fn test_close_delivers_exit_and_retires_id() {
    let (addr, registry, _shutdown) = start_relay().await;
    let mut client = TestClient::connect(addr).await;

    let id = client.create_session().await;

    client
        .send(Message::SessionClose(SessionClose {
            session_id: id.clone(),
        }))
        .await;

    match client.recv().await {
        Message::SessionExit(exit) => assert_eq!(exit.session_id, id),
        other => panic!("expected exit, got {:?}", other),
    }

    for _ in 0..100 {
        if registry.is_closed(&id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registry.is_closed(&id));

    // The retired id keeps reporting closed
    client
        .send(Message::SessionAttach(SessionAttach {
            session_id: id.clone(),
        }))
        .await;
    match client.recv().await {
        Message::Error(err) => assert_eq!(err.code, ErrorCode::SessionClosed),
        other => panic!("expected closed error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_help_pseudo_command_over_wire() {
    let (addr, _registry, _shutdown) = start_relay().await;
    let mut client = TestClient::connect(addr).await;

    let id = client.create_session().await;

    client
        .send(Message::SessionInput(SessionInput {
            session_id: id.clone(),
            data: b"help\n".to_vec(),
        }))
        .await;

    match client.recv().await {
        Message::SessionOutput(out) => {
            let text = String::from_utf8_lossy(&out.data).to_string();
            assert!(text.contains("ShellMux relay commands"), "got: {text}");
        }
        other => panic!("expected help output, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_envelope_keeps_connection_alive() {
    let (addr, _registry, _shutdown) = start_relay().await;
    let mut client = TestClient::connect(addr).await;

    // Valid frame, garbage payload
    let codec = FrameCodec::new();
    let bad = codec.encode(&Frame::new(vec![0xde, 0xad, 0xbe, 0xef])).unwrap();
    client.send_raw(&bad).await;

    match client.recv().await {
        Message::Error(err) => assert_eq!(err.code, ErrorCode::Malformed),
        other => panic!("expected malformed error, got {:?}", other),
    }

    // The connection still works afterwards
    let id = client.create_session().await;
    assert!(!id.is_empty());
}

#[tokio::test]
async fn test_relay_bound_message_rejected_over_wire() {
    let (addr, _registry, _shutdown) = start_relay().await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(Message::SessionCreated(protocol::SessionCreated {
            session_id: "forged".to_string(),
        }))
        .await;

    match client.recv().await {
        Message::Error(err) => assert_eq!(err.code, ErrorCode::Malformed),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_session_error_is_scoped() {
    let (addr, _registry, _shutdown) = start_relay().await;
    let mut client = TestClient::connect(addr).await;

    client
        .send(Message::SessionInput(SessionInput {
            session_id: "no-such-id".to_string(),
            data: b"ls\n".to_vec(),
        }))
        .await;

    match client.recv().await {
        Message::Error(err) => {
            assert_eq!(err.code, ErrorCode::SessionNotFound);
            assert_eq!(err.session_id.as_deref(), Some("no-such-id"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_outbound_sequence_numbers_increase() {
    let (addr, _registry, _shutdown) = start_relay().await;
    let mut client = TestClient::connect(addr).await;

    // Read raw envelopes so the server-assigned sequences are visible
    async fn recv_envelope(client: &mut TestClient) -> Envelope {
        loop {
            if let Some((frame, consumed)) = client.codec.try_decode(&client.pending).unwrap() {
                client.pending.drain(..consumed);
                return Envelope::from_msgpack(&frame.payload).unwrap();
            }
            let mut buf = [0u8; 4096];
            let n = timeout(Duration::from_secs(5), client.stream.read(&mut buf))
                .await
                .expect("timed out waiting for envelope")
                .expect("read failed");
            assert!(n > 0, "connection closed while waiting for envelope");
            client.pending.extend_from_slice(&buf[..n]);
        }
    }

    client
        .send(Message::SessionCreate(SessionCreate::default()))
        .await;
    let first = recv_envelope(&mut client).await;
    let id = match first.payload {
        Message::SessionCreated(created) => created.session_id,
        other => panic!("expected created, got {:?}", other),
    };

    client
        .send(Message::SessionInput(SessionInput {
            session_id: id,
            data: b"x\n".to_vec(),
        }))
        .await;
    let second = recv_envelope(&mut client).await;
    assert!(matches!(second.payload, Message::SessionOutput(_)));

    assert!(
        first.sequence < second.sequence,
        "sequences not increasing: {} then {}",
        first.sequence,
        second.sequence
    );
}
