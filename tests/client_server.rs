//! End-to-end exchange between a `FrameServer` and clients over both strategies

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use framelink::config::{ClientConfig, ServerConfig, TransportConfig, TransportStrategy};
use framelink::core::record::close_code;
use framelink::protocol::client::{ClientHooks, FrameContext, HandlerTable};
use framelink::protocol::server::DispatchTable;
use framelink::protocol::StaticOpcodeNames;
use framelink::service::connector::{ClientHandle, Connector};
use framelink::service::server::FrameServer;
use framelink::service::session::SessionState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ECHO: u16 = 0x0001;
const PUSH: u16 = 0x0002;
const UNKNOWN: u16 = 0x7777;

static NAMES: &[(u16, &str)] = &[(ECHO, "Echo"), (PUSH, "Push")];

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    server: Arc<FrameServer>,
    addr: SocketAddr,
    shutdown: mpsc::Sender<()>,
    handle: JoinHandle<framelink::error::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let mut table = DispatchTable::new().with_names(StaticOpcodeNames(NAMES));
        table
            .register(ECHO, |ctx, payload| ctx.reply(ECHO, payload))
            .unwrap();

        let config = ServerConfig {
            address: "127.0.0.1:0".to_string(),
            sub_protocols: vec!["echo.v1".to_string()],
            ..ServerConfig::default()
        };
        let server = Arc::new(
            FrameServer::new(config, TransportConfig::default(), Arc::new(table)).unwrap(),
        );
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown, shutdown_rx) = mpsc::channel(1);
        let serving = server.clone();
        let handle =
            tokio::spawn(async move { serving.serve_with_shutdown(listener, shutdown_rx).await });

        Self {
            server,
            addr,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.send(()).await.unwrap();
        self.handle.await.unwrap().unwrap();
    }
}

/// Forwards unhandled frames to the test
struct PushHooks(mpsc::UnboundedSender<(u16, Option<String>, Vec<u8>)>);

impl ClientHooks for PushHooks {
    fn on_unhandled_frame(&mut self, ctx: &FrameContext, name: Option<&str>, payload: &[u8]) {
        let _ = self
            .0
            .send((ctx.opcode, name.map(str::to_string), payload.to_vec()));
    }
}

struct TestClient {
    handle: ClientHandle,
    ticker: JoinHandle<()>,
    echoes: mpsc::UnboundedReceiver<Vec<u8>>,
    unhandled: mpsc::UnboundedReceiver<(u16, Option<String>, Vec<u8>)>,
}

fn build_client(addr: SocketAddr, strategy: TransportStrategy) -> TestClient {
    let (echo_tx, echoes) = mpsc::unbounded_channel();
    let (push_tx, unhandled) = mpsc::unbounded_channel();

    // Echo is the only opcode with a handler; pushes arrive as unhandled frames
    let mut handlers = HandlerTable::new().with_names(StaticOpcodeNames(NAMES));
    handlers
        .register(ECHO, move |_, payload| {
            let _ = echo_tx.send(payload.to_vec());
            Ok(())
        })
        .unwrap();

    let config = ClientConfig {
        url: format!("tcp://{addr}"),
        session_id: 42,
        strategy,
        sub_protocols: vec!["legacy".to_string(), "echo.v1".to_string()],
        send_queue_capacity: 2048,
        ..ClientConfig::default()
    };
    let handle = Connector::new(config, TransportConfig::default())
        .build(handlers, PushHooks(push_tx))
        .unwrap();
    let ticker = handle.spawn_ticker(Duration::from_millis(2));

    TestClient {
        handle,
        ticker,
        echoes,
        unhandled,
    }
}

async fn exchange(strategy: TransportStrategy) {
    let server = TestServer::start().await;
    let mut client = build_client(server.addr, strategy);
    let cancel = CancellationToken::new();

    client.handle.connect(&cancel).await.unwrap();
    assert_eq!(client.handle.state(), SessionState::Open);
    assert_eq!(
        client.handle.session().protocol().as_deref(),
        Some("echo.v1")
    );

    // Unknown opcodes are reported by the server but never end the session
    for _ in 0..1000 {
        client.handle.send(UNKNOWN, b"?").unwrap();
    }
    client.handle.send(ECHO, b"still here").unwrap();

    let echoed = tokio::time::timeout(WAIT, client.echoes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"still here");
    assert_eq!(server.server.metrics().snapshot().unknown_opcodes, 1000);

    // Server-initiated push through the outbound proxy
    let sessions = server.server.registry().session_ids();
    assert_eq!(sessions.len(), 1);
    let pushed = server
        .server
        .runtime()
        .outbound()
        .broadcast(sessions, PUSH, b"news");
    assert_eq!(pushed, 1);

    let (opcode, name, payload) = tokio::time::timeout(WAIT, client.unhandled.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(opcode, PUSH);
    assert_eq!(name.as_deref(), Some("Push"));
    assert_eq!(payload, b"news");
    assert_eq!(client.handle.state(), SessionState::Open);

    client.handle.close(&cancel).await.unwrap();
    assert_eq!(client.handle.state(), SessionState::Closed);
    let (code, _) = client.handle.session().last_close().unwrap();
    assert_eq!(code, close_code::NORMAL);
    assert!(client.handle.send(ECHO, b"late").is_err());

    client.ticker.abort();
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn threaded_client_round_trip() {
    exchange(TransportStrategy::Threaded).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bridged_client_round_trip() {
    exchange(TransportStrategy::Bridged).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_shutdown_closes_client_with_going_away() {
    let server = TestServer::start().await;
    let client = build_client(server.addr, TransportStrategy::Threaded);
    client.handle.connect(&CancellationToken::new()).await.unwrap();

    server.stop().await;

    let closed = async {
        while client.handle.state() != SessionState::Closed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT, closed).await.unwrap();
    let (code, _) = client.handle.session().last_close().unwrap();
    assert_eq!(code, close_code::GOING_AWAY);
    client.ticker.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_after_close_starts_fresh_attempt() {
    let server = TestServer::start().await;
    let mut client = build_client(server.addr, TransportStrategy::Bridged);
    let cancel = CancellationToken::new();

    client.handle.connect(&cancel).await.unwrap();
    let first = client.handle.session().attempt();
    client.handle.close(&cancel).await.unwrap();

    client.handle.connect(&cancel).await.unwrap();
    assert!(client.handle.session().attempt() > first);
    client.handle.send(ECHO, b"again").unwrap();
    let echoed = tokio::time::timeout(WAIT, client.echoes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, b"again");

    client.handle.close(&cancel).await.unwrap();
    client.ticker.abort();
    server.stop().await;
}
