//! # Frame Server
//!
//! A tokio accept loop hosting one [`ServerRuntime`]. Every accepted socket runs
//! the server side of the opening handshake, registers a session in the
//! [`SessionRegistry`] and then forwards each Binary record to
//! [`ServerRuntime::on_binary_message`]. The runtime's `send(session_id, bytes)`
//! primitive writes into the registry, so handlers and the outbound proxy reach
//! any live session without touching sockets.
//!
//! ## Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use framelink::config::{ServerConfig, TransportConfig};
//! use framelink::protocol::server::DispatchTable;
//! use framelink::service::server::FrameServer;
//!
//! # async fn run() -> framelink::error::Result<()> {
//! let mut table = DispatchTable::new();
//! table.register(0x0001, |ctx, payload| ctx.reply(0x0001, payload))?;
//!
//! let server = FrameServer::new(ServerConfig::default(), TransportConfig::default(), Arc::new(table))?;
//! let listener = server.bind().await?;
//! server.serve(listener).await
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ServerConfig, TransportConfig};
use crate::core::codec::RecordCodec;
use crate::core::record::{close_code, Record};
use crate::error::constants::{
    ERR_CLOSE_TIMEOUT, ERR_CONNECTION_CLOSED, ERR_HANDSHAKE_REJECTED, ERR_PEER_HUNG_UP,
    ERR_SERVER_FULL, ERR_SERVER_SHUTDOWN, ERR_UNEXPECTED_RECORD,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::server::{InboundDispatch, LogServerHooks, SendFn, ServerHooks, ServerRuntime};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{CLOSE_TIMEOUT, DEFAULT_TIMEOUT};

/// How often shutdown re-checks the number of live connections
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

type ServerFramed = Framed<TcpStream, RecordCodec>;

struct SessionEntry {
    outbound: mpsc::Sender<Bytes>,
    close: mpsc::Sender<(u16, String)>,
}

/// Receiving ends handed to the connection task that owns a session
pub(crate) struct SessionChannels {
    pub(crate) session_id: u64,
    pub(crate) outbound: mpsc::Receiver<Bytes>,
    pub(crate) close: mpsc::Receiver<(u16, String)>,
}

/// Live server sessions, each with a bounded outbound channel
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, SessionEntry>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SessionRegistry {
    /// `capacity` bounds every session's outbound channel
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(&self) -> SessionChannels {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.capacity);
        let (close_tx, close_rx) = mpsc::channel(1);
        self.lock().insert(
            session_id,
            SessionEntry {
                outbound: outbound_tx,
                close: close_tx,
            },
        );
        SessionChannels {
            session_id,
            outbound: outbound_rx,
            close: close_rx,
        }
    }

    pub(crate) fn remove(&self, session_id: u64) -> bool {
        self.lock().remove(&session_id).is_some()
    }

    /// Queue one encoded frame for `session_id`
    pub fn send(&self, session_id: u64, frame: Bytes) -> Result<()> {
        let sender = self
            .lock()
            .get(&session_id)
            .map(|entry| entry.outbound.clone())
            .ok_or(ProtocolError::UnknownSession(session_id))?;
        sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProtocolError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    /// Ask the session to run the close handshake; frames already queued are discarded
    pub fn close(&self, session_id: u64, code: u16, reason: &str) -> Result<()> {
        let sender = self
            .lock()
            .get(&session_id)
            .map(|entry| entry.close.clone())
            .ok_or(ProtocolError::UnknownSession(session_id))?;
        match sender.try_send((code, reason.to_string())) {
            // A close already pending wins
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close every live session; returns how many were asked
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        self.session_ids()
            .into_iter()
            .filter(|id| self.close(*id, code, reason).is_ok())
            .count()
    }

    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn contains(&self, session_id: u64) -> bool {
        self.lock().contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Pick the answer to a handshake offer.
///
/// The first offered sub-protocol the server supports wins. A server that
/// supports nothing in particular accepts the first offer, or the empty protocol
/// when nothing was offered. `None` rejects the handshake.
pub fn select_protocol(offer: &str, supported: &[String]) -> Option<String> {
    let mut offered = offer.split(',').map(str::trim).filter(|p| !p.is_empty());
    if supported.is_empty() {
        return Some(offered.next().unwrap_or_default().to_string());
    }
    offered
        .find(|p| supported.iter().any(|s| s == p))
        .map(str::to_string)
}

fn close_code_for(error: &ProtocolError) -> u16 {
    match error {
        ProtocolError::OversizedMessage(_) => close_code::MESSAGE_TOO_BIG,
        ProtocolError::Io(_) => close_code::ABNORMAL,
        _ => close_code::PROTOCOL_ERROR,
    }
}

/// Decrements the live-connection count when a connection task ends
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accept loop plus everything one server shares across its connections
pub struct FrameServer {
    config: ServerConfig,
    transport: TransportConfig,
    dispatch: Arc<dyn InboundDispatch>,
    hooks: Arc<dyn ServerHooks>,
    metrics: Arc<Metrics>,
    registry: Arc<SessionRegistry>,
    runtime: Arc<ServerRuntime>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl FrameServer {
    pub fn new(
        config: ServerConfig,
        transport: TransportConfig,
        dispatch: Arc<dyn InboundDispatch>,
    ) -> Result<Self> {
        let mut errors = config.validate();
        errors.extend(transport.validate());
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }

        let registry = Arc::new(SessionRegistry::new(config.backpressure_limit));
        let hooks: Arc<dyn ServerHooks> = Arc::new(LogServerHooks);
        let metrics = Arc::new(Metrics::new());
        let runtime = Arc::new(build_runtime(&dispatch, &registry, &hooks, &metrics));

        Ok(Self {
            config,
            transport,
            dispatch,
            hooks,
            metrics,
            registry,
            runtime,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ServerHooks>) -> Self {
        self.hooks = hooks;
        self.rebuild_runtime();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self.rebuild_runtime();
        self
    }

    fn rebuild_runtime(&mut self) {
        self.runtime = Arc::new(build_runtime(
            &self.dispatch,
            &self.registry,
            &self.hooks,
            &self.metrics,
        ));
    }

    pub fn runtime(&self) -> &Arc<ServerRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Connections currently held by the server, including ones still handshaking
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.address).await?;
        Ok(listener)
    }

    /// Serve until CTRL+C
    #[instrument(skip_all, fields(address = %self.config.address))]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });

        self.serve_with_shutdown(listener, shutdown_rx).await
    }

    /// Serve until `shutdown_rx` yields or its sender is dropped
    #[instrument(skip_all, fields(address = %self.config.address))]
    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        match listener.local_addr() {
            Ok(addr) => info!(address = %addr, "Listening"),
            Err(e) => debug!(error = %e, "Listener has no local address"),
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.drain_connections().await;
                    return Ok(());
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.accept(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let codec = RecordCodec::new(self.transport.max_message_size);

        if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
            warn!(peer = %peer, limit = self.config.max_connections, "Rejecting connection at limit");
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, codec);
                let _ = framed
                    .send(Record::close(close_code::GOING_AWAY, ERR_SERVER_FULL))
                    .await;
            });
            return;
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());
        let connection = Connection {
            registry: self.registry.clone(),
            runtime: self.runtime.clone(),
            metrics: self.metrics.clone(),
            supported: self.config.sub_protocols.clone(),
            nodelay: self.transport.nodelay,
            shutdown: self.shutdown.child_token(),
        };

        tokio::spawn(async move {
            let _guard = guard;
            connection.run(stream, codec, peer).await;
        });
    }

    async fn drain_connections(&self) {
        info!(
            connections = self.active_connections(),
            "Shutting down server. Waiting for connections to close..."
        );
        self.shutdown.cancel();

        let timeout = tokio::time::sleep(self.config.shutdown_timeout);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => {
                    warn!(connections = self.active_connections(), "Shutdown timeout reached, forcing exit");
                    break;
                }
                _ = tokio::time::sleep(SHUTDOWN_POLL_INTERVAL) => {
                    let connections = self.active_connections();
                    if connections == 0 {
                        info!("All connections closed, shutting down");
                        break;
                    }
                    debug!(connections, "Waiting for connections to close");
                }
            }
        }
        self.metrics.log_metrics();
    }
}

impl std::fmt::Debug for FrameServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameServer")
            .field("address", &self.config.address)
            .field("registry", &self.registry)
            .field("active", &self.active_connections())
            .finish()
    }
}

fn build_runtime(
    dispatch: &Arc<dyn InboundDispatch>,
    registry: &Arc<SessionRegistry>,
    hooks: &Arc<dyn ServerHooks>,
    metrics: &Arc<Metrics>,
) -> ServerRuntime {
    let target = registry.clone();
    let send: SendFn = Arc::new(move |session_id, frame| target.send(session_id, frame));
    ServerRuntime::new(dispatch.clone(), send)
        .with_hooks(hooks.clone())
        .with_metrics(metrics.clone())
}

enum Step {
    Close(u16, String),
    Send(Option<Bytes>),
    Inbound(Option<Result<Record>>),
}

/// One accepted socket
struct Connection {
    registry: Arc<SessionRegistry>,
    runtime: Arc<ServerRuntime>,
    metrics: Arc<Metrics>,
    supported: Vec<String>,
    nodelay: bool,
    shutdown: CancellationToken,
}

impl Connection {
    #[instrument(skip_all, fields(peer = %peer))]
    async fn run(self, stream: TcpStream, codec: RecordCodec, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let mut framed = Framed::new(stream, codec);

        let Some(protocol) = self.accept_handshake(&mut framed).await else {
            return;
        };

        let channels = self.registry.register();
        let session_id = channels.session_id;
        self.metrics.connection_established();
        info!(session_id, protocol = %protocol, "Session open");

        let (code, reason) = self.pump(&mut framed, channels).await;

        self.registry.remove(session_id);
        self.metrics.connection_closed();
        info!(session_id, code, reason = %reason, "Session closed");
    }

    /// Answer the client's offer; `None` means the connection is done
    async fn accept_handshake(&self, framed: &mut ServerFramed) -> Option<String> {
        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            first = tokio::time::timeout(DEFAULT_TIMEOUT, framed.next()) => first,
        };

        let offer = match first {
            Ok(Some(Ok(Record::Handshake(offer)))) => offer,
            Ok(Some(Ok(record))) => {
                debug!(kind = ?record.kind(), "Expected a handshake record");
                let _ = framed
                    .send(Record::close(close_code::PROTOCOL_ERROR, ERR_UNEXPECTED_RECORD))
                    .await;
                return None;
            }
            Ok(Some(Err(e))) => {
                debug!(error = %e, "Malformed handshake");
                let _ = framed.send(Record::close(close_code_for(&e), e.to_string())).await;
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                debug!("Opening handshake timed out");
                return None;
            }
        };

        match select_protocol(&offer, &self.supported) {
            Some(protocol) => match framed.send(Record::Handshake(protocol.clone())).await {
                Ok(()) => Some(protocol),
                Err(e) => {
                    debug!(error = %e, "Failed to answer handshake");
                    None
                }
            },
            None => {
                warn!(offer = %offer, "Rejecting handshake");
                let _ = framed
                    .send(Record::close(close_code::PROTOCOL_ERROR, ERR_HANDSHAKE_REJECTED))
                    .await;
                None
            }
        }
    }

    /// Move records between the socket, the runtime and the registry until the session ends
    async fn pump(&self, framed: &mut ServerFramed, mut channels: SessionChannels) -> (u16, String) {
        let session_id = channels.session_id;
        loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    Step::Close(close_code::GOING_AWAY, ERR_SERVER_SHUTDOWN.to_string())
                }
                Some((code, reason)) = channels.close.recv() => Step::Close(code, reason),
                frame = channels.outbound.recv() => Step::Send(frame),
                record = framed.next() => Step::Inbound(record),
            };

            match step {
                Step::Close(code, reason) => return close_locally(framed, code, reason).await,
                Step::Send(Some(frame)) => {
                    if let Err(e) = framed.send(Record::Binary(frame)).await {
                        self.metrics.transport_error();
                        return (close_code::ABNORMAL, e.to_string());
                    }
                }
                Step::Send(None) => {
                    return close_locally(framed, close_code::NORMAL, ERR_CONNECTION_CLOSED.into()).await
                }
                Step::Inbound(Some(Ok(Record::Binary(message)))) => {
                    self.runtime.on_binary_message(session_id, &message);
                }
                Step::Inbound(Some(Ok(Record::Close { code, reason }))) => {
                    let echo = if code == close_code::NO_STATUS {
                        close_code::NORMAL
                    } else {
                        code
                    };
                    let _ = framed.send(Record::close(echo, reason.clone())).await;
                    return (code, reason);
                }
                Step::Inbound(Some(Ok(Record::Handshake(_)))) => {
                    return close_locally(
                        framed,
                        close_code::PROTOCOL_ERROR,
                        ERR_UNEXPECTED_RECORD.into(),
                    )
                    .await
                }
                Step::Inbound(Some(Err(e))) => {
                    self.metrics.transport_error();
                    let code = close_code_for(&e);
                    warn!(session_id, code, error = %e, "Closing session after protocol violation");
                    return close_locally(framed, code, e.to_string()).await;
                }
                Step::Inbound(None) => {
                    return (close_code::ABNORMAL, ERR_PEER_HUNG_UP.to_string());
                }
            }
        }
    }
}

/// Send our Close and wait for the peer's, discarding anything else it sends
async fn close_locally(framed: &mut ServerFramed, code: u16, reason: String) -> (u16, String) {
    if let Err(e) = framed.send(Record::close(code, reason.clone())).await {
        debug!(error = %e, "Failed to send close record");
        return (code, reason);
    }

    let peer_close = async {
        while let Some(Ok(record)) = framed.next().await {
            if matches!(record, Record::Close { .. }) {
                break;
            }
        }
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, peer_close).await.is_err() {
        debug!(code, "{}", ERR_CLOSE_TIMEOUT);
    }
    (code, reason)
}
