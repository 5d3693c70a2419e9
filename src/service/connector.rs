//! # Connector
//!
//! The single place where a client is wired together: one transport (strategy
//! picked from [`ClientConfig::strategy`]), one [`Session`] over it and one
//! [`ClientRuntime`] receiving what the session drains.
//!
//! ## Usage
//! ```rust,no_run
//! use framelink::config::{ClientConfig, TransportConfig};
//! use framelink::protocol::client::{HandlerTable, LogHooks};
//! use framelink::service::connector::Connector;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> framelink::error::Result<()> {
//! let mut handlers = HandlerTable::new();
//! handlers.register(0x0001, |ctx, payload| {
//!     println!("session {} got {} bytes", ctx.session_id, payload.len());
//!     Ok(())
//! })?;
//!
//! let client = Connector::new(ClientConfig::default(), TransportConfig::default())
//!     .build(handlers, LogHooks)?;
//! let ticker = client.spawn_ticker(std::time::Duration::from_millis(5));
//!
//! client.connect(&CancellationToken::new()).await?;
//! client.send(0x0001, b"hello")?;
//! client.close(&CancellationToken::new()).await?;
//! ticker.abort();
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::{ClientConfig, NetworkConfig, TransportConfig, TransportStrategy};
use crate::core::frame::{self, Opcode, OPCODE_WIDTH};
use crate::error::{ProtocolError, Result};
use crate::protocol::client::{ClientHooks, ClientRuntime, HandlerTable};
use crate::service::session::{Session, SessionState};
use crate::transport::bridged::{BridgedTransport, SocketBridge};
use crate::transport::dispatch_queue::DispatchQueue;
use crate::transport::threaded::ThreadedTransport;
use crate::transport::tokio_bridge::{TokioBridge, TokioBridgeOptions};
use crate::transport::Transport;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{self, with_timeout_error};

/// Default number of idle buffers kept by a client's pool
const DEFAULT_POOL_SIZE: usize = 64;

/// Builds [`ClientHandle`]s for one endpoint
pub struct Connector {
    client: ClientConfig,
    transport: TransportConfig,
    bridge: Option<Arc<dyn SocketBridge>>,
    metrics: Arc<Metrics>,
    pool_size: usize,
}

impl Connector {
    pub fn new(client: ClientConfig, transport: TransportConfig) -> Self {
        Self {
            client,
            transport,
            bridge: None,
            metrics: Arc::new(Metrics::new()),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.client.clone(), config.transport.clone())
    }

    /// Use `bridge` for the bridged strategy instead of a [`TokioBridge`] on the
    /// current runtime
    pub fn with_bridge(mut self, bridge: Arc<dyn SocketBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Compose transport, session and runtime
    #[instrument(skip_all, fields(url = %self.client.url, strategy = ?self.client.strategy))]
    pub fn build(&self, handlers: HandlerTable, hooks: impl ClientHooks + 'static) -> Result<ClientHandle> {
        let mut errors = self.client.validate();
        errors.extend(self.transport.validate());
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }

        let pool = BufferPool::new(self.pool_size);
        let queue = Arc::new(DispatchQueue::new(
            self.client.dispatch_queue_capacity,
            pool,
            self.metrics.clone(),
        ));

        let transport: Arc<dyn Transport> = match self.client.strategy {
            TransportStrategy::Threaded => Arc::new(ThreadedTransport::new(
                self.client.clone(),
                self.transport.clone(),
                queue,
                self.metrics.clone(),
            )),
            TransportStrategy::Bridged => {
                let bridge: Arc<dyn SocketBridge> = match &self.bridge {
                    Some(bridge) => bridge.clone(),
                    None => Arc::new(TokioBridge::current(TokioBridgeOptions::from_config(
                        &self.client,
                        &self.transport,
                    ))?),
                };
                Arc::new(BridgedTransport::new(
                    self.client.clone(),
                    self.transport.clone(),
                    bridge,
                    queue,
                    self.metrics.clone(),
                ))
            }
        };

        let session = Session::new(self.client.session_id, transport)
            .with_sub_protocols(self.client.sub_protocols.clone());
        let runtime = ClientRuntime::new(handlers, Box::new(hooks), self.metrics.clone());
        info!(handlers = runtime.table().len(), "Client built");

        Ok(ClientHandle {
            url: self.client.url.clone(),
            connection_timeout: self.client.connection_timeout,
            close_timeout: self.client.close_timeout,
            session: Arc::new(session),
            runtime: Arc::new(Mutex::new(runtime)),
            metrics: self.metrics.clone(),
        })
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("url", &self.client.url)
            .field("strategy", &self.client.strategy)
            .field("custom_bridge", &self.bridge.is_some())
            .finish()
    }
}

/// A wired client: session, transport and runtime
#[derive(Clone)]
pub struct ClientHandle {
    url: String,
    connection_timeout: Duration,
    close_timeout: Duration,
    session: Arc<Session>,
    runtime: Arc<Mutex<ClientRuntime>>,
    metrics: Arc<Metrics>,
}

impl ClientHandle {
    /// Connect to the configured endpoint.
    ///
    /// Needs a concurrent [`tick`](Self::tick) to observe the outcome; gives up with
    /// [`ProtocolError::Timeout`] if none arrives within the connection timeout plus
    /// a grace period.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        with_timeout_error(
            self.session.connect(&self.url, cancel),
            self.connection_timeout + timeout::DEFAULT_TIMEOUT,
        )
        .await
    }

    /// Close the connection and wait for the close handshake
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        with_timeout_error(
            self.session.close(cancel),
            self.close_timeout + timeout::DEFAULT_TIMEOUT,
        )
        .await
    }

    /// Encode and send one frame
    pub fn send(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(OPCODE_WIDTH + payload.len());
        frame::encode_into(opcode, payload, &mut buf);
        self.session.send(&buf)
    }

    /// Deliver queued events and messages to the runtime; returns how many were delivered
    pub fn tick(&self) -> usize {
        let mut runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.session.tick(&mut *runtime)
    }

    /// Run [`tick`](Self::tick) every `interval` on the current tokio runtime
    pub fn spawn_ticker(&self, interval: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                handle.tick();
            }
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("url", &self.url)
            .field("session", &self.session)
            .finish()
    }
}
