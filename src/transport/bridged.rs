//! # Bridged Transport
//!
//! Client transport whose socket is owned by a foreign runtime. The runtime is
//! reached through a [`SocketBridge`] and reports back through [`BridgeCallbacks`],
//! which may be invoked from any thread. Callbacks never run application code:
//! they only enqueue onto the dispatch queue, and everything is delivered on the
//! next [`Transport::tick`].
//!
//! [`TokioBridge`](super::tokio_bridge::TokioBridge) is the bridge shipped with the
//! crate; any other runtime can plug in by implementing [`SocketBridge`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::record::close_code;
use crate::error::constants::ERR_NOT_OPEN;
use crate::error::{ProtocolError, Result};
use crate::transport::dispatch_queue::DispatchQueue;
use crate::transport::endpoint::Endpoint;
use crate::transport::relay::EventRelay;
use crate::transport::{ConnectionState, StateCell, Transport, TransportSink};
use crate::utils::metrics::Metrics;

/// Identifies one socket across the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(pub u64);

/// Everything the foreign runtime needs to open a socket
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub handle: SocketHandle,
    pub endpoint: Endpoint,
    pub sub_protocols: Vec<String>,
}

/// Socket operations provided by a foreign runtime
pub trait SocketBridge: Send + Sync {
    /// Start connecting; the outcome is reported through `callbacks`
    fn open(&self, request: OpenRequest, callbacks: BridgeCallbacks) -> Result<()>;

    /// Queue one frame as a Binary record
    fn send(&self, handle: SocketHandle, frame: Bytes) -> Result<()>;

    /// Start the close handshake, overtaking queued sends
    fn close(&self, handle: SocketHandle, code: u16, reason: &str);
}

/// Callback adapter handed to the bridge for one socket.
///
/// Safe to call from any thread, any number of times: the underlying relay keeps
/// `Open` to at most once and `Close` to exactly once.
#[derive(Debug, Clone)]
pub struct BridgeCallbacks {
    relay: EventRelay,
}

impl BridgeCallbacks {
    pub(crate) fn new(relay: EventRelay) -> Self {
        Self { relay }
    }

    pub fn on_open(&self, protocol: &str) {
        self.relay.opened(protocol);
    }

    pub fn on_message(&self, message: &[u8]) {
        self.relay.message(message);
    }

    /// A failure without a close handshake
    pub fn on_error(&self, message: &str) {
        self.relay.failed(message);
    }

    /// A failure that closed the connection with `code`
    pub fn on_error_with(&self, code: u16, message: &str) {
        self.relay.fail_with(code, message);
    }

    pub fn on_close(&self, code: u16, reason: &str) {
        self.relay.closed(code, reason);
    }

    pub fn is_closed(&self) -> bool {
        self.relay.is_closed()
    }
}

/// Client transport over a [`SocketBridge`]
pub struct BridgedTransport {
    config: ClientConfig,
    transport: TransportConfig,
    bridge: Arc<dyn SocketBridge>,
    queue: Arc<DispatchQueue>,
    metrics: Arc<Metrics>,
    state: Arc<StateCell>,
    attempt: Arc<AtomicU64>,
    active: Mutex<Option<SocketHandle>>,
}

impl BridgedTransport {
    pub fn new(
        config: ClientConfig,
        transport: TransportConfig,
        bridge: Arc<dyn SocketBridge>,
        queue: Arc<DispatchQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            transport,
            bridge,
            queue,
            metrics,
            state: Arc::new(StateCell::default()),
            attempt: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<SocketHandle>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for BridgedTransport {
    #[instrument(skip(self, sub_protocols), fields(session_id = self.config.session_id))]
    fn connect(&self, url: &str, sub_protocols: &[String]) -> Result<u64> {
        let endpoint = Endpoint::parse(url)?;
        let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;

        let mut active = self.active();
        if let Some(previous) = active.take() {
            debug!(handle = previous.0, "Superseding previous socket");
            self.bridge
                .close(previous, close_code::GOING_AWAY, "superseded");
        }
        self.state.set(ConnectionState::Connecting);

        let handle = SocketHandle(attempt);
        let relay = EventRelay::new(
            attempt,
            self.config.session_id,
            self.queue.clone(),
            self.state.clone(),
            self.attempt.clone(),
            self.metrics.clone(),
        );
        let request = OpenRequest {
            handle,
            endpoint,
            sub_protocols: sub_protocols.to_vec(),
        };

        if let Err(e) = self.bridge.open(request, BridgeCallbacks::new(relay)) {
            self.state.set(ConnectionState::Closed);
            return Err(e);
        }
        *active = Some(handle);
        Ok(attempt)
    }

    fn close(&self) {
        let Some(handle) = *self.active() else {
            return;
        };
        if self.state.begin_closing() {
            self.bridge.close(handle, close_code::NORMAL, "");
        }
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.state.get() != ConnectionState::Open {
            return Err(ProtocolError::TransportError(ERR_NOT_OPEN.into()));
        }
        if frame.len() > self.transport.max_message_size {
            return Err(ProtocolError::OversizedMessage(frame.len()));
        }
        let handle = (*self.active()).ok_or(ProtocolError::ConnectionClosed)?;
        self.bridge.send(handle, Bytes::copy_from_slice(frame))?;
        self.metrics.message_sent(frame.len() as u64);
        Ok(())
    }

    fn tick(&self, sink: &mut dyn TransportSink) -> usize {
        self.queue.drain_tracking(&self.attempt, sink)
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

impl Drop for BridgedTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.active().take() {
            self.bridge.close(handle, close_code::GOING_AWAY, "transport dropped");
        }
    }
}

impl std::fmt::Debug for BridgedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedTransport")
            .field("session_id", &self.config.session_id)
            .field("state", &self.state.get())
            .field("attempt", &self.attempt.load(Ordering::Relaxed))
            .finish()
    }
}
