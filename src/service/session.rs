//! # Session Wrapper
//!
//! Awaitable connect and close over a tick-driven [`Transport`].
//!
//! The transport reports outcomes only as drained events, so `connect` arms a
//! one-shot completion before issuing the attempt and the event that ends the
//! attempt (`Open`, `ConnectFailed`, `Error` or an early `Close`) resolves it
//! during a later [`Session::tick`]. Tick must therefore run somewhere other than
//! the task awaiting `connect` or `close`.
//!
//! ```text
//! Disconnected --connect--> Connecting --Open--> Open --close()--> Closing --Close--> Closed
//!                                |                  \------------ Close -------------/
//!                                \-- ConnectFailed / Error / Close --> Closed
//! ```
//!
//! A new `connect` from any state starts over at `Connecting`. The completion of
//! the superseded attempt is dropped, so its waiter fails instead of being resolved
//! by a later attempt's events. Drained items carry the attempt that queued them,
//! and items from any attempt other than the session's latest are ignored.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use crate::error::constants::{ERR_ATTEMPT_SUPERSEDED, ERR_CLOSED_BEFORE_OPEN, ERR_NOT_OPEN};
use crate::error::{ProtocolError, Result};
use crate::transport::{Transport, TransportSink};

/// Session lifecycle as seen by application code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    attempt: u64,
    transport_attempt: u64,
    pending_connect: Option<oneshot::Sender<Result<()>>>,
    close_waiters: Vec<oneshot::Sender<()>>,
    protocol: Option<String>,
    last_close: Option<(u16, String)>,
}

impl SessionInner {
    fn fail_connect(&mut self, error: ProtocolError) {
        if let Some(pending) = self.pending_connect.take() {
            let _ = pending.send(Err(error));
        }
    }
}

/// One client session over a transport
pub struct Session {
    id: u64,
    transport: Arc<dyn Transport>,
    sub_protocols: Vec<String>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: u64, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            transport,
            sub_protocols: Vec::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                attempt: 0,
                transport_attempt: 0,
                pending_connect: None,
                close_waiters: Vec::new(),
                protocol: None,
                last_close: None,
            }),
        }
    }

    /// Sub-protocols offered on every connect
    pub fn with_sub_protocols(mut self, sub_protocols: Vec<String>) -> Self {
        self.sub_protocols = sub_protocols;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Number of connect calls issued so far
    pub fn attempt(&self) -> u64 {
        self.lock().attempt
    }

    /// Sub-protocol selected by the server for the open connection
    pub fn protocol(&self) -> Option<String> {
        self.lock().protocol.clone()
    }

    /// Code and reason of the most recent close
    pub fn last_close(&self) -> Option<(u16, String)> {
        self.lock().last_close.clone()
    }

    /// Connect to `url` and wait until the attempt opens or fails.
    ///
    /// Cancelling `cancel` ends the wait with [`ProtocolError::Cancelled`] but leaves
    /// the attempt running; its outcome still updates the session state.
    #[instrument(skip(self, cancel), fields(session_id = self.id))]
    pub async fn connect(&self, url: &str, cancel: &CancellationToken) -> Result<()> {
        let completion = {
            let mut inner = self.lock();
            let (tx, rx) = oneshot::channel();
            inner.attempt += 1;
            inner.pending_connect = Some(tx);
            inner.state = SessionState::Connecting;
            inner.protocol = None;
            inner.last_close = None;
            for waiter in inner.close_waiters.drain(..) {
                let _ = waiter.send(());
            }

            match self.transport.connect(url, &self.sub_protocols) {
                Ok(transport_attempt) => inner.transport_attempt = transport_attempt,
                Err(e) => {
                    inner.pending_connect = None;
                    inner.state = SessionState::Closed;
                    return Err(e);
                }
            }
            debug!(attempt = inner.attempt, "Connect issued");
            rx
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            outcome = completion => match outcome {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::ConnectFailure(ERR_ATTEMPT_SUPERSEDED.into())),
            },
        }
    }

    /// Close the session and wait for the close handshake to finish
    #[instrument(skip(self, cancel), fields(session_id = self.id))]
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let completion = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Disconnected | SessionState::Closed => return Ok(()),
                SessionState::Connecting | SessionState::Open => {
                    inner.state = SessionState::Closing;
                    self.transport.close();
                }
                SessionState::Closing => {}
            }
            let (tx, rx) = oneshot::channel();
            inner.close_waiters.push(tx);
            rx
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            // A dropped waiter means a new attempt replaced the closing one
            _ = completion => Ok(()),
        }
    }

    /// Queue one encoded frame
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        if self.state() != SessionState::Open {
            return Err(ProtocolError::TransportError(ERR_NOT_OPEN.into()));
        }
        self.transport.send_frame(frame)
    }

    /// Drain the transport, updating state before `sink` sees each event
    pub fn tick(&self, sink: &mut dyn TransportSink) -> usize {
        let mut adapter = SessionSink {
            session: self,
            forward: sink,
            item_attempt: None,
        };
        self.transport.tick(&mut adapter)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Applies drained events to the session, then forwards them
struct SessionSink<'s, 'f> {
    session: &'s Session,
    forward: &'f mut dyn TransportSink,
    item_attempt: Option<u64>,
}

impl SessionSink<'_, '_> {
    /// Checked under the session lock, so a concurrent `connect` either lands
    /// before the check or waits for the item to finish
    fn is_stale(&self, inner: &SessionInner) -> bool {
        let stale = self
            .item_attempt
            .is_some_and(|attempt| attempt != inner.transport_attempt);
        if stale {
            trace!(
                session_id = self.session.id,
                attempt = ?self.item_attempt,
                current = inner.transport_attempt,
                "Ignoring item from superseded attempt"
            );
        }
        stale
    }
}

impl TransportSink for SessionSink<'_, '_> {
    fn begin_item(&mut self, attempt: u64) {
        self.item_attempt = Some(attempt);
        self.forward.begin_item(attempt);
    }

    fn on_open(&mut self, protocol: &str) {
        {
            let mut inner = self.session.lock();
            if self.is_stale(&inner) {
                return;
            }
            if inner.state == SessionState::Connecting {
                inner.state = SessionState::Open;
            }
            inner.protocol = Some(protocol.to_string());
            if let Some(pending) = inner.pending_connect.take() {
                let _ = pending.send(Ok(()));
            }
        }
        info!(session_id = self.session.id, protocol, "Session open");
        self.forward.on_open(protocol);
    }

    fn on_connect_failed(&mut self, reason: &str) {
        {
            let mut inner = self.session.lock();
            if self.is_stale(&inner) {
                return;
            }
            inner.state = SessionState::Closed;
            inner.fail_connect(ProtocolError::ConnectFailure(reason.to_string()));
        }
        self.forward.on_connect_failed(reason);
    }

    fn on_error(&mut self, message: &str) {
        {
            let mut inner = self.session.lock();
            if self.is_stale(&inner) {
                return;
            }
            inner.fail_connect(ProtocolError::ConnectFailure(message.to_string()));
        }
        self.forward.on_error(message);
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        {
            let mut inner = self.session.lock();
            if self.is_stale(&inner) {
                return;
            }
            inner.state = SessionState::Closed;
            inner.last_close = Some((code, reason.to_string()));
            inner.fail_connect(ProtocolError::ConnectFailure(format!(
                "{ERR_CLOSED_BEFORE_OPEN} ({code}: {reason})"
            )));
            for waiter in inner.close_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        debug!(session_id = self.session.id, code, reason, "Session closed");
        self.forward.on_close(code, reason);
    }

    fn on_message(&mut self, session_id: u64, message: &[u8]) {
        if self.is_stale(&self.session.lock()) {
            return;
        }
        self.forward.on_message(session_id, message);
    }

    fn on_overflow(&mut self, dropped: u64) {
        self.forward.on_overflow(dropped);
    }
}
