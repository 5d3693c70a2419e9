//! Per-attempt event relay.
//!
//! Every connect attempt gets its own [`EventRelay`]. Producer threads report through
//! it, and it enforces the event contract before anything reaches the dispatch
//! queue: `Open` at most once, `Close` exactly once, nothing after `Close`. It also
//! keeps the shared [`StateCell`] in step, but only while its attempt is current, so
//! a superseded attempt can never move the state of its successor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::core::record::close_code;
use crate::transport::dispatch_queue::DispatchQueue;
use crate::transport::{ConnectionState, StateCell, TransportEvent};
use crate::utils::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Open,
    Closed,
}

#[derive(Debug)]
struct RelayInner {
    attempt: u64,
    session_id: u64,
    phase: Mutex<Phase>,
    queue: Arc<DispatchQueue>,
    state: Arc<StateCell>,
    current: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
}

/// Producer-side handle for one connect attempt
#[derive(Debug, Clone)]
pub struct EventRelay {
    inner: Arc<RelayInner>,
}

impl EventRelay {
    pub fn new(
        attempt: u64,
        session_id: u64,
        queue: Arc<DispatchQueue>,
        state: Arc<StateCell>,
        current: Arc<AtomicU64>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                attempt,
                session_id,
                phase: Mutex::new(Phase::Pending),
                queue,
                state,
                current,
                metrics,
            }),
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.inner
            .phase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn attempt(&self) -> u64 {
        self.inner.attempt
    }

    pub fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    /// Whether this relay still belongs to the transport's latest attempt
    pub fn is_current(&self) -> bool {
        self.inner.current.load(Ordering::Acquire) == self.inner.attempt
    }

    pub fn is_open(&self) -> bool {
        *self.phase() == Phase::Open
    }

    pub fn is_closed(&self) -> bool {
        *self.phase() == Phase::Closed
    }

    /// The handshake completed. Returns `false` if the attempt already opened or closed.
    pub fn opened(&self, protocol: &str) -> bool {
        let mut phase = self.phase();
        if *phase != Phase::Pending {
            return false;
        }
        *phase = Phase::Open;

        if self.is_current() {
            self.inner
                .state
                .transition(ConnectionState::Connecting, ConnectionState::Open);
        }
        self.inner.metrics.connection_established();
        debug!(attempt = self.inner.attempt, protocol, "Connection opened");
        self.inner.queue.enqueue_event(
            self.inner.attempt,
            TransportEvent::Open {
                protocol: protocol.to_string(),
            },
        );
        true
    }

    /// Queue one inbound message. Messages outside the open phase are discarded.
    pub fn message(&self, message: &[u8]) -> bool {
        let phase = self.phase();
        if *phase != Phase::Open {
            return false;
        }
        self.inner.metrics.message_received(message.len() as u64);
        self.inner
            .queue
            .enqueue_message(self.inner.attempt, self.inner.session_id, message)
    }

    /// The attempt failed without a close handshake
    pub fn failed(&self, reason: &str) {
        self.fail_with(close_code::ABNORMAL, reason);
    }

    /// The attempt failed; after open the close carries `code`.
    ///
    /// Before open this is reported as `ConnectFailed`, after open as `Error`.
    /// Both are followed by the terminal `Close`.
    pub fn fail_with(&self, code: u16, reason: &str) {
        let mut phase = self.phase();
        let previous = *phase;
        if previous == Phase::Closed {
            return;
        }
        *phase = Phase::Closed;
        self.mark_closed();

        let attempt = self.inner.attempt;
        let queue = &self.inner.queue;
        if previous == Phase::Open {
            warn!(attempt, code, reason, "Transport error");
            self.inner.metrics.transport_error();
            self.inner.metrics.connection_closed();
            queue.enqueue_event(
                attempt,
                TransportEvent::Error {
                    message: reason.to_string(),
                },
            );
            queue.enqueue_event(
                attempt,
                TransportEvent::Close {
                    code,
                    reason: reason.to_string(),
                },
            );
        } else {
            debug!(attempt, reason, "Connect attempt failed");
            self.inner.metrics.connect_failed();
            queue.enqueue_event(
                attempt,
                TransportEvent::ConnectFailed {
                    reason: reason.to_string(),
                },
            );
            queue.enqueue_event(
                attempt,
                TransportEvent::Close {
                    code: close_code::ABNORMAL,
                    reason: reason.to_string(),
                },
            );
        }
    }

    /// The connection closed. Returns `false` if it was already closed.
    pub fn closed(&self, code: u16, reason: &str) -> bool {
        let mut phase = self.phase();
        let previous = *phase;
        if previous == Phase::Closed {
            return false;
        }
        *phase = Phase::Closed;
        self.mark_closed();

        if previous == Phase::Open {
            self.inner.metrics.connection_closed();
        }
        debug!(attempt = self.inner.attempt, code, reason, "Connection closed");
        self.inner.queue.enqueue_event(
            self.inner.attempt,
            TransportEvent::Close {
                code,
                reason: reason.to_string(),
            },
        );
        true
    }

    fn mark_closed(&self) {
        if self.is_current() {
            self.inner.state.set(ConnectionState::Closed);
        }
    }
}
