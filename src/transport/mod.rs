//! # Client Transports
//!
//! A [`Transport`] owns one client connection at a time and reports everything that
//! happens to it (lifecycle events and inbound messages) through its
//! [`DispatchQueue`](dispatch_queue::DispatchQueue). Nothing reaches application
//! code until the owner calls [`Transport::tick`], so handlers always run on the
//! ticking thread and never concurrently with each other.
//!
//! ## Strategies
//! - [`ThreadedTransport`](threaded::ThreadedTransport): blocking socket with a
//!   dedicated receive thread and send thread
//! - [`BridgedTransport`](bridged::BridgedTransport): socket owned by a foreign
//!   runtime behind a [`SocketBridge`](bridged::SocketBridge); callbacks arrive on
//!   arbitrary threads and are only ever queued
//!
//! ## Event contract
//! Per connect attempt: `Open` at most once, then `Close` exactly once. A failure
//! before `Open` is reported as `ConnectFailed` (never `Error`) followed by `Close`.
//! After `Open`, `Error` reports a live transport failure and is always followed by
//! `Close`.

pub mod bridged;
pub mod dispatch_queue;
pub mod endpoint;
pub mod receive_buffer;
pub mod relay;
pub mod threaded;
pub mod tokio_bridge;

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::Result;

pub use bridged::{BridgeCallbacks, BridgedTransport, SocketBridge, SocketHandle};
pub use dispatch_queue::DispatchQueue;
pub use endpoint::Endpoint;
pub use threaded::ThreadedTransport;
pub use tokio_bridge::TokioBridge;

/// Connection state as seen by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Open => 2,
            ConnectionState::Closing => 3,
            ConnectionState::Closed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Idle,
        }
    }
}

/// Atomically shared [`ConnectionState`]
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    /// Move to `next` only when currently in `from`
    pub fn transition(&self, from: ConnectionState, next: ConnectionState) -> bool {
        self.0
            .compare_exchange(
                from.as_u8(),
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move an open or connecting state to `Closing`.
    ///
    /// Returns `false` when the connection already closed, so a close racing the
    /// producer's final `Close` never overwrites it.
    pub fn begin_closing(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Closing)
            || self.transition(ConnectionState::Connecting, ConnectionState::Closing)
    }
}

/// Lifecycle event queued by a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open { protocol: String },
    ConnectFailed { reason: String },
    Error { message: String },
    Close { code: u16, reason: String },
}

/// Receiver of drained events; implemented by the session and the client runtime.
pub trait TransportSink {
    /// Called before each delivered item with the attempt that queued it
    fn begin_item(&mut self, _attempt: u64) {}

    fn on_open(&mut self, protocol: &str);

    fn on_connect_failed(&mut self, reason: &str);

    fn on_error(&mut self, message: &str);

    fn on_close(&mut self, code: u16, reason: &str);

    fn on_message(&mut self, session_id: u64, message: &[u8]);

    /// Inbound messages were dropped because the dispatch queue was full
    fn on_overflow(&mut self, _dropped: u64) {}
}

/// Client-side connection strategy.
///
/// All methods take `&self`: producers, the ticking owner and async callers of the
/// session wrapper share one transport.
pub trait Transport: Send + Sync {
    /// Start a new connect attempt, discarding the previous one.
    ///
    /// Returns the attempt id that [`TransportSink::begin_item`] reports for this
    /// attempt's items. Only synchronous failures (invalid URL, resources) are
    /// returned here; the outcome of the attempt arrives as `Open` or
    /// `ConnectFailed` on a later tick.
    fn connect(&self, url: &str, sub_protocols: &[String]) -> Result<u64>;

    /// Discard pending sends and start the close handshake
    fn close(&self);

    /// Queue one encoded frame for sending
    fn send_frame(&self, frame: &[u8]) -> Result<()>;

    /// Deliver everything queued so far to `sink`; returns the number of items delivered
    fn tick(&self, sink: &mut dyn TransportSink) -> usize;

    fn state(&self) -> ConnectionState;
}

/// Deliver one event to `sink`
pub(crate) fn deliver_event(sink: &mut dyn TransportSink, event: TransportEvent) {
    match event {
        TransportEvent::Open { protocol } => sink.on_open(&protocol),
        TransportEvent::ConnectFailed { reason } => sink.on_connect_failed(&reason),
        TransportEvent::Error { message } => sink.on_error(&message),
        TransportEvent::Close { code, reason } => sink.on_close(code, &reason),
    }
}
