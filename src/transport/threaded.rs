//! # Threaded Transport
//!
//! Client connection over a blocking [`std::net::TcpStream`] with dedicated OS
//! threads:
//!
//! - the **connect thread** resolves the endpoint, connects within
//!   `connection_timeout`, performs the opening handshake, then becomes the
//!   **receive thread**
//! - the **send thread** drains the bounded [`SendQueue`] with synchronous writes
//!
//! Reads use a short socket timeout as a poll interval so the receive thread can
//! notice a close deadline or a superseding attempt without another wake-up
//! channel. Partial reads accumulate in a [`ReceiveBuffer`] until one complete
//! record is present.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::record::{
    close_code, encode_header, parse_close_body, Record, RecordHeader, RecordKind,
    RECORD_HEADER_LEN,
};
use crate::error::constants::{
    ERR_CLOSED_BEFORE_OPEN, ERR_CLOSE_TIMEOUT, ERR_CONNECTION_CLOSED, ERR_HANDSHAKE_REJECTED,
    ERR_NOT_OPEN, ERR_PEER_HUNG_UP, ERR_UNEXPECTED_RECORD,
};
use crate::error::{ProtocolError, Result};
use crate::transport::dispatch_queue::DispatchQueue;
use crate::transport::endpoint::Endpoint;
use crate::transport::receive_buffer::ReceiveBuffer;
use crate::transport::relay::EventRelay;
use crate::transport::{ConnectionState, StateCell, Transport, TransportSink};
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};
use crate::utils::metrics::Metrics;

/// Read timeout used as the receive thread's poll interval
const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendKind {
    Binary,
    Close,
}

/// One fully encoded outbound record
#[derive(Debug)]
struct SendItem {
    kind: SendKind,
    buffer: PooledBuffer,
}

#[derive(Debug, Default)]
struct SendState {
    items: VecDeque<SendItem>,
    closing: bool,
    shutdown: bool,
}

/// Bounded outbound queue drained by the send thread
#[derive(Debug)]
struct SendQueue {
    state: Mutex<SendState>,
    ready: Condvar,
    capacity: usize,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SendState::default()),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Queue a data record without blocking
    fn push(&self, item: SendItem) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closing || state.shutdown {
            return Err(ProtocolError::ConnectionClosed);
        }
        if state.items.len() >= self.capacity {
            return Err(ProtocolError::QueueFull);
        }
        state.items.push_back(item);
        self.ready.notify_one();
        Ok(())
    }

    /// Discard pending data and put the close record first.
    ///
    /// Returns `false` if a close was already queued.
    fn push_close(&self, item: SendItem) -> bool {
        let mut state = lock(&self.state);
        if state.closing || state.shutdown {
            return false;
        }
        state.closing = true;
        state.items.clear();
        state.items.push_front(item);
        self.ready.notify_one();
        true
    }

    /// Block until an item is available; `None` once shut down
    fn pop(&self) -> Option<SendItem> {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Stop the send thread and drop everything still queued
    fn shutdown(&self) {
        let mut state = lock(&self.state);
        state.shutdown = true;
        state.items.clear();
        self.ready.notify_all();
    }
}

#[derive(Debug, Default)]
struct SocketSlot {
    stream: Option<TcpStream>,
    aborted: bool,
}

/// State shared by the threads of one connect attempt
#[derive(Debug)]
struct Connection {
    relay: EventRelay,
    sends: SendQueue,
    socket: Mutex<SocketSlot>,
    pool: BufferPool,
    metrics: Arc<Metrics>,
    close_requested: AtomicBool,
    close_sent: AtomicBool,
    close_deadline: Mutex<Option<Instant>>,
}

impl Connection {
    fn encode(&self, record: &Record) -> PooledBuffer {
        let mut buffer = self.pool.acquire();
        buffer.extend_from_slice(&record.to_bytes());
        buffer
    }

    /// Keep a handle to the socket for shutdown; `false` if the attempt was superseded
    fn attach(&self, stream: &TcpStream) -> io::Result<bool> {
        let mut slot = lock(&self.socket);
        if slot.aborted {
            return Ok(false);
        }
        slot.stream = Some(stream.try_clone()?);
        Ok(true)
    }

    fn is_aborted(&self) -> bool {
        lock(&self.socket).aborted
    }

    fn shutdown_socket(&self) {
        if let Some(stream) = lock(&self.socket).stream.as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Tear down a superseded or dropped attempt without reporting anything
    fn abort(&self) {
        {
            let mut slot = lock(&self.socket);
            slot.aborted = true;
            if let Some(stream) = slot.stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        self.sends.shutdown();
    }

    /// Start the local close handshake
    fn request_close(&self, code: u16, reason: &str, timeout: Duration) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.close_deadline) = Some(Instant::now() + timeout);
        let item = SendItem {
            kind: SendKind::Close,
            buffer: self.encode(&Record::close(code, reason)),
        };
        self.sends.push_close(item);
    }

    fn close_deadline_passed(&self) -> bool {
        lock(&self.close_deadline).is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// The peer's Close arrived
    fn peer_closed(&self, code: u16, reason: &str, close_timeout: Duration) {
        self.relay.closed(code, reason);
        if self.close_requested.load(Ordering::SeqCst) {
            // Our Close is queued or written; whoever finishes last closes the socket
            if self.close_sent.load(Ordering::SeqCst) {
                self.shutdown_socket();
            }
        } else {
            debug!(code, reason, "Echoing peer close");
            self.request_close(code, reason, close_timeout);
        }
    }

    /// A malformed or oversized record: close with the matching code
    fn protocol_failure(&self, error: &ProtocolError, close_timeout: Duration) {
        let code = match error {
            ProtocolError::OversizedMessage(_) => close_code::MESSAGE_TOO_BIG,
            _ => close_code::PROTOCOL_ERROR,
        };
        warn!(code, error = %error, "Closing connection after protocol violation");
        self.relay.fail_with(code, &error.to_string());
        self.request_close(code, &error.to_string(), close_timeout);
    }
}

#[derive(Debug, Clone)]
struct AttemptSettings {
    endpoint: Endpoint,
    offer: String,
    connection_timeout: Duration,
    close_timeout: Duration,
    max_message_size: usize,
    receive_buffer_initial: usize,
    receive_buffer_low_water: usize,
    receive_buffer_cap: usize,
    nodelay: bool,
}

enum ReadStatus {
    Data,
    Idle,
    Eof,
}

fn fill(stream: &mut TcpStream, buffer: &mut ReceiveBuffer) -> io::Result<ReadStatus> {
    match stream.read(buffer.spare()) {
        Ok(0) => Ok(ReadStatus::Eof),
        Ok(n) => {
            buffer.advance(n);
            Ok(ReadStatus::Data)
        }
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(ReadStatus::Idle)
        }
        Err(e) => Err(e),
    }
}

fn connect_socket(settings: &AttemptSettings, deadline: Instant) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in settings.endpoint.socket_addrs()? {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => {
                stream.set_nodelay(settings.nodelay)?;
                stream.set_read_timeout(Some(POLL_INTERVAL))?;
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "Connect failed");
                last_error = Some(e);
            }
        }
    }
    Err(ProtocolError::ConnectFailure(match last_error {
        Some(e) => format!("{}: {e}", settings.endpoint),
        None => format!("{}: connection timed out", settings.endpoint),
    }))
}

enum HandshakeOutcome {
    Opened(String),
    Failed(String),
    ClosedBeforeOpen,
    Superseded,
}

fn handshake(
    conn: &Connection,
    stream: &mut TcpStream,
    buffer: &mut ReceiveBuffer,
    settings: &AttemptSettings,
    deadline: Instant,
) -> HandshakeOutcome {
    if let Err(e) = stream.write_all(&Record::Handshake(settings.offer.clone()).to_bytes()) {
        return HandshakeOutcome::Failed(e.to_string());
    }

    loop {
        match Record::parse(buffer.filled(), settings.max_message_size) {
            Ok(Some((record, used))) => {
                buffer.consume(used);
                return match record {
                    Record::Handshake(protocol) => HandshakeOutcome::Opened(protocol),
                    Record::Close { code, reason } => HandshakeOutcome::Failed(format!(
                        "{ERR_HANDSHAKE_REJECTED} ({code}: {reason})"
                    )),
                    Record::Binary(_) => HandshakeOutcome::Failed(ERR_UNEXPECTED_RECORD.into()),
                };
            }
            Ok(None) => {}
            Err(e) => return HandshakeOutcome::Failed(e.to_string()),
        }

        if conn.is_aborted() {
            return HandshakeOutcome::Superseded;
        }
        if conn.close_requested.load(Ordering::SeqCst) {
            return HandshakeOutcome::ClosedBeforeOpen;
        }
        if Instant::now() >= deadline {
            return HandshakeOutcome::Failed("opening handshake timed out".into());
        }

        if let Err(e) = buffer.ensure_space() {
            return HandshakeOutcome::Failed(e.to_string());
        }
        match fill(stream, buffer) {
            Ok(ReadStatus::Data | ReadStatus::Idle) => {}
            Ok(ReadStatus::Eof) => return HandshakeOutcome::Failed(ERR_PEER_HUNG_UP.into()),
            Err(e) => return HandshakeOutcome::Failed(e.to_string()),
        }
    }
}

/// Body of the connect thread; continues as the receive thread once open
fn run_attempt(conn: Arc<Connection>, settings: AttemptSettings) {
    let deadline = Instant::now() + settings.connection_timeout;

    let mut stream = match connect_socket(&settings, deadline) {
        Ok(stream) => stream,
        Err(e) => {
            conn.relay.failed(&e.to_string());
            return;
        }
    };
    match conn.attach(&stream) {
        Ok(true) => {}
        Ok(false) => {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        Err(e) => {
            conn.relay.failed(&e.to_string());
            return;
        }
    }

    let mut buffer = ReceiveBuffer::new(
        &conn.pool,
        settings.receive_buffer_initial,
        settings.receive_buffer_low_water,
        settings.receive_buffer_cap,
    );

    match handshake(&conn, &mut stream, &mut buffer, &settings, deadline) {
        HandshakeOutcome::Opened(protocol) => {
            let writer = match stream.try_clone() {
                Ok(writer) => writer,
                Err(e) => {
                    conn.relay.failed(&e.to_string());
                    conn.shutdown_socket();
                    return;
                }
            };
            conn.relay.opened(&protocol);
            info!(endpoint = %settings.endpoint, protocol = %protocol, "Connected");

            let send_conn = conn.clone();
            let spawned = thread::Builder::new()
                .name(format!("framelink-send-{}", conn.relay.attempt()))
                .spawn(move || run_sender(send_conn, writer));
            if let Err(e) = spawned {
                conn.relay.failed(&e.to_string());
                conn.shutdown_socket();
                return;
            }
            run_receiver(&conn, &mut stream, &mut buffer, &settings);
        }
        HandshakeOutcome::Failed(reason) => {
            conn.relay.failed(&reason);
            conn.shutdown_socket();
        }
        HandshakeOutcome::ClosedBeforeOpen => {
            let _ = stream.write_all(&Record::close(close_code::NORMAL, "").to_bytes());
            conn.relay.closed(close_code::NORMAL, ERR_CLOSED_BEFORE_OPEN);
            conn.sends.shutdown();
            conn.shutdown_socket();
        }
        HandshakeOutcome::Superseded => conn.shutdown_socket(),
    }
}

fn run_receiver(
    conn: &Connection,
    stream: &mut TcpStream,
    buffer: &mut ReceiveBuffer,
    settings: &AttemptSettings,
) {
    loop {
        // Deliver every complete record already buffered
        loop {
            let header = match RecordHeader::peek(buffer.filled(), settings.max_message_size) {
                Ok(Some(header)) if buffer.filled().len() >= header.total_len() => header,
                Ok(_) => break,
                Err(e) => {
                    conn.protocol_failure(&e, settings.close_timeout);
                    return;
                }
            };

            let body = &buffer.filled()[RECORD_HEADER_LEN..header.total_len()];
            match header.kind {
                RecordKind::Binary => {
                    trace!(len = body.len(), "Received message");
                    conn.relay.message(body);
                }
                RecordKind::Close => {
                    let (code, reason) = parse_close_body(body);
                    conn.peer_closed(code, &reason, settings.close_timeout);
                }
                RecordKind::Handshake => {
                    let error = ProtocolError::TransportError(ERR_UNEXPECTED_RECORD.into());
                    conn.protocol_failure(&error, settings.close_timeout);
                    return;
                }
            }
            buffer.consume(header.total_len());

            if conn.relay.is_closed() {
                return;
            }
        }

        if conn.is_aborted() || conn.relay.is_closed() {
            return;
        }
        if conn.close_deadline_passed() {
            warn!(timeout = ?settings.close_timeout, "Peer did not answer close");
            conn.relay.closed(close_code::ABNORMAL, ERR_CLOSE_TIMEOUT);
            conn.sends.shutdown();
            conn.shutdown_socket();
            return;
        }

        if let Err(e) = buffer.ensure_space() {
            conn.protocol_failure(&e, settings.close_timeout);
            return;
        }

        match fill(stream, buffer) {
            Ok(ReadStatus::Data | ReadStatus::Idle) => {}
            Ok(ReadStatus::Eof) => {
                if conn.close_requested.load(Ordering::SeqCst) {
                    conn.relay.closed(close_code::NORMAL, "");
                } else {
                    conn.relay.closed(close_code::ABNORMAL, ERR_PEER_HUNG_UP);
                }
                conn.sends.shutdown();
                conn.shutdown_socket();
                return;
            }
            Err(e) => {
                if !conn.is_aborted() {
                    conn.relay.failed(&e.to_string());
                }
                conn.sends.shutdown();
                conn.shutdown_socket();
                return;
            }
        }
    }
}

fn run_sender(conn: Arc<Connection>, mut stream: TcpStream) {
    while let Some(item) = conn.sends.pop() {
        if let Err(e) = stream.write_all(&item.buffer) {
            if !conn.is_aborted() {
                conn.relay.failed(&e.to_string());
            }
            conn.sends.shutdown();
            conn.shutdown_socket();
            return;
        }

        match item.kind {
            SendKind::Binary => conn
                .metrics
                .message_sent((item.buffer.len() - RECORD_HEADER_LEN) as u64),
            SendKind::Close => {
                conn.close_sent.store(true, Ordering::SeqCst);
                if conn.relay.is_closed() {
                    conn.shutdown_socket();
                }
                conn.sends.shutdown();
                return;
            }
        }
    }
    trace!(attempt = conn.relay.attempt(), "Send thread finished");
}

/// Thread-per-direction client transport
pub struct ThreadedTransport {
    config: ClientConfig,
    transport: TransportConfig,
    queue: Arc<DispatchQueue>,
    metrics: Arc<Metrics>,
    state: Arc<StateCell>,
    attempt: Arc<AtomicU64>,
    active: Mutex<Option<Arc<Connection>>>,
}

impl ThreadedTransport {
    pub fn new(
        config: ClientConfig,
        transport: TransportConfig,
        queue: Arc<DispatchQueue>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            transport,
            queue,
            metrics,
            state: Arc::new(StateCell::default()),
            attempt: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }
}

impl Transport for ThreadedTransport {
    #[instrument(skip(self, sub_protocols), fields(session_id = self.config.session_id))]
    fn connect(&self, url: &str, sub_protocols: &[String]) -> Result<u64> {
        let endpoint = Endpoint::parse(url)?;
        let attempt = self.attempt.fetch_add(1, Ordering::AcqRel) + 1;

        let mut active = lock(&self.active);
        if let Some(previous) = active.take() {
            debug!(attempt = previous.relay.attempt(), "Superseding previous attempt");
            previous.abort();
        }
        self.state.set(ConnectionState::Connecting);

        let relay = EventRelay::new(
            attempt,
            self.config.session_id,
            self.queue.clone(),
            self.state.clone(),
            self.attempt.clone(),
            self.metrics.clone(),
        );
        let conn = Arc::new(Connection {
            relay,
            sends: SendQueue::new(self.config.send_queue_capacity),
            socket: Mutex::new(SocketSlot::default()),
            pool: self.queue.pool().clone(),
            metrics: self.metrics.clone(),
            close_requested: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            close_deadline: Mutex::new(None),
        });

        let settings = AttemptSettings {
            endpoint,
            offer: sub_protocols.join(","),
            connection_timeout: self.config.connection_timeout,
            close_timeout: self.config.close_timeout,
            max_message_size: self.transport.max_message_size,
            receive_buffer_initial: self.transport.receive_buffer_initial,
            receive_buffer_low_water: self.transport.receive_buffer_low_water,
            receive_buffer_cap: self.transport.receive_buffer_cap(),
            nodelay: self.transport.nodelay,
        };

        let thread_conn = conn.clone();
        thread::Builder::new()
            .name(format!("framelink-connect-{attempt}"))
            .spawn(move || run_attempt(thread_conn, settings))
            .map_err(|e| {
                self.state.set(ConnectionState::Closed);
                ProtocolError::Io(e)
            })?;

        *active = Some(conn);
        Ok(attempt)
    }

    fn close(&self) {
        let Some(conn) = lock(&self.active).clone() else {
            return;
        };
        if self.state.begin_closing() {
            conn.request_close(close_code::NORMAL, "", self.config.close_timeout);
        }
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        if self.state.get() != ConnectionState::Open {
            return Err(ProtocolError::TransportError(ERR_NOT_OPEN.into()));
        }
        if frame.len() > self.transport.max_message_size {
            return Err(ProtocolError::OversizedMessage(frame.len()));
        }
        let conn = lock(&self.active)
            .clone()
            .ok_or_else(|| ProtocolError::TransportError(ERR_CONNECTION_CLOSED.into()))?;

        let mut buffer = conn.pool.rent(RECORD_HEADER_LEN + frame.len());
        buffer.extend_from_slice(&encode_header(RecordKind::Binary, frame.len()));
        buffer.extend_from_slice(frame);
        conn.sends.push(SendItem {
            kind: SendKind::Binary,
            buffer,
        })
    }

    fn tick(&self, sink: &mut dyn TransportSink) -> usize {
        self.queue.drain_tracking(&self.attempt, sink)
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

impl Drop for ThreadedTransport {
    fn drop(&mut self) {
        if let Some(conn) = lock(&self.active).take() {
            conn.abort();
        }
    }
}

impl std::fmt::Debug for ThreadedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedTransport")
            .field("session_id", &self.config.session_id)
            .field("state", &self.state.get())
            .field("attempt", &self.attempt.load(Ordering::Relaxed))
            .finish()
    }
}
