//! # Tokio Socket Bridge
//!
//! [`SocketBridge`] implementation that runs each socket as a task on a tokio
//! runtime handle. The task owns a `Framed<TcpStream, RecordCodec>` and is the
//! socket's only writer: outbound frames arrive over a bounded mpsc channel and the
//! close request over its own channel, which the task polls first so a close
//! overtakes anything still queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::codec::RecordCodec;
use crate::core::record::{close_code, Record};
use crate::error::constants::{
    ERR_CLOSED_BEFORE_OPEN, ERR_CLOSE_TIMEOUT, ERR_HANDSHAKE_REJECTED, ERR_PEER_HUNG_UP,
    ERR_UNEXPECTED_RECORD,
};
use crate::error::{ProtocolError, Result};
use crate::transport::bridged::{BridgeCallbacks, OpenRequest, SocketBridge, SocketHandle};

/// Socket settings applied by [`TokioBridge`]
#[derive(Debug, Clone)]
pub struct TokioBridgeOptions {
    pub connection_timeout: Duration,
    pub close_timeout: Duration,
    pub send_queue_capacity: usize,
    pub max_message_size: usize,
    pub nodelay: bool,
}

impl TokioBridgeOptions {
    pub fn from_config(client: &ClientConfig, transport: &TransportConfig) -> Self {
        Self {
            connection_timeout: client.connection_timeout,
            close_timeout: client.close_timeout,
            send_queue_capacity: client.send_queue_capacity,
            max_message_size: transport.max_message_size,
            nodelay: transport.nodelay,
        }
    }
}

#[derive(Debug)]
struct SocketEntry {
    outbound: mpsc::Sender<Bytes>,
    close: mpsc::Sender<(u16, String)>,
}

type SocketMap = Arc<Mutex<HashMap<SocketHandle, SocketEntry>>>;

fn sockets(map: &SocketMap) -> MutexGuard<'_, HashMap<SocketHandle, SocketEntry>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bridge running sockets on a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioBridge {
    runtime: Handle,
    options: TokioBridgeOptions,
    sockets: SocketMap,
}

impl TokioBridge {
    pub fn new(runtime: Handle, options: TokioBridgeOptions) -> Self {
        Self {
            runtime,
            options,
            sockets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bridge on the runtime of the calling context
    pub fn current(options: TokioBridgeOptions) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            ProtocolError::ConfigError(format!("Bridged transport needs a tokio runtime: {e}"))
        })?;
        Ok(Self::new(runtime, options))
    }
}

impl SocketBridge for TokioBridge {
    fn open(&self, request: OpenRequest, callbacks: BridgeCallbacks) -> Result<()> {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.options.send_queue_capacity.max(1));
        let (close_tx, close_rx) = mpsc::channel(1);

        let handle = request.handle;
        sockets(&self.sockets).insert(
            handle,
            SocketEntry {
                outbound: outbound_tx,
                close: close_tx,
            },
        );

        let map = self.sockets.clone();
        let options = self.options.clone();
        self.runtime.spawn(async move {
            run_socket(request, callbacks, outbound_rx, close_rx, options).await;
            sockets(&map).remove(&handle);
        });
        Ok(())
    }

    fn send(&self, handle: SocketHandle, frame: Bytes) -> Result<()> {
        let map = sockets(&self.sockets);
        let entry = map.get(&handle).ok_or(ProtocolError::ConnectionClosed)?;
        entry.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ProtocolError::QueueFull,
            TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    fn close(&self, handle: SocketHandle, code: u16, reason: &str) {
        if let Some(entry) = sockets(&self.sockets).get(&handle) {
            // A full channel means a close is already pending
            let _ = entry.close.try_send((code, reason.to_string()));
        }
    }
}

type RecordStream = Framed<TcpStream, RecordCodec>;

async fn open_socket(
    request: &OpenRequest,
    options: &TokioBridgeOptions,
) -> Result<(RecordStream, String)> {
    let stream = TcpStream::connect(request.endpoint.authority())
        .await
        .map_err(|e| ProtocolError::ConnectFailure(format!("{}: {e}", request.endpoint)))?;
    stream.set_nodelay(options.nodelay)?;

    let mut framed = Framed::new(stream, RecordCodec::new(options.max_message_size));
    framed
        .send(Record::Handshake(request.sub_protocols.join(",")))
        .await?;

    match framed.next().await {
        Some(Ok(Record::Handshake(protocol))) => Ok((framed, protocol)),
        Some(Ok(Record::Close { code, reason })) => Err(ProtocolError::ConnectFailure(format!(
            "{ERR_HANDSHAKE_REJECTED} ({code}: {reason})"
        ))),
        Some(Ok(Record::Binary(_))) => Err(ProtocolError::ConnectFailure(
            ERR_UNEXPECTED_RECORD.to_string(),
        )),
        Some(Err(e)) => Err(e),
        None => Err(ProtocolError::ConnectFailure(ERR_PEER_HUNG_UP.to_string())),
    }
}

enum Step {
    Close(u16, String),
    Send(Bytes),
    Inbound(Option<Result<Record>>),
    CloseTimeout,
}

async fn run_socket(
    request: OpenRequest,
    callbacks: BridgeCallbacks,
    mut outbound: mpsc::Receiver<Bytes>,
    mut close_rx: mpsc::Receiver<(u16, String)>,
    options: TokioBridgeOptions,
) {
    let handle = request.handle.0;

    let opened = tokio::select! {
        biased;
        _ = close_rx.recv() => {
            callbacks.on_close(close_code::NORMAL, ERR_CLOSED_BEFORE_OPEN);
            return;
        }
        result = timeout(options.connection_timeout, open_socket(&request, &options)) => result,
    };
    let (mut framed, protocol) = match opened {
        Ok(Ok(opened)) => opened,
        Ok(Err(e)) => {
            callbacks.on_error(&e.to_string());
            return;
        }
        Err(_) => {
            callbacks.on_error(&format!(
                "{}: connection timed out after {:?}",
                request.endpoint, options.connection_timeout
            ));
            return;
        }
    };

    info!(handle, endpoint = %request.endpoint, protocol = %protocol, "Connected");
    callbacks.on_open(&protocol);

    let mut closing = false;
    let mut close_deadline: Option<Instant> = None;

    loop {
        let deadline = close_deadline;
        let step = tokio::select! {
            biased;
            signal = close_rx.recv(), if !closing => {
                let (code, reason) = signal.unwrap_or((close_code::GOING_AWAY, String::new()));
                Step::Close(code, reason)
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Step::CloseTimeout
            }
            frame = outbound.recv(), if !closing => match frame {
                Some(frame) => Step::Send(frame),
                None => Step::Close(close_code::GOING_AWAY, String::new()),
            },
            inbound = framed.next() => Step::Inbound(inbound),
        };

        match step {
            Step::Close(code, reason) => {
                closing = true;
                let mut discarded = 0usize;
                while outbound.try_recv().is_ok() {
                    discarded += 1;
                }
                outbound.close();
                debug!(handle, code, discarded, "Sending close");
                if let Err(e) = framed.send(Record::close(code, reason)).await {
                    callbacks.on_error(&e.to_string());
                    return;
                }
                close_deadline = Some(Instant::now() + options.close_timeout);
            }
            Step::Send(frame) => {
                if let Err(e) = framed.send(Record::Binary(frame)).await {
                    callbacks.on_error(&e.to_string());
                    return;
                }
            }
            Step::CloseTimeout => {
                warn!(handle, timeout = ?options.close_timeout, "Peer did not answer close");
                callbacks.on_close(close_code::ABNORMAL, ERR_CLOSE_TIMEOUT);
                return;
            }
            Step::Inbound(Some(Ok(Record::Binary(message)))) => callbacks.on_message(&message),
            Step::Inbound(Some(Ok(Record::Close { code, reason }))) => {
                if !closing {
                    debug!(handle, code, "Echoing peer close");
                    let _ = framed.send(Record::close(code, reason.clone())).await;
                }
                callbacks.on_close(code, &reason);
                return;
            }
            Step::Inbound(Some(Ok(Record::Handshake(_)))) => {
                let _ = framed
                    .send(Record::close(close_code::PROTOCOL_ERROR, ERR_UNEXPECTED_RECORD))
                    .await;
                callbacks.on_error_with(close_code::PROTOCOL_ERROR, ERR_UNEXPECTED_RECORD);
                return;
            }
            Step::Inbound(Some(Err(e))) => {
                let code = match e {
                    ProtocolError::OversizedMessage(_) => close_code::MESSAGE_TOO_BIG,
                    ProtocolError::InvalidHeader => close_code::PROTOCOL_ERROR,
                    _ => close_code::ABNORMAL,
                };
                if code != close_code::ABNORMAL {
                    let _ = framed.send(Record::close(code, e.to_string())).await;
                }
                callbacks.on_error_with(code, &e.to_string());
                return;
            }
            Step::Inbound(None) => {
                if closing {
                    callbacks.on_close(close_code::NORMAL, "");
                } else {
                    callbacks.on_close(close_code::ABNORMAL, ERR_PEER_HUNG_UP);
                }
                return;
            }
        }
    }
}
