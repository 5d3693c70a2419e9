//! Server-side protocol runtime.
//!
//! The host (normally [`FrameServer`](crate::service::server::FrameServer)) calls
//! [`ServerRuntime::on_binary_message`] for every inbound Binary record and
//! supplies the `send(session_id, bytes)` primitive the outbound proxy writes
//! through. Unlike the client runtime, inbound dispatch may run concurrently for
//! different sessions, so dispatch targets take `&self`.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::core::frame::{self, Opcode, OPCODE_WIDTH};
use crate::error::{FrameError, ProtocolError, Result};
use crate::protocol::{describe, DispatchOutcome, OpcodeNames};
use crate::utils::metrics::Metrics;
use crate::utils::panic::format_panic;

/// Primitive that delivers one encoded frame to a session
pub type SendFn = Arc<dyn Fn(u64, Bytes) -> Result<()> + Send + Sync>;

/// Where an inbound frame came from, plus a way to answer
pub struct InboundContext<'a> {
    pub session_id: u64,
    pub opcode: Opcode,
    pub outbound: &'a OutboundProxy,
}

impl InboundContext<'_> {
    /// Send a frame back to the session this frame came from
    pub fn reply(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        self.outbound.send(self.session_id, opcode, payload)
    }
}

/// Target of inbound server frames; generated dispatch code implements this
pub trait InboundDispatch: Send + Sync {
    fn is_known(&self, opcode: Opcode) -> bool;

    fn dispatch_inbound(&self, ctx: &InboundContext<'_>, payload: &[u8]) -> Result<()>;

    fn opcode_name(&self, _opcode: Opcode) -> Option<&'static str> {
        None
    }
}

type InboundHandler = Box<dyn Fn(&InboundContext<'_>, &[u8]) -> Result<()> + Send + Sync>;

/// [`InboundDispatch`] backed by a table of closures
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<Opcode, InboundHandler>,
    names: Option<Arc<dyn OpcodeNames>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_names(mut self, names: impl OpcodeNames + 'static) -> Self {
        self.names = Some(Arc::new(names));
        self
    }

    /// Register the entry for `opcode`; each opcode takes exactly one entry
    pub fn register<F>(&mut self, opcode: Opcode, handler: F) -> Result<()>
    where
        F: Fn(&InboundContext<'_>, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&opcode) {
            return Err(ProtocolError::ConfigError(format!(
                "Dispatch entry already registered for opcode {}",
                describe(self.names.as_deref(), opcode)
            )));
        }
        self.handlers.insert(opcode, Box::new(handler));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl InboundDispatch for DispatchTable {
    fn is_known(&self, opcode: Opcode) -> bool {
        self.handlers.contains_key(&opcode)
    }

    fn dispatch_inbound(&self, ctx: &InboundContext<'_>, payload: &[u8]) -> Result<()> {
        match self.handlers.get(&ctx.opcode) {
            Some(handler) => handler(ctx, payload),
            None => Err(ProtocolError::Handler(format!(
                "no entry for opcode {}",
                describe(self.names.as_deref(), ctx.opcode)
            ))),
        }
    }

    fn opcode_name(&self, opcode: Opcode) -> Option<&'static str> {
        self.names.as_ref().and_then(|names| names.name(opcode))
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<_> = self.handlers.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("opcodes", &opcodes)
            .finish()
    }
}

/// Server-side failure reports.
///
/// Defaults only log; none of them terminates the session.
pub trait ServerHooks: Send + Sync {
    fn on_unknown_inbound_opcode(&self, session_id: u64, opcode: Opcode, payload: &[u8]) {
        debug!(session_id, opcode, len = payload.len(), "Unknown inbound opcode");
    }

    fn on_parse_error(&self, session_id: u64, error: &FrameError) {
        warn!(session_id, error = %error, "Dropping malformed frame");
    }

    fn on_handler_error(&self, session_id: u64, opcode: Opcode, error: &ProtocolError) {
        error!(session_id, opcode, error = %error, "Inbound handler failed");
    }
}

/// Hooks that only log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogServerHooks;

impl ServerHooks for LogServerHooks {}

/// Typed sender over the host's `send` primitive.
///
/// Stateless apart from the primitive itself; one instance per runtime is shared
/// by every dispatch.
#[derive(Clone)]
pub struct OutboundProxy {
    send: SendFn,
    metrics: Arc<Metrics>,
}

impl OutboundProxy {
    fn new(send: SendFn, metrics: Arc<Metrics>) -> Self {
        Self { send, metrics }
    }

    /// Encode and send one frame
    pub fn send(&self, session_id: u64, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(OPCODE_WIDTH + payload.len());
        frame::encode_into(opcode, payload, &mut buf);
        self.send_frame(session_id, buf.freeze())
    }

    /// Send an already encoded frame
    pub fn send_frame(&self, session_id: u64, frame: Bytes) -> Result<()> {
        let len = frame.len() as u64;
        (self.send)(session_id, frame)?;
        self.metrics.message_sent(len);
        Ok(())
    }

    /// Send the same frame to every listed session; returns how many accepted it
    pub fn broadcast<I>(&self, sessions: I, opcode: Opcode, payload: &[u8]) -> usize
    where
        I: IntoIterator<Item = u64>,
    {
        let frame = frame::encode(opcode, payload);
        sessions
            .into_iter()
            .filter(|session_id| match self.send_frame(*session_id, frame.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(session_id, error = %e, "Broadcast skipped session");
                    false
                }
            })
            .count()
    }
}

impl std::fmt::Debug for OutboundProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundProxy").finish_non_exhaustive()
    }
}

/// Inbound routing plus the outbound proxy for one server
pub struct ServerRuntime {
    dispatch: Arc<dyn InboundDispatch>,
    send: SendFn,
    hooks: Arc<dyn ServerHooks>,
    metrics: Arc<Metrics>,
    outbound: OnceLock<OutboundProxy>,
}

impl ServerRuntime {
    pub fn new(dispatch: Arc<dyn InboundDispatch>, send: SendFn) -> Self {
        Self {
            dispatch,
            send,
            hooks: Arc::new(LogServerHooks),
            metrics: Arc::new(Metrics::new()),
            outbound: OnceLock::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ServerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// The runtime's outbound proxy, built on first use and reused afterwards
    pub fn outbound(&self) -> &OutboundProxy {
        self.outbound
            .get_or_init(|| OutboundProxy::new(self.send.clone(), self.metrics.clone()))
    }

    /// Route one inbound message from `session_id`
    pub fn on_binary_message(&self, session_id: u64, message: &[u8]) -> DispatchOutcome {
        self.metrics.message_received(message.len() as u64);

        let (opcode, payload) = match frame::decode_borrowed(message) {
            Ok(parts) => parts,
            Err(e) => {
                self.metrics.parse_error();
                self.hooks.on_parse_error(session_id, &e);
                return DispatchOutcome::Malformed;
            }
        };

        if !self.dispatch.is_known(opcode) {
            self.metrics.unknown_opcode();
            self.hooks
                .on_unknown_inbound_opcode(session_id, opcode, payload);
            return DispatchOutcome::Unknown(opcode);
        }

        trace!(
            session_id,
            opcode,
            name = self.dispatch.opcode_name(opcode).unwrap_or("-"),
            "Dispatching inbound frame"
        );
        let ctx = InboundContext {
            session_id,
            opcode,
            outbound: self.outbound(),
        };
        let error = match catch_unwind(AssertUnwindSafe(|| {
            self.dispatch.dispatch_inbound(&ctx, payload)
        })) {
            Ok(Ok(())) => return DispatchOutcome::Handled,
            Ok(Err(e)) => e,
            Err(panic) => ProtocolError::Handler(format!("panicked: {}", format_panic(panic))),
        };

        self.metrics.handler_failure();
        self.hooks.on_handler_error(session_id, opcode, &error);
        DispatchOutcome::Failed(opcode)
    }
}

impl std::fmt::Debug for ServerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRuntime")
            .field("outbound_built", &self.outbound.get().is_some())
            .finish()
    }
}
