//! Client-side protocol runtime.
//!
//! The [`ClientRuntime`] is the sink the session forwards drained items to. It
//! runs on the ticking thread only, so handlers may hold `FnMut` state without any
//! locking.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::core::frame::{self, Opcode};
use crate::error::{FrameError, ProtocolError, Result};
use crate::protocol::{describe, DispatchOutcome, OpcodeNames};
use crate::transport::TransportSink;
use crate::utils::metrics::Metrics;
use crate::utils::panic::format_panic;

/// Where an inbound frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub session_id: u64,
    pub opcode: Opcode,
}

type Handler = Box<dyn FnMut(&FrameContext, &[u8]) -> Result<()> + Send>;

/// Opcode to handler registrations for one client
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<Opcode, Handler>,
    names: Option<Arc<dyn OpcodeNames>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the generated opcode names used in diagnostics
    pub fn with_names(mut self, names: impl OpcodeNames + 'static) -> Self {
        self.names = Some(Arc::new(names));
        self
    }

    /// Register the handler for `opcode`; each opcode takes exactly one handler
    pub fn register<F>(&mut self, opcode: Opcode, handler: F) -> Result<()>
    where
        F: FnMut(&FrameContext, &[u8]) -> Result<()> + Send + 'static,
    {
        if self.handlers.contains_key(&opcode) {
            return Err(ProtocolError::ConfigError(format!(
                "Handler already registered for opcode {}",
                describe(self.names.as_deref(), opcode)
            )));
        }
        self.handlers.insert(opcode, Box::new(handler));
        Ok(())
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.handlers.contains_key(&opcode)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn name(&self, opcode: Opcode) -> Option<&'static str> {
        self.names.as_ref().and_then(|names| names.name(opcode))
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<_> = self.handlers.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("HandlerTable")
            .field("opcodes", &opcodes)
            .finish()
    }
}

/// Application callbacks for client lifecycle and failure reports.
///
/// Every method has a logging default, so implementors override only what they
/// need.
pub trait ClientHooks: Send {
    fn on_open(&mut self, protocol: &str) {
        info!(protocol, "Session open");
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        info!(code, reason, "Session closed");
    }

    /// A live transport failure; a close always follows
    fn on_error(&mut self, message: &str) {
        warn!(message, "Transport error");
    }

    /// A well-formed frame whose opcode has no handler
    fn on_unhandled_frame(&mut self, ctx: &FrameContext, name: Option<&str>, payload: &[u8]) {
        debug!(
            session_id = ctx.session_id,
            opcode = ctx.opcode,
            name = name.unwrap_or("unknown"),
            len = payload.len(),
            "Unhandled frame"
        );
    }

    fn on_parse_error(&mut self, session_id: u64, error: &FrameError) {
        warn!(session_id, error = %error, "Dropping malformed frame");
    }

    fn on_handler_error(&mut self, ctx: &FrameContext, error: &ProtocolError) {
        error!(
            session_id = ctx.session_id,
            opcode = ctx.opcode,
            error = %error,
            "Handler failed"
        );
    }

    fn on_overflow(&mut self, dropped: u64) {
        warn!(dropped, "Inbound messages dropped by backpressure");
    }
}

/// Hooks that only log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHooks;

impl ClientHooks for LogHooks {}

/// Routes drained messages to handlers and lifecycle events to hooks
pub struct ClientRuntime {
    table: HandlerTable,
    hooks: Box<dyn ClientHooks>,
    metrics: Arc<Metrics>,
}

impl ClientRuntime {
    pub fn new(table: HandlerTable, hooks: Box<dyn ClientHooks>, metrics: Arc<Metrics>) -> Self {
        Self {
            table,
            hooks,
            metrics,
        }
    }

    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    /// Decode one message and run its handler
    pub fn dispatch(&mut self, session_id: u64, message: &[u8]) -> DispatchOutcome {
        let (opcode, payload) = match frame::decode_borrowed(message) {
            Ok(parts) => parts,
            Err(e) => {
                self.metrics.parse_error();
                self.hooks.on_parse_error(session_id, &e);
                return DispatchOutcome::Malformed;
            }
        };
        let ctx = FrameContext { session_id, opcode };

        let Some(handler) = self.table.handlers.get_mut(&opcode) else {
            self.metrics.unknown_opcode();
            let name = self.table.name(opcode);
            self.hooks.on_unhandled_frame(&ctx, name, payload);
            return DispatchOutcome::Unknown(opcode);
        };

        trace!(session_id, opcode, len = payload.len(), "Dispatching frame");
        let error = match catch_unwind(AssertUnwindSafe(|| handler(&ctx, payload))) {
            Ok(Ok(())) => return DispatchOutcome::Handled,
            Ok(Err(e)) => e,
            Err(panic) => ProtocolError::Handler(format!("panicked: {}", format_panic(panic))),
        };

        self.metrics.handler_failure();
        self.hooks.on_handler_error(&ctx, &error);
        DispatchOutcome::Failed(opcode)
    }
}

impl TransportSink for ClientRuntime {
    fn on_open(&mut self, protocol: &str) {
        self.hooks.on_open(protocol);
    }

    fn on_connect_failed(&mut self, reason: &str) {
        // Reported through the pending connect, not as a transport error
        debug!(reason, "Connect attempt failed");
    }

    fn on_error(&mut self, message: &str) {
        self.hooks.on_error(message);
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        self.hooks.on_close(code, reason);
    }

    fn on_message(&mut self, session_id: u64, message: &[u8]) {
        self.dispatch(session_id, message);
    }

    fn on_overflow(&mut self, dropped: u64) {
        self.hooks.on_overflow(dropped);
    }
}

impl std::fmt::Debug for ClientRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("table", &self.table)
            .finish()
    }
}
