//! # Protocol Runtimes
//!
//! Opcode routing on top of the transports.
//!
//! - [`client`]: [`ClientRuntime`](client::ClientRuntime) routes every drained
//!   message to the handler registered for its opcode and reports lifecycle events
//!   to [`ClientHooks`](client::ClientHooks)
//! - [`server`]: [`ServerRuntime`](server::ServerRuntime) hands inbound frames to an
//!   [`InboundDispatch`](server::InboundDispatch) and exposes the typed outbound
//!   sender
//!
//! Both runtimes isolate failures per message: a malformed frame, an unknown
//! opcode or a failing handler is reported and counted, and the connection stays
//! open.
//!
//! Handler tables and opcode names are normally produced by a code generator; the
//! runtimes only consume them.

pub mod client;
pub mod server;

#[cfg(test)]
mod tests;

use crate::core::frame::Opcode;

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion
    Handled,
    /// No handler is registered for the opcode
    Unknown(Opcode),
    /// The message was too short to carry an opcode
    Malformed,
    /// The handler returned an error or panicked
    Failed(Opcode),
}

/// Opcode to name lookup used in diagnostics
pub trait OpcodeNames: Send + Sync {
    fn name(&self, opcode: Opcode) -> Option<&'static str>;
}

/// Name table backed by a static slice, the shape generated tables take
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticOpcodeNames(pub &'static [(Opcode, &'static str)]);

impl OpcodeNames for StaticOpcodeNames {
    fn name(&self, opcode: Opcode) -> Option<&'static str> {
        self.0
            .iter()
            .find(|(code, _)| *code == opcode)
            .map(|(_, name)| *name)
    }
}

/// Name for logs, falling back to the numeric opcode
pub(crate) fn describe(names: Option<&dyn OpcodeNames>, opcode: Opcode) -> String {
    match names.and_then(|names| names.name(opcode)) {
        Some(name) => format!("{name} ({opcode:#06x})"),
        None => format!("{opcode:#06x}"),
    }
}
