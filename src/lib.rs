//! # framelink
//!
//! Bidirectional framed-message networking.
//!
//! A frame is a 16-bit big-endian opcode followed by its payload. Frames travel
//! inside transport records that are delivered atomically, so a frame carries no
//! length prefix of its own.
//!
//! ## Client
//! A [`Connector`] wires one transport strategy, a [`Session`] and a
//! [`ClientRuntime`](protocol::client::ClientRuntime) together. Inbound traffic is
//! queued by the transport and only reaches handlers when the owner calls
//! [`ClientHandle::tick`], which keeps every handler on one thread.
//!
//! ## Server
//! A [`FrameServer`] accepts connections, routes every inbound frame through a
//! [`ServerRuntime`] and exposes an outbound proxy that can reach any live session.
//!
//! ## Failure isolation
//! Unknown opcodes, malformed frames and failing handlers are reported through
//! hooks and counted in [`Metrics`](utils::metrics::Metrics); none of them closes
//! the connection.

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::{ClientConfig, NetworkConfig, ServerConfig, TransportConfig, TransportStrategy};
pub use crate::core::frame::{Frame, Opcode};
pub use error::{FrameError, ProtocolError, Result};
pub use protocol::client::{ClientHooks, FrameContext, HandlerTable, LogHooks};
pub use protocol::server::{DispatchTable, InboundContext, InboundDispatch, OutboundProxy, ServerHooks, ServerRuntime};
pub use protocol::{DispatchOutcome, OpcodeNames, StaticOpcodeNames};
pub use service::{ClientHandle, Connector, FrameServer, Session, SessionState};
