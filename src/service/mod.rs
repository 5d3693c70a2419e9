//! # Service Layer
//!
//! Everything an application wires up directly.
//!
//! ## Components
//! - **Session**: awaitable connect and close over a tick-driven transport
//! - **Connector**: composes transport, session and client runtime for one endpoint
//! - **Server**: tokio accept loop hosting a server runtime and its session registry

pub mod connector;
pub mod server;
pub mod session;

pub use connector::{ClientHandle, Connector};
pub use server::{FrameServer, SessionRegistry};
pub use session::{Session, SessionState};
