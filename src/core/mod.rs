//! # Core Wire Components
//!
//! Low-level framing: the application frame and the transport record that carries it.
//!
//! ## Components
//! - **Frame**: opcode + payload, the application-level unit
//! - **Record**: the transport-level message envelope (handshake, binary, close)
//! - **Codec**: Tokio codec for records over byte streams
//!
//! ## Wire Format
//! ```text
//! Record: [Kind(1)] [Length(4)] [Body(N)]
//! Frame:  [Opcode(2)] [Payload(N-2)]      (body of a Binary record)
//! ```
//!
//! ## Safety
//! - Record length is validated against the configured maximum before allocation
//! - Frame decoding never panics; short input is reported as `FrameError`

pub mod codec;
pub mod frame;
pub mod record;
