//! # Utility Modules
//!
//! Supporting utilities shared by transports and runtimes.
//!
//! ## Components
//! - **Buffer Pool**: rent/return of reusable byte buffers
//! - **Logging**: `tracing-subscriber` setup driven by `LoggingConfig`
//! - **Metrics**: thread-safe observability counters
//! - **Panic**: formatting of panic payloads caught at dispatch boundaries
//! - **Timeout**: timeout constants and async wrappers

pub mod buffer_pool;
pub mod logging;
pub mod metrics;
pub mod panic;
pub mod timeout;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use metrics::{Metrics, MetricsSnapshot};
