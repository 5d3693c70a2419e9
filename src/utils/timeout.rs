//! Timeout constants and async timeout helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default timeout for connect attempts
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closing side waits for the peer's close record
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for graceful server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut`, mapping an elapsed deadline to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
