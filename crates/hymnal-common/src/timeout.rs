//! Deadline helpers for async operations.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::HymnalError;

/// Run an operation with an optional deadline.
///
/// `None` waits for the operation however long it takes.
pub async fn with_timeout<T, F, Fut>(
    timeout: Option<Duration>,
    operation: F,
) -> Result<T, HymnalError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, operation())
            .await
            .map_err(|_| {
                debug!(?limit, "Deadline elapsed");
                HymnalError::Timeout(limit)
            }),
        None => Ok(operation().await),
    }
}
