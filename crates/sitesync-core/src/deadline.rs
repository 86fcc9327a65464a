use std::future::Future;
use std::time::Duration;

use crate::error::SyncError;

/// Run a backend call under an optional caller-supplied deadline.
///
/// Exceeding the deadline drops the call and yields `SyncError::Timeout`.
pub async fn with_deadline<T, F>(
    operation: &str,
    deadline: Option<Duration>,
    call: F,
) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match deadline {
        None => call.await,
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                operation: operation.to_string(),
                elapsed: limit,
            }),
        },
    }
}
