use std::future::Future;

use tokio::time::Instant;
use tracing::warn;

use crate::error::{BackendError, Result};

/// Races `op` against a caller-supplied cancellation signal.
///
/// When the signal fires first the operation future is dropped, which aborts
/// any in-flight request. The remote object for `key` is then in an unknown
/// state and must be reconciled by a later listing.
pub async fn cancellable<T, C, F>(key: &str, cancel: C, op: F) -> Result<T>
where
    C: Future<Output = ()>,
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        () = cancel => {
            warn!(key, "operation cancelled");
            Err(BackendError::Cancelled { key: key.to_string() })
        }
        res = op => res,
    }
}

/// Like [`cancellable`], with a deadline as the signal.
pub async fn with_deadline<T, F>(key: &str, deadline: Instant, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    cancellable(key, tokio::time::sleep_until(deadline), op).await
}
