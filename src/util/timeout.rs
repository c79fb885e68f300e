//! Timeout helper.

use std::future::Future;
use std::time::Duration;

/// Race a future against a deadline.
///
/// Returns `None` when the deadline elapses first; the inner future is
/// dropped and its eventual result discarded.
pub async fn race<T>(duration: Duration, future: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(duration, future).await.ok()
}
