//! Detached execution of multi-step operations.

use crate::error::AssetError;
use crate::metrics;
use std::future::Future;
use tracing::Instrument;

/// Run `operation` on its own Tokio task and wait for it.
///
/// Dropping the returned future does not cancel the task: a started
/// operation always runs its remaining store calls, compensation included.
pub(crate) async fn run_detached<T, Fut>(op: &'static str, operation: Fut) -> Result<T, AssetError>
where
    Fut: Future<Output = Result<T, AssetError>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(operation.in_current_span());

    match handle.await {
        Ok(result) => result,
        Err(join_err) => {
            metrics::DETACHED_TASKS_FAILED.inc();
            tracing::error!(
                op,
                panic = join_err.is_panic(),
                error = %join_err,
                "Detached operation task failed"
            );
            Err(AssetError::Internal(format!("{op} task failed: {join_err}")))
        }
    }
}
