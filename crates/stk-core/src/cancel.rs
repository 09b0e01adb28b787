use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::errors::PipelineError;

/// Race `fut` against the request's cancellation token.
///
/// Cancellation wins ties so that a withdrawn request never classifies a
/// late result as a failure.
pub async fn abortable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Aborted),
        out = fut => Ok(out),
    }
}
