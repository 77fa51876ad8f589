use std::sync::Arc;

use tracing::debug;

use crate::tutor::BatchJobs;

/// Flushes buffered bandit observations that never reached the inline batch size.
pub async fn merge_pending<E: BatchJobs + 'static>(engine: Arc<E>) -> Result<(), super::WorkerError> {
    let merged = tokio::task::spawn_blocking(move || engine.merge_bandit()).await?;
    debug!(merged, "Bandit merge tick");
    Ok(())
}
