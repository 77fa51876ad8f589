use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::tutor::BatchJobs;

/// Refits every (exam, subject) temperature over the trailing window and
/// publishes the results in one swap.
pub async fn refit_calibration<E: BatchJobs + 'static>(engine: Arc<E>, window_days: i64) -> Result<(), super::WorkerError> {
    let start = Instant::now();
    info!(window_days, "Starting calibration refit");

    let window = chrono::Duration::days(window_days);
    let profiles = tokio::task::spawn_blocking(move || engine.refit_calibration(window)).await??;

    let calibrated = profiles.iter().filter(|p| p.calibrated).count();
    for profile in profiles.iter().filter(|p| !p.calibrated) {
        warn!(
            exam = %profile.exam,
            subject = %profile.subject,
            samples = profile.sample_count,
            "Calibration kept at identity temperature"
        );
    }

    info!(
        profiles = profiles.len(),
        calibrated,
        duration_secs = start.elapsed().as_secs_f64(),
        "Calibration refit completed"
    );
    Ok(())
}
