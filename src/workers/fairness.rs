use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::tutor::fairness::AlertTier;
use crate::tutor::BatchJobs;

pub async fn compute_fairness_report<E: BatchJobs + 'static>(
    engine: Arc<E>,
    window_days: i64,
) -> Result<(), super::WorkerError> {
    let start = Instant::now();
    let window = chrono::Duration::days(window_days);
    let report = tokio::task::spawn_blocking(move || engine.compute_fairness_report(window)).await??;

    for finding in report.findings.iter().filter(|f| f.tier >= AlertTier::Medium) {
        warn!(
            dimension = %finding.dimension,
            metric = ?finding.metric,
            disparity = finding.disparity,
            max_segment = %finding.max_segment,
            min_segment = %finding.min_segment,
            tier = ?finding.tier,
            "Fairness disparity detected"
        );
    }

    info!(
        interactions = report.interactions,
        segments = report.segments.len(),
        findings = report.findings.len(),
        overall = ?report.overall,
        duration_secs = start.elapsed().as_secs_f64(),
        "Fairness report published"
    );
    Ok(())
}
