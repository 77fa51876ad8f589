mod bandit_merge;
mod calibration;
mod fairness;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::TutorError;
use crate::tutor::BatchJobs;

pub use bandit_merge::merge_pending;
pub use calibration::refit_calibration;
pub use fairness::compute_fairness_report;

static WORKER_LEADER: AtomicBool = AtomicBool::new(false);

pub fn is_worker_leader() -> bool {
    WORKER_LEADER.load(Ordering::Relaxed)
}

fn set_worker_leader(val: bool) {
    WORKER_LEADER.store(val, Ordering::Relaxed);
}

/// Cron-driven batch jobs: calibration refit, fairness report, bandit merge.
/// Only the leader instance schedules anything.
pub struct WorkerManager<E: BatchJobs + 'static> {
    scheduler: Mutex<JobScheduler>,
    shutdown_tx: broadcast::Sender<()>,
    engine: Arc<E>,
    config: Config,
    fairness_window_days: i64,
}

impl<E: BatchJobs + 'static> WorkerManager<E> {
    pub async fn new(engine: Arc<E>, config: Config, fairness_window_days: i64) -> Result<Self, WorkerError> {
        let scheduler = JobScheduler::new().await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            shutdown_tx,
            engine,
            config,
            fairness_window_days,
        })
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        if !self.config.worker_leader {
            info!("WORKER_LEADER not set, skipping worker startup");
            return Ok(());
        }

        set_worker_leader(true);
        info!("Starting workers (leader mode)");

        let scheduler = self.scheduler.lock().await;

        if self.config.enable_calibration_worker {
            let schedule = self.config.calibration_schedule.clone();
            let window_days = self.config.calibration_window_days;
            let engine = Arc::clone(&self.engine);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
                let engine = Arc::clone(&engine);
                let mut rx = shutdown_rx.resubscribe();
                Box::pin(async move {
                    tokio::select! {
                        _ = rx.recv() => {},
                        result = refit_calibration(engine, window_days) => {
                            if let Err(e) = result {
                                error!(error = %e, "Calibration worker error");
                            }
                        }
                    }
                })
            })?;
            scheduler.add(job).await?;
            info!(schedule = %schedule, window_days, "Calibration worker scheduled");
        }

        if self.config.enable_fairness_worker {
            let schedule = self.config.fairness_schedule.clone();
            let window_days = self.fairness_window_days;
            let engine = Arc::clone(&self.engine);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
                let engine = Arc::clone(&engine);
                let mut rx = shutdown_rx.resubscribe();
                Box::pin(async move {
                    tokio::select! {
                        _ = rx.recv() => {},
                        result = compute_fairness_report(engine, window_days) => {
                            if let Err(e) = result {
                                error!(error = %e, "Fairness worker error");
                            }
                        }
                    }
                })
            })?;
            scheduler.add(job).await?;
            info!(schedule = %schedule, window_days, "Fairness worker scheduled");
        }

        if self.config.enable_bandit_worker {
            let schedule = self.config.bandit_merge_schedule.clone();
            let engine = Arc::clone(&self.engine);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
                let engine = Arc::clone(&engine);
                let mut rx = shutdown_rx.resubscribe();
                Box::pin(async move {
                    tokio::select! {
                        _ = rx.recv() => {},
                        result = merge_pending(engine) => {
                            if let Err(e) = result {
                                error!(error = %e, "Bandit merge worker error");
                            }
                        }
                    }
                })
            })?;
            scheduler.add(job).await?;
            info!(schedule = %schedule, "Bandit merge worker scheduled");
        }

        scheduler.start().await?;
        info!("All workers started");

        Ok(())
    }

    pub async fn stop(&self) {
        if !is_worker_leader() {
            return;
        }

        info!("Stopping workers...");
        let _ = self.shutdown_tx.send(());

        let mut scheduler = self.scheduler.lock().await;
        if let Err(e) = scheduler.shutdown().await {
            warn!(error = %e, "Error shutting down scheduler");
        }

        set_worker_leader(false);
        info!("Workers stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
    #[error("Tutor error: {0}")]
    Tutor(#[from] TutorError),
    #[error("Batch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
