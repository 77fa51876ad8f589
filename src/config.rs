use std::path::PathBuf;

/// Process-level settings for the reference host. Model tuning lives in
/// [`crate::tutor::TutorConfig`].
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// Directory for the rolling log file; `None` keeps logging on stdout only.
    pub log_dir: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub worker_leader: bool,
    pub calibration_schedule: String,
    pub fairness_schedule: String,
    pub bandit_merge_schedule: String,
    pub calibration_window_days: i64,
    pub enable_calibration_worker: bool,
    pub enable_fairness_worker: bool,
    pub enable_bandit_worker: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            catalog_path: None,
            worker_leader: false,
            calibration_schedule: "0 0 3 * * *".to_string(),
            fairness_schedule: "0 30 3 * * *".to_string(),
            bandit_merge_schedule: "0 */5 * * * *".to_string(),
            calibration_window_days: 30,
            enable_calibration_worker: true,
            enable_fairness_worker: true,
            enable_bandit_worker: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let log_level = std::env::var("RUST_LOG").unwrap_or(defaults.log_level);
        let log_dir = flag("ENABLE_FILE_LOGS", false).then(|| {
            std::env::var("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./logs"))
        });
        let catalog_path = std::env::var("TUTOR_CATALOG_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let calibration_window_days = std::env::var("CALIBRATION_WINDOW_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|d| *d > 0)
            .unwrap_or(defaults.calibration_window_days);

        Self {
            log_level,
            log_dir,
            catalog_path,
            worker_leader: flag("WORKER_LEADER", false),
            calibration_schedule: std::env::var("CALIBRATION_SCHEDULE").unwrap_or(defaults.calibration_schedule),
            fairness_schedule: std::env::var("FAIRNESS_SCHEDULE").unwrap_or(defaults.fairness_schedule),
            bandit_merge_schedule: std::env::var("BANDIT_MERGE_SCHEDULE").unwrap_or(defaults.bandit_merge_schedule),
            calibration_window_days,
            enable_calibration_worker: flag("ENABLE_CALIBRATION_WORKER", true),
            enable_fairness_worker: flag("ENABLE_FAIRNESS_WORKER", true),
            enable_bandit_worker: flag("ENABLE_BANDIT_MERGE_WORKER", true),
        }
    }
}

fn flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) if default => v != "false" && v != "0",
        Ok(v) => v == "true" || v == "1",
        Err(_) => default,
    }
}
