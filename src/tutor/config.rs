use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{TutorError, TutorResult, ValidationCode};

pub const MASTERY_FLOOR: f64 = 0.005;
pub const MASTERY_CEILING: f64 = 0.995;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasteryParams {
    pub prior_mastery: f64,
    pub slip: f64,
    pub guess: f64,
    pub learn_rate: f64,
    /// Per-day forgetting rate applied when more than a day has elapsed.
    pub decay_rate: f64,
    pub evidence_epsilon: f64,
    pub well_mastered_threshold: f64,
    pub transfer_gain: f64,
    pub transfer_cap: f64,
    pub confidence_scale: f64,
    pub consistency_penalty: f64,
    pub outcome_window: usize,
    pub stress_tolerance_alpha: f64,
    pub initial_stress_tolerance: f64,
}

impl Default for MasteryParams {
    fn default() -> Self {
        Self {
            prior_mastery: 0.3,
            slip: 0.1,
            guess: 0.2,
            learn_rate: 0.15,
            decay_rate: 0.05,
            evidence_epsilon: 1e-9,
            well_mastered_threshold: 0.7,
            transfer_gain: 0.5,
            transfer_cap: 0.2,
            confidence_scale: 5.0,
            consistency_penalty: 0.5,
            outcome_window: 20,
            stress_tolerance_alpha: 0.1,
            initial_stress_tolerance: 0.5,
        }
    }
}

/// Bounds on how far cognitive load may move slip and learn rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjustmentBounds {
    pub slip_gain: f64,
    pub slip_multiplier_min: f64,
    pub slip_multiplier_max: f64,
    pub learn_gain: f64,
    pub learn_multiplier_min: f64,
    pub learn_multiplier_max: f64,
    /// Overload risk below which load counts as comfortably low.
    pub low_load_risk: f64,
    pub learn_rate_multiplier_min: f64,
    pub learn_rate_multiplier_max: f64,
}

impl Default for AdjustmentBounds {
    fn default() -> Self {
        Self {
            slip_gain: 0.6,
            slip_multiplier_min: 0.8,
            slip_multiplier_max: 1.6,
            learn_gain: 0.4,
            learn_multiplier_min: 0.6,
            learn_multiplier_max: 1.4,
            low_load_risk: 0.3,
            learn_rate_multiplier_min: 0.5,
            learn_rate_multiplier_max: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryParams {
    /// Concepts with at most this many attempts use the new-concept streak limit.
    pub new_concept_practice_limit: u32,
    pub new_concept_streak_limit: u32,
    pub streak_limit: u32,
    pub base_boost: f64,
    pub cap: f64,
    /// Multiplier applied to each further recovery within the same failure streak.
    pub decay: f64,
    pub min_boost: f64,
    pub learn_multiplier_step: f64,
    pub high_accuracy: f64,
    pub low_accuracy: f64,
}

impl Default for RecoveryParams {
    fn default() -> Self {
        Self {
            new_concept_practice_limit: 2,
            new_concept_streak_limit: 1,
            streak_limit: 2,
            base_boost: 0.15,
            cap: 0.35,
            decay: 0.5,
            min_boost: 0.005,
            learn_multiplier_step: 0.02,
            high_accuracy: 0.8,
            low_accuracy: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadParams {
    pub intrinsic_weight: f64,
    pub bloom_blend: f64,
    pub extraneous_base: f64,
    pub germane_weight: f64,
    pub working_memory_capacity: f64,
    pub stress_capacity_penalty: f64,
    pub fatigue_capacity_penalty: f64,
    pub steepness: f64,
    pub distraction_threshold: f64,
    pub break_threshold: f64,
    pub simplify_threshold: f64,
    pub intrinsic_dominance: f64,
    pub context_multiplier_min: f64,
    pub context_multiplier_max: f64,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            intrinsic_weight: 1.0,
            bloom_blend: 0.3,
            extraneous_base: 0.3,
            germane_weight: 0.4,
            working_memory_capacity: 1.3,
            stress_capacity_penalty: 0.3,
            fatigue_capacity_penalty: 0.3,
            steepness: 6.0,
            distraction_threshold: 0.5,
            break_threshold: 0.7,
            simplify_threshold: 0.85,
            intrinsic_dominance: 0.6,
            context_multiplier_min: 0.5,
            context_multiplier_max: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExamTimeProfile {
    pub min_secs: f64,
    pub max_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeParams {
    pub default_base_secs: f64,
    pub stress_gain: f64,
    pub load_gain: f64,
    pub fatigue_gain: f64,
    pub mastery_gain: f64,
    pub difficulty_gain: f64,
    pub default_profile: ExamTimeProfile,
    pub exam_profiles: HashMap<String, ExamTimeProfile>,
    /// Time unit used to express reward as correctness per unit time.
    pub reward_time_unit_secs: f64,
}

impl Default for TimeParams {
    fn default() -> Self {
        let mut exam_profiles = HashMap::new();
        exam_profiles.insert(
            "rapid_recall".to_string(),
            ExamTimeProfile {
                min_secs: 10.0,
                max_secs: 45.0,
            },
        );
        exam_profiles.insert(
            "multi_step".to_string(),
            ExamTimeProfile {
                min_secs: 60.0,
                max_secs: 360.0,
            },
        );
        Self {
            default_base_secs: 60.0,
            stress_gain: 0.3,
            load_gain: 0.2,
            fatigue_gain: 0.25,
            mastery_gain: 0.4,
            difficulty_gain: 0.5,
            default_profile: ExamTimeProfile {
                min_secs: 15.0,
                max_secs: 180.0,
            },
            exam_profiles,
            reward_time_unit_secs: 60.0,
        }
    }
}

impl TimeParams {
    pub fn profile_for(&self, exam: &str) -> ExamTimeProfile {
        self.exam_profiles
            .get(exam)
            .copied()
            .unwrap_or(self.default_profile)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub min_samples: usize,
    pub bins: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub max_fit_samples: usize,
    pub seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_samples: 50,
            bins: 10,
            max_iterations: 100,
            tolerance: 1e-7,
            min_temperature: 0.05,
            max_temperature: 20.0,
            max_fit_samples: 5000,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    pub alpha: f64,
    pub lambda: f64,
    pub merge_batch_size: usize,
    pub reward_cap: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            lambda: 1.0,
            merge_batch_size: 32,
            reward_cap: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub prerequisite_gate: f64,
    pub review_priority_bonus: f64,
    pub max_candidates: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            prerequisite_gate: 0.4,
            review_priority_bonus: 0.5,
            max_candidates: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HalfLifeParams {
    pub base_half_life_days: f64,
    /// Regression weights over `[bias, difficulty, ability, sqrt(successes), sqrt(failures)]`.
    pub theta: [f64; 5],
    pub min_half_life_days: f64,
    pub max_half_life_days: f64,
    pub spacing_multiplier: f64,
    pub max_due: usize,
}

impl Default for HalfLifeParams {
    fn default() -> Self {
        Self {
            base_half_life_days: 1.0,
            theta: [0.0, -1.0, 2.0, 0.8, -0.6],
            min_half_life_days: 0.04,
            max_half_life_days: 365.0,
            spacing_multiplier: 1.0,
            max_due: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FairnessConfig {
    pub low_threshold: f64,
    pub medium_threshold: f64,
    pub high_threshold: f64,
    pub min_segment_size: usize,
    pub window_days: i64,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            low_threshold: 0.05,
            medium_threshold: 0.10,
            high_threshold: 0.15,
            min_segment_size: 30,
            window_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub latency_budget_ms: u64,
    pub repository_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            latency_budget_ms: 50,
            repository_timeout_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TutorConfig {
    pub mastery: MasteryParams,
    pub adjustment: AdjustmentBounds,
    pub recovery: RecoveryParams,
    pub load: LoadParams,
    pub time: TimeParams,
    pub calibration: CalibrationConfig,
    pub bandit: BanditConfig,
    pub selector: SelectorConfig,
    pub scheduler: HalfLifeParams,
    pub fairness: FairnessConfig,
    pub orchestrator: OrchestratorConfig,
}

impl TutorConfig {
    /// Defaults, then `TUTOR_CONFIG_PATH` if set, then `TUTOR_*` overrides.
    pub fn load() -> TutorResult<Self> {
        let mut config = match std::env::var("TUTOR_CONFIG_PATH") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> TutorResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            TutorError::validation(
                ValidationCode::InvalidConfig,
                format!("cannot read {}: {err}", path.display()),
            )
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> TutorResult<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|err| {
            TutorError::validation(ValidationCode::InvalidConfig, err.to_string())
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_f64("TUTOR_PRIOR_MASTERY") {
            self.mastery.prior_mastery = v;
        }
        if let Some(v) = env_f64("TUTOR_SLIP") {
            self.mastery.slip = v;
        }
        if let Some(v) = env_f64("TUTOR_GUESS") {
            self.mastery.guess = v;
        }
        if let Some(v) = env_f64("TUTOR_LEARN_RATE") {
            self.mastery.learn_rate = v;
        }
        if let Some(v) = env_f64("TUTOR_DECAY_RATE") {
            self.mastery.decay_rate = v;
        }
        if let Some(v) = env_f64("TUTOR_BANDIT_ALPHA") {
            self.bandit.alpha = v;
        }
        if let Some(v) = env_f64("TUTOR_PREREQUISITE_GATE") {
            self.selector.prerequisite_gate = v;
        }
        if let Ok(val) = std::env::var("TUTOR_LATENCY_BUDGET_MS") {
            if let Ok(ms) = val.parse() {
                self.orchestrator.latency_budget_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("TUTOR_REPOSITORY_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.orchestrator.repository_timeout_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> TutorResult<()> {
        let m = &self.mastery;
        for (name, value) in [
            ("mastery.prior_mastery", m.prior_mastery),
            ("mastery.slip", m.slip),
            ("mastery.guess", m.guess),
            ("mastery.learn_rate", m.learn_rate),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(invalid(format!("{name} must lie in (0, 1), got {value}")));
            }
        }
        if m.slip + m.guess >= 1.0 {
            return Err(invalid(format!(
                "slip + guess must be < 1, got {}",
                m.slip + m.guess
            )));
        }
        if !(15..=50).contains(&m.outcome_window) {
            return Err(invalid(format!(
                "mastery.outcome_window must be within 15..=50, got {}",
                m.outcome_window
            )));
        }
        if m.decay_rate < 0.0 || m.transfer_cap < 0.0 || m.confidence_scale <= 0.0 {
            return Err(invalid("mastery decay, transfer cap and confidence scale must be non-negative"));
        }

        let a = &self.adjustment;
        if a.slip_multiplier_min > a.slip_multiplier_max
            || a.learn_multiplier_min > a.learn_multiplier_max
            || a.learn_rate_multiplier_min > a.learn_rate_multiplier_max
        {
            return Err(invalid("adjustment multiplier bounds are inverted"));
        }

        let r = &self.recovery;
        if r.cap <= 0.0 || r.cap > 0.35 || r.base_boost < 0.0 || !(0.0..1.0).contains(&r.decay) {
            return Err(invalid("recovery cap must be in (0, 0.35] and decay in [0, 1)"));
        }

        if self.load.working_memory_capacity <= 0.0 {
            return Err(invalid("load.working_memory_capacity must be positive"));
        }

        let t = &self.time;
        for (exam, profile) in std::iter::once(("<default>", &t.default_profile))
            .chain(t.exam_profiles.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if profile.min_secs <= 0.0 || profile.min_secs > profile.max_secs {
                return Err(invalid(format!("time profile {exam} has invalid bounds")));
            }
        }

        if self.calibration.bins == 0 {
            return Err(invalid("calibration.bins must be positive"));
        }
        if self.calibration.min_temperature <= 0.0
            || self.calibration.min_temperature >= self.calibration.max_temperature
        {
            return Err(invalid("calibration temperature bounds are invalid"));
        }

        if self.bandit.lambda <= 0.0 || self.bandit.alpha < 0.0 {
            return Err(invalid("bandit.lambda must be positive and alpha non-negative"));
        }

        let s = &self.scheduler;
        if s.min_half_life_days <= 0.0 || s.min_half_life_days > s.max_half_life_days {
            return Err(invalid("scheduler half-life bounds are invalid"));
        }

        let f = &self.fairness;
        if !(f.low_threshold < f.medium_threshold && f.medium_threshold < f.high_threshold) {
            return Err(invalid("fairness thresholds must be strictly ascending"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> TutorError {
    TutorError::validation(ValidationCode::InvalidConfig, message)
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
