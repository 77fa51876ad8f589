//! Ad-hoc adaptation rules kept apart from the Bayesian core so they can be
//! tuned or swapped without touching the estimator.

use std::fmt::Debug;

use crate::tutor::config::{AdjustmentBounds, RecoveryParams};
use crate::tutor::types::StudentConceptState;

pub trait AdaptationPolicy: Send + Sync + Debug {
    /// Additive recovery term for the update about to run, given the state
    /// before that update. Zero when no recovery applies.
    fn recovery_boost(&self, state: &StudentConceptState) -> f64;

    /// Per-concept learning-rate multiplier after the latest outcome was recorded.
    fn learn_rate_multiplier(&self, state: &StudentConceptState, bounds: &AdjustmentBounds) -> f64;

    /// Time-budget multiplier for the student's current fatigue.
    fn fatigue_factor(&self, fatigue: f64, session_minutes: f64) -> f64;
}

/// Fires a bounded recovery boost once a failure streak reaches its limit.
/// Further firings inside the same streak shrink geometrically.
#[derive(Debug, Clone)]
pub struct StreakRecoveryPolicy {
    params: RecoveryParams,
    fatigue_gain: f64,
}

impl StreakRecoveryPolicy {
    pub fn new(params: RecoveryParams, fatigue_gain: f64) -> Self {
        Self {
            params,
            fatigue_gain,
        }
    }

    pub fn streak_limit(&self, practice_count: u32) -> u32 {
        if practice_count <= self.params.new_concept_practice_limit {
            self.params.new_concept_streak_limit.max(1)
        } else {
            self.params.streak_limit.max(1)
        }
    }
}

impl Default for StreakRecoveryPolicy {
    fn default() -> Self {
        Self::new(RecoveryParams::default(), 0.25)
    }
}

impl AdaptationPolicy for StreakRecoveryPolicy {
    fn recovery_boost(&self, state: &StudentConceptState) -> f64 {
        let streak = state.consecutive_incorrect;
        if streak == 0 {
            return 0.0;
        }
        let limit = self.streak_limit(state.practice_count);
        let fired = state.recoveries_in_streak;
        if streak < limit.saturating_mul(fired + 1) {
            return 0.0;
        }
        let boost = self.params.base_boost * self.params.decay.powi(fired as i32);
        if boost < self.params.min_boost {
            return 0.0;
        }
        boost.min(self.params.cap)
    }

    fn learn_rate_multiplier(&self, state: &StudentConceptState, bounds: &AdjustmentBounds) -> f64 {
        let current = state.learn_rate_multiplier;
        let step = self.params.learn_multiplier_step;
        // Too few outcomes to judge a trend.
        if state.recent_outcomes.len() < 5 {
            return current.clamp(bounds.learn_rate_multiplier_min, bounds.learn_rate_multiplier_max);
        }
        let accuracy = state.recent_accuracy().unwrap_or(0.5);
        let next = if accuracy >= self.params.high_accuracy {
            current * (1.0 + step)
        } else if accuracy <= self.params.low_accuracy {
            current * (1.0 - step)
        } else {
            current
        };
        next.clamp(bounds.learn_rate_multiplier_min, bounds.learn_rate_multiplier_max)
    }

    fn fatigue_factor(&self, fatigue: f64, session_minutes: f64) -> f64 {
        let fatigue = fatigue.clamp(0.0, 1.0);
        let long_session = ((session_minutes - 45.0).max(0.0) / 60.0).min(1.0) * 0.1;
        (1.0 + self.fatigue_gain * fatigue + long_session).clamp(1.0, 1.5)
    }
}
