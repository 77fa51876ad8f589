//! Per-(student, concept) mastery estimation.
//!
//! Order of operations for one response:
//! temporal decay → load-adjusted BKT step → transfer boost → recovery → clamp.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{TutorError, TutorResult, ValidationCode};
use crate::tutor::config::{AdjustmentBounds, MasteryParams, MASTERY_CEILING, MASTERY_FLOOR};
use crate::tutor::graph::ConceptGraph;
use crate::tutor::memory::bkt::{
    bkt_update, clamp_probability, predict_correct, BktParams, ParameterAdjustment,
};
use crate::tutor::memory::policy::AdaptationPolicy;
use crate::tutor::types::{QuestionMetadata, StudentConceptState};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Anything that can predict the probability of a correct answer. The selector
/// and calibration only depend on this contract.
pub trait CorrectnessPredictor: Send + Sync {
    fn predict_correctness(&self, state: &StudentConceptState, question: &QuestionMetadata) -> f64;
}

#[derive(Debug, Clone)]
pub struct MasteryInput<'a> {
    pub graph: &'a ConceptGraph,
    /// The student's states for other concepts, keyed by concept id.
    pub related: &'a HashMap<String, StudentConceptState>,
    pub correct: bool,
    pub adjustment: ParameterAdjustment,
    pub stress: f64,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MasteryUpdate {
    pub previous_mastery: f64,
    pub decayed_mastery: f64,
    pub posterior: f64,
    pub new_mastery: f64,
    pub transfer_boost: f64,
    pub recovery_boost: f64,
    pub confidence: f64,
    pub effective_params: BktParams,
    pub degraded: bool,
    pub state: StudentConceptState,
}

impl MasteryUpdate {
    pub fn delta(&self) -> f64 {
        self.new_mastery - self.previous_mastery
    }
}

#[derive(Debug, Clone)]
pub struct MasteryEstimator {
    params: MasteryParams,
    bounds: AdjustmentBounds,
    policy: Arc<dyn AdaptationPolicy>,
}

impl MasteryEstimator {
    pub fn new(params: MasteryParams, bounds: AdjustmentBounds, policy: Arc<dyn AdaptationPolicy>) -> Self {
        Self {
            params,
            bounds,
            policy,
        }
    }

    pub fn params(&self) -> &MasteryParams {
        &self.params
    }

    pub fn policy(&self) -> &Arc<dyn AdaptationPolicy> {
        &self.policy
    }

    pub fn base_params(&self) -> BktParams {
        BktParams::new(self.params.slip, self.params.guess, self.params.learn_rate)
    }

    pub fn initial_state(&self, student_id: &str, concept_id: &str) -> StudentConceptState {
        StudentConceptState::new(student_id, concept_id, &self.params)
    }

    /// Mastery after forgetting; untouched unless more than a day has elapsed.
    pub fn decayed(&self, state: &StudentConceptState, now: DateTime<Utc>) -> f64 {
        let Some(last) = state.last_interaction_ts else {
            return state.mastery;
        };
        let days = (now - last).num_milliseconds() as f64 / MILLIS_PER_DAY;
        if days <= 1.0 {
            return state.mastery;
        }
        clamp_probability(state.mastery * (-self.params.decay_rate * days).exp())
    }

    pub fn confidence(&self, practice_count: u32, window_variance: f64) -> f64 {
        let evidence = 1.0 - (-(f64::from(practice_count)) / self.params.confidence_scale).exp();
        let consistency = 1.0 - self.params.consistency_penalty * window_variance.clamp(0.0, 0.25) * 4.0;
        (evidence * consistency.clamp(0.0, 1.0)).clamp(0.0, 1.0)
    }

    fn effective_params(&self, state: &StudentConceptState, adjustment: &ParameterAdjustment) -> BktParams {
        let bounded = ParameterAdjustment {
            slip_multiplier: adjustment
                .slip_multiplier
                .clamp(self.bounds.slip_multiplier_min, self.bounds.slip_multiplier_max),
            learn_multiplier: adjustment
                .learn_multiplier
                .clamp(self.bounds.learn_multiplier_min, self.bounds.learn_multiplier_max)
                * state.learn_rate_multiplier,
        };
        self.base_params().scaled(&bounded)
    }

    fn transfer_boost(&self, concept_id: &str, input: &MasteryInput<'_>) -> f64 {
        let threshold = self.params.well_mastered_threshold;
        let total: f64 = input
            .graph
            .transfer_edges(concept_id)
            .iter()
            .filter_map(|edge| {
                let related = input.related.get(&edge.target_concept)?;
                (related.mastery > threshold).then(|| {
                    edge.strength * (related.mastery - threshold) * self.params.transfer_gain
                })
            })
            .sum();
        total.clamp(0.0, self.params.transfer_cap)
    }

    pub fn update(&self, state: &StudentConceptState, input: &MasteryInput<'_>) -> TutorResult<MasteryUpdate> {
        if !input.graph.contains(&state.concept_id) {
            return Err(TutorError::validation(
                ValidationCode::UnknownConcept,
                format!("concept {} is not in graph v{}", state.concept_id, input.graph.version()),
            ));
        }

        let previous_mastery = state.mastery;
        let decayed_mastery = self.decayed(state, input.now);
        let effective_params = self.effective_params(state, &input.adjustment);

        let step = bkt_update(
            decayed_mastery,
            &effective_params,
            input.correct,
            self.params.evidence_epsilon,
        );
        let mut degraded = step.degraded;

        let (transfer_boost, recovery_boost) = if degraded {
            (0.0, 0.0)
        } else {
            (
                self.transfer_boost(&state.concept_id, input),
                self.policy.recovery_boost(state),
            )
        };

        let raw = step.learned + transfer_boost + recovery_boost;
        if !raw.is_finite() {
            degraded = true;
        }
        let new_mastery = if raw.is_finite() {
            raw.clamp(MASTERY_FLOOR, MASTERY_CEILING)
        } else {
            decayed_mastery
        };

        let mut next = state.clone();
        next.mastery = new_mastery;
        next.practice_count = next.practice_count.saturating_add(1);
        next.last_interaction_ts = Some(input.now);
        if input.correct {
            next.correct_count = next.correct_count.saturating_add(1);
            next.consecutive_incorrect = 0;
            next.recoveries_in_streak = 0;
        } else {
            next.incorrect_count = next.incorrect_count.saturating_add(1);
            next.consecutive_incorrect = next.consecutive_incorrect.saturating_add(1);
            if recovery_boost > 0.0 {
                next.recoveries_in_streak = next.recoveries_in_streak.saturating_add(1);
            }
        }
        if degraded {
            next.degraded_updates = next.degraded_updates.saturating_add(1);
        }
        next.push_outcome(input.correct, self.params.outcome_window);
        next.learn_rate_multiplier = self.policy.learn_rate_multiplier(&next, &self.bounds);

        let stress = input.stress.clamp(0.0, 1.0);
        if stress > 0.5 {
            let target = if input.correct { 1.0 } else { 0.0 };
            let alpha = self.params.stress_tolerance_alpha * stress;
            next.stress_tolerance =
                (next.stress_tolerance + alpha * (target - next.stress_tolerance)).clamp(0.0, 1.0);
        }

        next.confidence = self.confidence(next.practice_count, next.window_variance());

        if recovery_boost > 0.0 {
            tracing::debug!(
                student_id = %state.student_id,
                concept_id = %state.concept_id,
                streak = state.consecutive_incorrect,
                recovery_boost,
                "recovery boost applied"
            );
        }

        Ok(MasteryUpdate {
            previous_mastery,
            decayed_mastery,
            posterior: step.posterior,
            new_mastery,
            transfer_boost,
            recovery_boost,
            confidence: next.confidence,
            effective_params,
            degraded,
            state: next,
        })
    }
}

impl CorrectnessPredictor for MasteryEstimator {
    fn predict_correctness(&self, state: &StudentConceptState, question: &QuestionMetadata) -> f64 {
        let difficulty = question.difficulty.clamp(0.0, 1.0);
        let base = self.base_params();
        let params = BktParams {
            slip: base.slip * (0.5 + difficulty),
            guess: base.guess * (1.0 - 0.5 * difficulty),
            learn: base.learn,
        }
        .sanitized();
        clamp_probability(predict_correct(state.mastery, &params))
    }
}
