use serde::{Deserialize, Serialize};

use crate::tutor::config::{ExamTimeProfile, TimeParams};
use crate::tutor::memory::AdaptationPolicy;
use crate::tutor::types::{ContextFactors, QuestionMetadata, StudentConceptState};

/// Multiplicative time factors. `None` means neutral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeFactors {
    pub stress: Option<f64>,
    pub fatigue: Option<f64>,
    pub mastery: Option<f64>,
    pub difficulty: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBreakdown {
    pub base_secs: f64,
    pub stress_factor: f64,
    pub fatigue_factor: f64,
    pub mastery_factor: f64,
    pub difficulty_factor: f64,
    pub raw_secs: f64,
    pub allocated_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    /// Whether the exam bounds changed the raw value.
    pub capped: bool,
}

#[derive(Debug, Clone)]
pub struct TimeAllocator {
    params: TimeParams,
}

impl TimeAllocator {
    pub fn new(params: TimeParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &TimeParams {
        &self.params
    }

    pub fn profile_for(&self, exam: &str) -> ExamTimeProfile {
        self.params.profile_for(exam)
    }

    pub fn allocate(&self, base_secs: f64, factors: &TimeFactors, profile: ExamTimeProfile) -> TimeBreakdown {
        let base_secs = if base_secs.is_finite() && base_secs > 0.0 {
            base_secs
        } else {
            self.params.default_base_secs
        };
        let stress_factor = factor(factors.stress);
        let fatigue_factor = factor(factors.fatigue);
        let mastery_factor = factor(factors.mastery);
        let difficulty_factor = factor(factors.difficulty);

        let raw_secs = base_secs * stress_factor * fatigue_factor * mastery_factor * difficulty_factor;
        let (min_secs, max_secs) = if profile.min_secs <= profile.max_secs {
            (profile.min_secs, profile.max_secs)
        } else {
            (profile.max_secs, profile.min_secs)
        };
        let allocated_secs = raw_secs.clamp(min_secs, max_secs);

        TimeBreakdown {
            base_secs,
            stress_factor,
            fatigue_factor,
            mastery_factor,
            difficulty_factor,
            raw_secs,
            allocated_secs,
            min_secs,
            max_secs,
            capped: allocated_secs != raw_secs,
        }
    }

    /// Derives the factors from the student's signals for this question.
    pub fn derive_factors(
        &self,
        question: &QuestionMetadata,
        state: &StudentConceptState,
        context: &ContextFactors,
        overload_risk: f64,
        policy: &dyn AdaptationPolicy,
    ) -> TimeFactors {
        let p = &self.params;
        let stress = context.stress.map(|s| {
            let s = s.clamp(0.0, 1.0);
            1.0 + p.stress_gain * s * (1.0 - state.stress_tolerance.clamp(0.0, 1.0))
                + p.load_gain * overload_risk.clamp(0.0, 1.0)
        });
        let fatigue = context
            .fatigue
            .map(|f| policy.fatigue_factor(f, context.session_minutes.unwrap_or(0.0)));
        TimeFactors {
            stress,
            fatigue,
            mastery: Some(1.0 + p.mastery_gain * (0.5 - state.mastery.clamp(0.0, 1.0))),
            difficulty: Some(1.0 + p.difficulty_gain * (question.difficulty.clamp(0.0, 1.0) - 0.5)),
        }
    }

    pub fn allocate_for(
        &self,
        question: &QuestionMetadata,
        state: &StudentConceptState,
        context: &ContextFactors,
        overload_risk: f64,
        policy: &dyn AdaptationPolicy,
    ) -> TimeBreakdown {
        let factors = self.derive_factors(question, state, context, overload_risk, policy);
        self.allocate(
            question.estimated_solve_secs,
            &factors,
            self.profile_for(&question.exam),
        )
    }
}

fn factor(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v,
        Some(v) => {
            tracing::warn!(factor = v, "ignoring non-positive time factor");
            1.0
        }
        None => 1.0,
    }
}
