use serde::{Deserialize, Serialize};

use crate::tutor::config::{AdjustmentBounds, LoadParams};
use crate::tutor::memory::ParameterAdjustment;
use crate::tutor::types::{ContextFactors, QuestionMetadata, StudentConceptState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Advisory {
    ReduceDistractions,
    OfferBreak,
    SimplifyNextQuestion,
    ReviewPrerequisites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadLevel {
    Low,
    Optimal,
    High,
    Overload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAssessment {
    pub intrinsic: f64,
    pub extraneous: f64,
    pub germane: f64,
    pub total_load: f64,
    pub capacity: f64,
    pub overload_risk: f64,
    pub level: LoadLevel,
    pub advisories: Vec<Advisory>,
    pub adjustment: ParameterAdjustment,
    /// Context multipliers after defaulting and clamping.
    pub device_multiplier: f64,
    pub network_multiplier: f64,
    pub distraction_multiplier: f64,
}

/// Working-memory load model. Pure and infallible: absent context is neutral.
#[derive(Debug, Clone)]
pub struct CognitiveLoadAssessor {
    params: LoadParams,
    bounds: AdjustmentBounds,
}

impl CognitiveLoadAssessor {
    pub fn new(params: LoadParams, bounds: AdjustmentBounds) -> Self {
        Self { params, bounds }
    }

    fn context_multiplier(&self, value: Option<f64>) -> f64 {
        match value {
            Some(v) if v.is_finite() => {
                v.clamp(self.params.context_multiplier_min, self.params.context_multiplier_max)
            }
            _ => 1.0,
        }
    }

    pub fn intrinsic(&self, question: &QuestionMetadata, mastery_gap: f64) -> f64 {
        let blend = self.params.bloom_blend.clamp(0.0, 1.0);
        let complexity = question.difficulty.clamp(0.0, 1.0) * (1.0 - blend) + question.bloom_norm() * blend;
        self.params.intrinsic_weight * complexity * (0.5 + mastery_gap.clamp(0.0, 1.0))
    }

    /// Schema-building effort peaks for partially mastered concepts.
    pub fn germane(&self, mastery: f64) -> f64 {
        let m = mastery.clamp(0.0, 1.0);
        self.params.germane_weight * 4.0 * m * (1.0 - m)
    }

    pub fn assess(
        &self,
        question: &QuestionMetadata,
        state: &StudentConceptState,
        context: &ContextFactors,
    ) -> LoadAssessment {
        let p = &self.params;

        let device = self.context_multiplier(context.device_multiplier);
        let network = self.context_multiplier(context.network_multiplier);
        let distraction = self.context_multiplier(context.distraction_multiplier);
        let friction = context
            .interface_friction
            .filter(|f| f.is_finite())
            .map(|f| f.clamp(0.0, 1.0))
            .unwrap_or(0.0);

        let intrinsic = self.intrinsic(question, state.mastery_gap());
        let extraneous = p.extraneous_base * device * network * distraction * (1.0 + friction);
        let germane = self.germane(state.mastery);
        let total_load = intrinsic + extraneous + germane;

        let capacity = (p.working_memory_capacity
            * (1.0 - p.stress_capacity_penalty * context.stress_level())
            * (1.0 - p.fatigue_capacity_penalty * context.fatigue_level()))
        .max(1e-6);

        let overload_risk = sigmoid(p.steepness * (total_load / capacity - 1.0));
        let level = self.level(overload_risk);

        let mut advisories = Vec::new();
        if overload_risk >= p.distraction_threshold {
            advisories.push(Advisory::ReduceDistractions);
        }
        if overload_risk >= p.break_threshold {
            advisories.push(Advisory::OfferBreak);
        }
        if overload_risk >= p.simplify_threshold {
            advisories.push(Advisory::SimplifyNextQuestion);
        }
        if overload_risk >= p.distraction_threshold && total_load > 0.0 && intrinsic / total_load >= p.intrinsic_dominance {
            advisories.push(Advisory::ReviewPrerequisites);
        }

        LoadAssessment {
            intrinsic,
            extraneous,
            germane,
            total_load,
            capacity,
            overload_risk,
            level,
            advisories,
            adjustment: self.adjustment(overload_risk, level),
            device_multiplier: device,
            network_multiplier: network,
            distraction_multiplier: distraction,
        }
    }

    fn level(&self, risk: f64) -> LoadLevel {
        if risk < self.bounds.low_load_risk {
            LoadLevel::Low
        } else if risk < self.params.break_threshold {
            LoadLevel::Optimal
        } else if risk < self.params.simplify_threshold {
            LoadLevel::High
        } else {
            LoadLevel::Overload
        }
    }

    /// High load raises effective slip. Low load speeds learning, overload slows it.
    pub fn adjustment(&self, risk: f64, level: LoadLevel) -> ParameterAdjustment {
        let b = &self.bounds;
        let slip_multiplier = (1.0 + b.slip_gain * risk).clamp(b.slip_multiplier_min, b.slip_multiplier_max);
        let learn_multiplier = match level {
            LoadLevel::Low if b.low_load_risk > 0.0 => {
                1.0 + b.learn_gain * (b.low_load_risk - risk) / b.low_load_risk
            }
            LoadLevel::Overload => 1.0 - b.learn_gain * risk,
            _ => 1.0,
        }
        .clamp(b.learn_multiplier_min, b.learn_multiplier_max);
        ParameterAdjustment {
            slip_multiplier,
            learn_multiplier,
        }
    }
}

impl Default for CognitiveLoadAssessor {
    fn default() -> Self {
        Self::new(LoadParams::default(), AdjustmentBounds::default())
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
