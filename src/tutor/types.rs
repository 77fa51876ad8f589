use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tutor::config::{MasteryParams, MASTERY_CEILING, MASTERY_FLOOR};
use crate::tutor::modeling::{Advisory, TimeBreakdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum TransferKind {
    PrerequisiteOf,
    #[default]
    Analogous,
    ComponentOf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEdge {
    pub target_concept: String,
    pub strength: f64,
    #[serde(default)]
    pub kind: TransferKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub prerequisites: BTreeSet<String>,
    #[serde(default)]
    pub transfer_edges: Vec<TransferEdge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[derive(Default)]
pub enum ScoringScheme {
    #[default]
    Standard,
    PartialCredit,
    NegativeMarking { penalty: f64 },
}

impl ScoringScheme {
    /// Risk carried by a wrong answer, normalized to [0, 1].
    pub fn risk(&self) -> f64 {
        match self {
            Self::Standard => 0.0,
            Self::PartialCredit => 0.0,
            Self::NegativeMarking { penalty } => penalty.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionMetadata {
    pub question_id: String,
    pub concept_id: String,
    pub exam: String,
    pub subject: String,
    pub difficulty: f64,
    pub bloom_level: u8,
    pub estimated_solve_secs: f64,
    #[serde(default)]
    pub scoring_scheme: ScoringScheme,
    #[serde(default)]
    pub prerequisite_concepts: Vec<String>,
}

impl QuestionMetadata {
    /// Bloom level 1..=6 mapped onto [0, 1].
    pub fn bloom_norm(&self) -> f64 {
        (f64::from(self.bloom_level.clamp(1, 6)) - 1.0) / 5.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentConceptState {
    pub student_id: String,
    pub concept_id: String,
    pub mastery: f64,
    pub confidence: f64,
    pub practice_count: u32,
    pub correct_count: u32,
    pub incorrect_count: u32,
    pub last_interaction_ts: Option<DateTime<Utc>>,
    pub learn_rate_multiplier: f64,
    pub stress_tolerance: f64,
    pub consecutive_incorrect: u32,
    pub recoveries_in_streak: u32,
    pub degraded_updates: u32,
    pub recent_outcomes: VecDeque<bool>,
}

impl StudentConceptState {
    pub fn new(student_id: &str, concept_id: &str, params: &MasteryParams) -> Self {
        Self {
            student_id: student_id.to_string(),
            concept_id: concept_id.to_string(),
            mastery: params.prior_mastery.clamp(MASTERY_FLOOR, MASTERY_CEILING),
            confidence: 0.0,
            practice_count: 0,
            correct_count: 0,
            incorrect_count: 0,
            last_interaction_ts: None,
            learn_rate_multiplier: 1.0,
            stress_tolerance: params.initial_stress_tolerance.clamp(0.0, 1.0),
            consecutive_incorrect: 0,
            recoveries_in_streak: 0,
            degraded_updates: 0,
            recent_outcomes: VecDeque::with_capacity(params.outcome_window),
        }
    }

    pub fn push_outcome(&mut self, correct: bool, window: usize) {
        self.recent_outcomes.push_back(correct);
        while self.recent_outcomes.len() > window {
            self.recent_outcomes.pop_front();
        }
    }

    pub fn recent_accuracy(&self) -> Option<f64> {
        if self.recent_outcomes.is_empty() {
            return None;
        }
        let hits = self.recent_outcomes.iter().filter(|c| **c).count();
        Some(hits as f64 / self.recent_outcomes.len() as f64)
    }

    /// Bernoulli variance of the recent window, 0 when empty.
    pub fn window_variance(&self) -> f64 {
        self.recent_accuracy().map(|p| p * (1.0 - p)).unwrap_or(0.0)
    }

    pub fn mastery_gap(&self) -> f64 {
        (1.0 - self.mastery).clamp(0.0, 1.0)
    }
}

/// Caller-provided context. Every factor is optional; absent factors are neutral.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextFactors {
    pub stress: Option<f64>,
    pub fatigue: Option<f64>,
    pub session_minutes: Option<f64>,
    pub device_multiplier: Option<f64>,
    pub network_multiplier: Option<f64>,
    pub distraction_multiplier: Option<f64>,
    pub interface_friction: Option<f64>,
    /// Segment labels (dimension → value) recorded for fairness monitoring.
    #[serde(default)]
    pub segments: BTreeMap<String, String>,
}

impl ContextFactors {
    pub fn stress_level(&self) -> f64 {
        self.stress.unwrap_or(0.0).clamp(0.0, 1.0)
    }

    pub fn fatigue_level(&self) -> f64 {
        self.fatigue.unwrap_or(0.0).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRequest {
    pub event_id: String,
    pub student_id: String,
    pub concept_id: String,
    pub question_id: String,
    pub correct: bool,
    pub response_time_secs: f64,
    #[serde(default)]
    pub context: ContextFactors,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    NumericalInstability,
    ModelUnavailable,
    LatencyBudgetExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMeta {
    pub temperature: f64,
    pub calibrated: bool,
}

impl Default for CalibrationMeta {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            calibrated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionResponse {
    pub decision_id: Uuid,
    pub event_id: String,
    pub previous_mastery: f64,
    pub new_mastery: f64,
    pub confidence: f64,
    pub recommended_time: f64,
    pub breakdown: TimeBreakdown,
    pub next_question_id: Option<String>,
    pub advisories: Vec<Advisory>,
    pub degraded: bool,
    pub degraded_reasons: Vec<DegradedReason>,
    pub predicted_correctness: f64,
    pub calibration: CalibrationMeta,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub stress: f64,
    pub fatigue: f64,
    pub total_load: f64,
    pub overload_risk: f64,
    pub device_multiplier: f64,
    pub network_multiplier: f64,
    pub distraction_multiplier: f64,
}

/// Append-only log record of one processed interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub event_id: String,
    pub student_id: String,
    pub concept_id: String,
    pub question_id: String,
    pub exam: String,
    pub subject: String,
    pub correct: bool,
    pub response_time_secs: f64,
    pub context: ContextSnapshot,
    pub segments: BTreeMap<String, String>,
    /// Uncalibrated predicted correctness before the update.
    pub predicted_correctness: f64,
    pub allocated_secs: f64,
    pub mastery_before: f64,
    pub mastery_after: f64,
    pub mastery_delta: f64,
    pub timestamp: DateTime<Utc>,
    pub response: InteractionResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_uses_configured_prior() {
        let params = MasteryParams {
            prior_mastery: 0.42,
            ..Default::default()
        };
        let state = StudentConceptState::new("s1", "c1", &params);
        assert!((state.mastery - 0.42).abs() < 1e-12);
        assert_eq!(state.practice_count, 0);
        assert!(state.recent_accuracy().is_none());
    }

    #[test]
    fn outcome_window_is_bounded() {
        let params = MasteryParams::default();
        let mut state = StudentConceptState::new("s1", "c1", &params);
        for i in 0..40 {
            state.push_outcome(i % 2 == 0, 15);
        }
        assert_eq!(state.recent_outcomes.len(), 15);
    }

    #[test]
    fn scoring_risk_is_bounded() {
        assert_eq!(ScoringScheme::Standard.risk(), 0.0);
        assert_eq!(ScoringScheme::NegativeMarking { penalty: 3.0 }.risk(), 1.0);
        assert!((ScoringScheme::NegativeMarking { penalty: 0.25 }.risk() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn bloom_level_normalizes() {
        let mut q = QuestionMetadata {
            question_id: "q".into(),
            concept_id: "c".into(),
            exam: "e".into(),
            subject: "s".into(),
            difficulty: 0.5,
            bloom_level: 1,
            estimated_solve_secs: 60.0,
            scoring_scheme: ScoringScheme::Standard,
            prerequisite_concepts: vec![],
        };
        assert_eq!(q.bloom_norm(), 0.0);
        q.bloom_level = 6;
        assert_eq!(q.bloom_norm(), 1.0);
    }
}
