use std::collections::{HashMap, HashSet};

use crate::error::TutorError;
use crate::tutor::calibration::CalibrationProfile;
use crate::tutor::config::{MasteryParams, SelectorConfig, TimeParams};
use crate::tutor::decision::heuristic::HeuristicSelector;
use crate::tutor::decision::linucb::{FeatureSchema, LinUcbModel, FEATURE_DIM};
use crate::tutor::graph::ConceptGraph;
use crate::tutor::memory::{CorrectnessPredictor, ReviewStatus};
use crate::tutor::types::{DegradedReason, QuestionMetadata, StudentConceptState};

/// Signals shared by every candidate of one decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSignals {
    pub stress: f64,
    pub cognitive_load: f64,
}

pub struct SelectionInput<'a> {
    pub student_id: &'a str,
    pub graph: &'a ConceptGraph,
    /// The student's concept states, already including this interaction's update.
    pub states: &'a HashMap<String, StudentConceptState>,
    pub pool: &'a [QuestionMetadata],
    pub exclude_question_id: &'a str,
    pub due: &'a [ReviewStatus],
    pub signals: SessionSignals,
    pub predictor: &'a dyn CorrectnessPredictor,
    pub calibration: &'a HashMap<(String, String), CalibrationProfile>,
}

#[derive(Debug, Clone)]
pub struct Candidate<'q> {
    pub question: &'q QuestionMetadata,
    pub mastery: f64,
    pub mastery_gap: f64,
    pub review_due: bool,
    /// Calibrated probability of a correct answer.
    pub predicted_correctness: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub question_id: Option<String>,
    pub features: Option<Vec<f64>>,
    pub ucb: Option<f64>,
    pub from_review: bool,
    pub degraded_reason: Option<DegradedReason>,
}

impl Selection {
    pub fn none(degraded_reason: Option<DegradedReason>) -> Self {
        Self {
            question_id: None,
            features: None,
            ucb: None,
            from_review: false,
            degraded_reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuestionSelector {
    config: SelectorConfig,
    time: TimeParams,
    mastery: MasteryParams,
    heuristic: HeuristicSelector,
}

impl QuestionSelector {
    pub fn new(config: SelectorConfig, time: TimeParams, mastery: MasteryParams) -> Self {
        Self {
            config,
            time,
            mastery,
            heuristic: HeuristicSelector::new(),
        }
    }

    fn state_for(&self, input: &SelectionInput<'_>, concept_id: &str) -> StudentConceptState {
        input
            .states
            .get(concept_id)
            .cloned()
            .unwrap_or_else(|| StudentConceptState::new(input.student_id, concept_id, &self.mastery))
    }

    fn mastery_of(&self, input: &SelectionInput<'_>, concept_id: &str) -> f64 {
        input
            .states
            .get(concept_id)
            .map(|s| s.mastery)
            .unwrap_or(self.mastery.prior_mastery)
    }

    /// Every prerequisite (graph and question-level) must meet the gate.
    pub fn is_unlocked(&self, input: &SelectionInput<'_>, question: &QuestionMetadata) -> bool {
        input
            .graph
            .prerequisites(&question.concept_id)
            .chain(question.prerequisite_concepts.iter().map(String::as_str))
            .all(|prereq| self.mastery_of(input, prereq) >= self.config.prerequisite_gate)
    }

    pub fn calibrated_correctness(
        &self,
        input: &SelectionInput<'_>,
        question: &QuestionMetadata,
        state: &StudentConceptState,
    ) -> f64 {
        let raw = input.predictor.predict_correctness(state, question);
        input
            .calibration
            .get(&(question.exam.clone(), question.subject.clone()))
            .map(|profile| profile.apply(raw))
            .unwrap_or(raw)
    }

    /// Eligible candidates in priority order (due reviews, then largest
    /// mastery gap, then question id), bounded by `max_candidates`.
    pub fn candidates<'q>(&self, input: &SelectionInput<'q>) -> Vec<Candidate<'q>> {
        let due: HashSet<&str> = input.due.iter().map(|r| r.concept_id.as_str()).collect();
        let mut candidates: Vec<Candidate<'q>> = input
            .pool
            .iter()
            .filter(|q| q.question_id != input.exclude_question_id)
            .filter(|q| input.graph.contains(&q.concept_id))
            .filter(|q| self.is_unlocked(input, q))
            .map(|q| {
                let state = self.state_for(input, &q.concept_id);
                Candidate {
                    question: q,
                    mastery: state.mastery,
                    mastery_gap: state.mastery_gap(),
                    review_due: due.contains(q.concept_id.as_str()),
                    predicted_correctness: self.calibrated_correctness(input, q, &state),
                }
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.review_due
                .cmp(&a.review_due)
                .then(b.mastery_gap.total_cmp(&a.mastery_gap))
                .then_with(|| a.question.question_id.cmp(&b.question.question_id))
        });
        candidates.truncate(self.config.max_candidates.max(1));
        candidates
    }

    /// Context vector in `FEATURE_NAMES` order.
    pub fn features(&self, candidate: &Candidate<'_>, signals: SessionSignals) -> Vec<f64> {
        let q = candidate.question;
        let profile = self.time.profile_for(&q.exam);
        let time_pressure = if profile.max_secs > 0.0 {
            (q.estimated_solve_secs / profile.max_secs).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let features = vec![
            1.0,
            q.difficulty.clamp(0.0, 1.0),
            candidate.mastery_gap,
            signals.stress.clamp(0.0, 1.0),
            signals.cognitive_load.clamp(0.0, 1.0),
            q.scoring_scheme.risk(),
            time_pressure,
            candidate.predicted_correctness.clamp(0.0, 1.0),
            if candidate.review_due { 1.0 } else { 0.0 },
        ];
        debug_assert_eq!(features.len(), FEATURE_DIM);
        features
    }

    pub fn select(&self, model: &LinUcbModel, input: &SelectionInput<'_>) -> Selection {
        let candidates = self.candidates(input);
        if candidates.is_empty() {
            tracing::debug!(student_id = %input.student_id, "no eligible candidates after gating");
            return Selection::none(None);
        }
        match self.select_ucb(model, &candidates, input.signals) {
            Ok(selection) => selection,
            Err(err) => {
                tracing::warn!(student_id = %input.student_id, error = %err, "bandit unavailable, using heuristic selector");
                let reason = match err {
                    TutorError::NumericalInstability(_) => DegradedReason::NumericalInstability,
                    _ => DegradedReason::ModelUnavailable,
                };
                self.pick_heuristic(&candidates, input.signals, reason)
            }
        }
    }

    fn select_ucb(
        &self,
        model: &LinUcbModel,
        candidates: &[Candidate<'_>],
        signals: SessionSignals,
    ) -> Result<Selection, TutorError> {
        let expected = FeatureSchema::current();
        if model.schema() != &expected {
            return Err(TutorError::ModelUnavailable(format!(
                "model schema {} does not match {}",
                model.schema().id(),
                expected.id()
            )));
        }
        let scorer = model.scorer()?;
        let mut best: Option<(f64, &Candidate<'_>, Vec<f64>)> = None;
        for candidate in candidates {
            let x = self.features(candidate, signals);
            let mut score = scorer.score(&x)?.ucb;
            if candidate.review_due {
                score += self.config.review_priority_bonus;
            }
            if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                best = Some((score, candidate, x));
            }
        }
        Ok(match best {
            Some((score, candidate, x)) => Selection {
                question_id: Some(candidate.question.question_id.clone()),
                features: Some(x),
                ucb: Some(score),
                from_review: candidate.review_due,
                degraded_reason: None,
            },
            None => Selection::none(None),
        })
    }

    /// Heuristic choice over already-gated candidates, flagged degraded.
    pub fn pick_heuristic(&self, candidates: &[Candidate<'_>], signals: SessionSignals, reason: DegradedReason) -> Selection {
        match self.heuristic.pick(candidates) {
            Some(candidate) => Selection {
                question_id: Some(candidate.question.question_id.clone()),
                features: Some(self.features(candidate, signals)),
                ucb: None,
                from_review: candidate.review_due,
                degraded_reason: Some(reason),
            },
            None => Selection::none(Some(reason)),
        }
    }

    pub fn fallback(&self, input: &SelectionInput<'_>, reason: DegradedReason) -> Selection {
        let candidates = self.candidates(input);
        self.pick_heuristic(&candidates, input.signals, reason)
    }
}
