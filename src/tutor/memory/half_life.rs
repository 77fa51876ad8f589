//! Half-life regression review scheduler.
//!
//! `h = base · 2^(θ·x)` with `x = [1, difficulty, ability, √successes, √failures]`,
//! in days. A concept is due once `now ≥ last_seen + h · spacing_multiplier`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::tutor::config::HalfLifeParams;
use crate::tutor::types::StudentConceptState;

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewStatus {
    pub concept_id: String,
    pub half_life_days: f64,
    pub next_review: DateTime<Utc>,
    /// `2^(−Δ/h)` at evaluation time.
    pub predicted_recall: f64,
    /// Elapsed time over scheduled interval; ≥ 1 means due.
    pub overdue_ratio: f64,
    pub due: bool,
}

#[derive(Debug, Clone)]
pub struct HalfLifeScheduler {
    params: HalfLifeParams,
}

impl HalfLifeScheduler {
    pub fn new(params: HalfLifeParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &HalfLifeParams {
        &self.params
    }

    pub fn half_life_days(&self, difficulty: f64, ability: f64, successes: u32, failures: u32) -> f64 {
        let x = [
            1.0,
            difficulty.clamp(0.0, 1.0),
            ability.clamp(0.0, 1.0),
            f64::from(successes).sqrt(),
            f64::from(failures).sqrt(),
        ];
        let dot: f64 = self.params.theta.iter().zip(x.iter()).map(|(t, v)| t * v).sum();
        let h = self.params.base_half_life_days * 2f64.powf(dot);
        if !h.is_finite() {
            return self.params.max_half_life_days;
        }
        h.clamp(self.params.min_half_life_days, self.params.max_half_life_days)
    }

    pub fn next_review(&self, last_seen: DateTime<Utc>, half_life_days: f64) -> DateTime<Utc> {
        let secs = half_life_days * self.params.spacing_multiplier * SECONDS_PER_DAY;
        last_seen + Duration::seconds(secs.round() as i64)
    }

    pub fn predicted_recall(elapsed_days: f64, half_life_days: f64) -> f64 {
        if half_life_days <= 0.0 {
            return 0.0;
        }
        2f64.powf(-elapsed_days.max(0.0) / half_life_days)
    }

    /// `None` for concepts never seen.
    pub fn review_status(
        &self,
        state: &StudentConceptState,
        difficulty: f64,
        now: DateTime<Utc>,
    ) -> Option<ReviewStatus> {
        let last_seen = state.last_interaction_ts?;
        let h = self.half_life_days(difficulty, state.mastery, state.correct_count, state.incorrect_count);
        let elapsed_days = (now - last_seen).num_seconds().max(0) as f64 / SECONDS_PER_DAY;
        let interval = h * self.params.spacing_multiplier;
        let overdue_ratio = if interval > 0.0 { elapsed_days / interval } else { 0.0 };
        Some(ReviewStatus {
            concept_id: state.concept_id.clone(),
            half_life_days: h,
            next_review: self.next_review(last_seen, h),
            predicted_recall: Self::predicted_recall(elapsed_days, h),
            overdue_ratio,
            due: overdue_ratio >= 1.0,
        })
    }

    /// Past-due concepts, most overdue first, capped at `max_due`.
    pub fn due_concepts<'a, I, F>(&self, states: I, difficulty_of: F, now: DateTime<Utc>) -> Vec<ReviewStatus>
    where
        I: IntoIterator<Item = &'a StudentConceptState>,
        F: Fn(&str) -> f64,
    {
        let mut due: Vec<ReviewStatus> = states
            .into_iter()
            .filter_map(|s| self.review_status(s, difficulty_of(&s.concept_id), now))
            .filter(|r| r.due)
            .collect();
        due.sort_by(|a, b| b.overdue_ratio.total_cmp(&a.overdue_ratio));
        due.truncate(self.params.max_due);
        due
    }
}
