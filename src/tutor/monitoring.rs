use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::tutor::config::{MASTERY_CEILING, MASTERY_FLOOR};
use crate::tutor::types::{InteractionResponse, StudentConceptState};

const MAX_RECENT_EVENTS: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantViolation {
    pub field: String,
    pub value: f64,
    pub expected_min: f64,
    pub expected_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringEvent {
    pub student_id: String,
    pub event_id: String,
    pub timestamp: i64,
    pub latency_ms: i64,
    pub is_anomaly: bool,
    pub degraded: bool,
    pub invariant_violations: Vec<InvariantViolation>,
    pub response: serde_json::Value,
}

/// Post-decision invariant checks. Anomalous and degraded decisions are always
/// kept; the rest are sampled.
pub struct TutorMonitor {
    sample_rate: f64,
    recent: Mutex<VecDeque<MonitoringEvent>>,
}

impl TutorMonitor {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate: sample_rate.clamp(0.0, 1.0),
            recent: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    pub fn from_env() -> Self {
        let sample_rate = std::env::var("TUTOR_MONITOR_SAMPLE_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.05);
        Self::new(sample_rate)
    }

    pub fn record_decision(
        &self,
        student_id: &str,
        before: &StudentConceptState,
        after: &StudentConceptState,
        response: &InteractionResponse,
        latency_ms: i64,
    ) -> Vec<InvariantViolation> {
        let violations = self.check_invariants(before, after, response);
        let is_anomaly = !violations.is_empty();

        if is_anomaly {
            for v in &violations {
                tracing::warn!(
                    student_id = %student_id,
                    event_id = %response.event_id,
                    field = %v.field,
                    value = %v.value,
                    expected = %format!("[{}, {}]", v.expected_min, v.expected_max),
                    "tutor invariant violation detected"
                );
            }
        }

        if self.should_sample(is_anomaly, response.degraded) {
            let event = MonitoringEvent {
                student_id: student_id.to_string(),
                event_id: response.event_id.clone(),
                timestamp: Utc::now().timestamp_millis(),
                latency_ms,
                is_anomaly,
                degraded: response.degraded,
                invariant_violations: violations.clone(),
                response: serde_json::to_value(response).unwrap_or_default(),
            };
            let mut recent = self.recent.lock();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_front();
            }
            recent.push_back(event);
        }
        violations
    }

    pub fn recent_events(&self) -> Vec<MonitoringEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn check_invariants(
        &self,
        before: &StudentConceptState,
        after: &StudentConceptState,
        response: &InteractionResponse,
    ) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        self.check_range(&mut violations, "new_mastery", response.new_mastery, MASTERY_FLOOR, MASTERY_CEILING);
        self.check_range(&mut violations, "confidence", response.confidence, 0.0, 1.0);
        self.check_range(
            &mut violations,
            "predicted_correctness",
            response.predicted_correctness,
            0.0,
            1.0,
        );
        self.check_range(
            &mut violations,
            "recommended_time",
            response.recommended_time,
            response.breakdown.min_secs,
            response.breakdown.max_secs,
        );
        self.check_range(
            &mut violations,
            "practice_count",
            f64::from(after.practice_count),
            f64::from(before.practice_count),
            f64::INFINITY,
        );

        self.check_nan_inf(&mut violations, "new_mastery", response.new_mastery);
        self.check_nan_inf(&mut violations, "confidence", response.confidence);
        self.check_nan_inf(&mut violations, "recommended_time", response.recommended_time);
        self.check_nan_inf(&mut violations, "calibration.temperature", response.calibration.temperature);

        violations
    }

    fn check_range(&self, violations: &mut Vec<InvariantViolation>, field: &str, value: f64, min: f64, max: f64) {
        if value < min || value > max {
            violations.push(InvariantViolation {
                field: field.to_string(),
                value,
                expected_min: min,
                expected_max: max,
            });
        }
    }

    fn check_nan_inf(&self, violations: &mut Vec<InvariantViolation>, field: &str, value: f64) {
        if !value.is_finite() {
            violations.push(InvariantViolation {
                field: field.to_string(),
                value,
                expected_min: f64::NEG_INFINITY,
                expected_max: f64::INFINITY,
            });
        }
    }

    fn should_sample(&self, is_anomaly: bool, degraded: bool) -> bool {
        if is_anomaly || degraded {
            return true;
        }
        rand::rng().random::<f64>() < self.sample_rate
    }
}

impl Default for TutorMonitor {
    fn default() -> Self {
        Self::new(0.05)
    }
}
