//! Read-only disparity monitoring over the interaction log.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::tutor::config::FairnessConfig;
use crate::tutor::types::Interaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairnessMetric {
    Accuracy,
    AllocatedTime,
    MasteryGrowth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTier {
    None,
    Low,
    Medium,
    High,
}

pub fn alert_tier(disparity: f64, config: &FairnessConfig) -> AlertTier {
    if disparity > config.high_threshold {
        AlertTier::High
    } else if disparity > config.medium_threshold {
        AlertTier::Medium
    } else if disparity > config.low_threshold {
        AlertTier::Low
    } else {
        AlertTier::None
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RunningMean {
    count: usize,
    mean: f64,
}

impl RunningMean {
    fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }
}

#[derive(Debug, Default)]
struct SegmentAccumulator {
    accuracy: RunningMean,
    allocated: RunningMean,
    growth: RunningMean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessSegmentStats {
    pub dimension: String,
    pub segment: String,
    pub sample_count: usize,
    pub avg_accuracy: f64,
    pub avg_allocated_secs: f64,
    pub avg_mastery_growth: f64,
    /// False when below `min_segment_size`; such segments never drive alerts.
    pub sufficient: bool,
}

impl FairnessSegmentStats {
    pub fn key(&self) -> String {
        format!("{}={}", self.dimension, self.segment)
    }

    fn value(&self, metric: FairnessMetric) -> f64 {
        match metric {
            FairnessMetric::Accuracy => self.avg_accuracy,
            FairnessMetric::AllocatedTime => self.avg_allocated_secs,
            FairnessMetric::MasteryGrowth => self.avg_mastery_growth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisparityFinding {
    pub dimension: String,
    pub metric: FairnessMetric,
    pub disparity: f64,
    pub max_segment: String,
    pub min_segment: String,
    pub tier: AlertTier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FairnessReport {
    pub generated_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub interactions: usize,
    pub segments: Vec<FairnessSegmentStats>,
    pub findings: Vec<DisparityFinding>,
    pub overall: AlertTier,
}

#[derive(Debug, Clone)]
pub struct FairnessMonitor {
    config: FairnessConfig,
}

impl FairnessMonitor {
    pub fn new(config: FairnessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FairnessConfig {
        &self.config
    }

    pub fn compute_fairness_report<'a, I>(&self, interactions: I, window_start: DateTime<Utc>) -> FairnessReport
    where
        I: IntoIterator<Item = &'a Interaction>,
    {
        let mut groups: BTreeMap<(String, String), SegmentAccumulator> = BTreeMap::new();
        let mut overall_allocated = RunningMean::default();
        let mut total = 0usize;

        for interaction in interactions {
            if interaction.timestamp < window_start {
                continue;
            }
            total += 1;
            overall_allocated.push(interaction.allocated_secs);
            for (dimension, segment) in &interaction.segments {
                let acc = groups.entry((dimension.clone(), segment.clone())).or_default();
                acc.accuracy.push(if interaction.correct { 1.0 } else { 0.0 });
                acc.allocated.push(interaction.allocated_secs);
                acc.growth.push(interaction.mastery_delta);
            }
        }

        let segments: Vec<FairnessSegmentStats> = groups
            .into_iter()
            .map(|((dimension, segment), acc)| FairnessSegmentStats {
                dimension,
                segment,
                sample_count: acc.accuracy.count,
                avg_accuracy: acc.accuracy.mean,
                avg_allocated_secs: acc.allocated.mean,
                avg_mastery_growth: acc.growth.mean,
                sufficient: acc.accuracy.count >= self.config.min_segment_size,
            })
            .collect();

        let findings = self.findings(&segments, overall_allocated.mean);
        let overall = findings.iter().map(|f| f.tier).max().unwrap_or(AlertTier::None);

        FairnessReport {
            generated_at: Utc::now(),
            window_start,
            interactions: total,
            segments,
            findings,
            overall,
        }
    }

    fn findings(&self, segments: &[FairnessSegmentStats], overall_allocated: f64) -> Vec<DisparityFinding> {
        let mut by_dimension: BTreeMap<&str, Vec<&FairnessSegmentStats>> = BTreeMap::new();
        for stats in segments {
            by_dimension.entry(stats.dimension.as_str()).or_default().push(stats);
        }

        let mut findings = Vec::new();
        for (dimension, stats) in by_dimension {
            let eligible: Vec<&FairnessSegmentStats> = stats.into_iter().filter(|s| s.sufficient).collect();
            if eligible.len() < 2 {
                tracing::debug!(dimension, "insufficient data for disparity, dimension skipped");
                continue;
            }
            for metric in [
                FairnessMetric::Accuracy,
                FairnessMetric::AllocatedTime,
                FairnessMetric::MasteryGrowth,
            ] {
                let Some(max) = eligible.iter().max_by(|a, b| a.value(metric).total_cmp(&b.value(metric))) else {
                    continue;
                };
                let Some(min) = eligible.iter().min_by(|a, b| a.value(metric).total_cmp(&b.value(metric))) else {
                    continue;
                };
                let mut disparity = max.value(metric) - min.value(metric);
                if metric == FairnessMetric::AllocatedTime {
                    if overall_allocated <= 0.0 {
                        continue;
                    }
                    disparity /= overall_allocated;
                }
                let tier = alert_tier(disparity, &self.config);
                if tier != AlertTier::None {
                    tracing::warn!(
                        dimension,
                        metric = ?metric,
                        disparity,
                        tier = ?tier,
                        max_segment = %max.segment,
                        min_segment = %min.segment,
                        "fairness disparity detected"
                    );
                }
                findings.push(DisparityFinding {
                    dimension: dimension.to_string(),
                    metric,
                    disparity,
                    max_segment: max.segment.clone(),
                    min_segment: min.segment.clone(),
                    tier,
                });
            }
        }
        findings
    }
}

/// Latest published report, read without waiting on the batch job.
#[derive(Debug, Default)]
pub struct FairnessReportHandle {
    latest: RwLock<Option<Arc<FairnessReport>>>,
}

impl FairnessReportHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Arc<FairnessReport>> {
        self.latest.read().clone()
    }

    pub fn publish(&self, report: FairnessReport) {
        *self.latest.write() = Some(Arc::new(report));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tutor::types::{CalibrationMeta, ContextSnapshot, InteractionResponse};
    use crate::tutor::modeling::TimeBreakdown;
    use chrono::Duration;
    use uuid::Uuid;

    fn interaction(i: usize, device: &str, correct: bool, allocated: f64, ts: DateTime<Utc>) -> Interaction {
        let breakdown = TimeBreakdown {
            base_secs: allocated,
            stress_factor: 1.0,
            fatigue_factor: 1.0,
            mastery_factor: 1.0,
            difficulty_factor: 1.0,
            raw_secs: allocated,
            allocated_secs: allocated,
            min_secs: 0.0,
            max_secs: 1000.0,
            capped: false,
        };
        Interaction {
            event_id: format!("e{i}"),
            student_id: format!("s{i}"),
            concept_id: "c".into(),
            question_id: "q".into(),
            exam: "jee".into(),
            subject: "math".into(),
            correct,
            response_time_secs: 30.0,
            context: ContextSnapshot {
                stress: 0.0,
                fatigue: 0.0,
                total_load: 1.0,
                overload_risk: 0.3,
                device_multiplier: 1.0,
                network_multiplier: 1.0,
                distraction_multiplier: 1.0,
            },
            segments: [("device".to_string(), device.to_string())].into_iter().collect(),
            predicted_correctness: 0.5,
            allocated_secs: allocated,
            mastery_before: 0.4,
            mastery_after: 0.45,
            mastery_delta: 0.05,
            timestamp: ts,
            response: InteractionResponse {
                decision_id: Uuid::new_v4(),
                event_id: format!("e{i}"),
                previous_mastery: 0.4,
                new_mastery: 0.45,
                confidence: 0.2,
                recommended_time: allocated,
                breakdown,
                next_question_id: None,
                advisories: vec![],
                degraded: false,
                degraded_reasons: vec![],
                predicted_correctness: 0.5,
                calibration: CalibrationMeta::default(),
                replayed: false,
            },
        }
    }

    fn population(device: &str, n: usize, correct: usize, allocated: f64, offset: usize) -> Vec<Interaction> {
        let now = Utc::now();
        (0..n)
            .map(|i| interaction(offset + i, device, i < correct, allocated, now))
            .collect()
    }

    #[test]
    fn accuracy_gap_of_twenty_points_is_high_tier() {
        let mut log = population("mobile", 40, 30, 60.0, 0);
        log.extend(population("desktop", 40, 22, 60.0, 100));
        let monitor = FairnessMonitor::new(FairnessConfig::default());
        let report = monitor.compute_fairness_report(&log, Utc::now() - Duration::days(1));

        let accuracy = report
            .findings
            .iter()
            .find(|f| f.metric == FairnessMetric::Accuracy)
            .unwrap();
        assert!((accuracy.disparity - 0.20).abs() < 1e-9);
        assert_eq!(accuracy.tier, AlertTier::High);
        assert_eq!(accuracy.max_segment, "mobile");
        assert_eq!(report.overall, AlertTier::High);
    }

    #[test]
    fn tiers_follow_thresholds() {
        let config = FairnessConfig::default();
        assert_eq!(alert_tier(0.04, &config), AlertTier::None);
        assert_eq!(alert_tier(0.07, &config), AlertTier::Low);
        assert_eq!(alert_tier(0.12, &config), AlertTier::Medium);
        assert_eq!(alert_tier(0.16, &config), AlertTier::High);
    }

    #[test]
    fn small_segments_are_reported_but_not_alerted() {
        let mut log = population("mobile", 40, 40, 60.0, 0);
        log.extend(population("tablet", 5, 0, 60.0, 100));
        let monitor = FairnessMonitor::new(FairnessConfig::default());
        let report = monitor.compute_fairness_report(&log, Utc::now() - Duration::days(1));
        assert_eq!(report.segments.len(), 2);
        assert!(report.segments.iter().any(|s| s.segment == "tablet" && !s.sufficient));
        assert!(report.findings.is_empty());
        assert_eq!(report.overall, AlertTier::None);
    }

    #[test]
    fn time_disparity_is_relative_to_overall_mean() {
        let mut log = population("mobile", 40, 20, 66.0, 0);
        log.extend(population("desktop", 40, 20, 54.0, 100));
        let monitor = FairnessMonitor::new(FairnessConfig::default());
        let report = monitor.compute_fairness_report(&log, Utc::now() - Duration::days(1));
        let time = report
            .findings
            .iter()
            .find(|f| f.metric == FairnessMetric::AllocatedTime)
            .unwrap();
        assert!((time.disparity - 0.2).abs() < 1e-9);
    }

    #[test]
    fn interactions_outside_window_are_ignored() {
        let old = Utc::now() - Duration::days(90);
        let log: Vec<Interaction> = (0..40).map(|i| interaction(i, "mobile", true, 60.0, old)).collect();
        let monitor = FairnessMonitor::new(FairnessConfig::default());
        let report = monitor.compute_fairness_report(&log, Utc::now() - Duration::days(30));
        assert_eq!(report.interactions, 0);
        assert!(report.segments.is_empty());
    }

    #[test]
    fn handle_publishes_latest_report() {
        let handle = FairnessReportHandle::new();
        assert!(handle.latest().is_none());
        let monitor = FairnessMonitor::new(FairnessConfig::default());
        handle.publish(monitor.compute_fairness_report(std::iter::empty::<&Interaction>(), Utc::now()));
        assert_eq!(handle.latest().unwrap().interactions, 0);
    }
}
