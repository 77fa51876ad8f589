//! Property-based tests for the numerical core.
//!
//! - BKT steps stay inside the probability range
//! - a correct answer never lowers the posterior, an incorrect one never raises it
//! - confidence grows with evidence
//! - full mastery updates stay within the mastery bounds and count every response
//! - allocated time always respects the exam bounds
//! - temperature scaling preserves ordering

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use adaptive_tutor_core::tutor::calibration::apply_temperature;
use adaptive_tutor_core::tutor::config::{
    AdjustmentBounds, ExamTimeProfile, MasteryParams, TimeParams, MASTERY_CEILING, MASTERY_FLOOR,
};
use adaptive_tutor_core::tutor::memory::{
    bkt_update, BktParams, MasteryEstimator, MasteryInput, ParameterAdjustment, StreakRecoveryPolicy,
};
use adaptive_tutor_core::tutor::modeling::{TimeAllocator, TimeFactors};
use adaptive_tutor_core::tutor::{Concept, ConceptGraph, TransferEdge, TransferKind};

fn arb_probability() -> impl Strategy<Value = f64> {
    (1u64..=999u64).prop_map(|v| v as f64 / 1000.0)
}

fn arb_params() -> impl Strategy<Value = BktParams> {
    (0.01f64..0.3, 0.01f64..0.3, 0.0f64..0.5).prop_map(|(slip, guess, learn)| BktParams::new(slip, guess, learn))
}

fn arb_factor() -> impl Strategy<Value = Option<f64>> {
    proptest::option::of(0.2f64..3.0)
}

/// `target` gains transfer from a well-mastered `neighbour`.
fn transfer_graph(strength: f64) -> ConceptGraph {
    ConceptGraph::new(
        1,
        vec![
            Concept {
                id: "target".into(),
                subject: "math".into(),
                prerequisites: Default::default(),
                transfer_edges: vec![TransferEdge {
                    target_concept: "neighbour".into(),
                    strength,
                    kind: TransferKind::PrerequisiteOf,
                }],
            },
            Concept {
                id: "neighbour".into(),
                subject: "math".into(),
                prerequisites: Default::default(),
                transfer_edges: vec![],
            },
        ],
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn bkt_step_stays_in_unit_interval(prior in arb_probability(), params in arb_params(), correct in any::<bool>()) {
        let step = bkt_update(prior, &params, correct, 1e-9);
        prop_assert!(!step.degraded);
        prop_assert!(step.posterior > 0.0 && step.posterior < 1.0);
        prop_assert!(step.learned >= step.posterior);
        prop_assert!(step.learned <= 1.0);
    }

    #[test]
    fn evidence_moves_posterior_in_the_right_direction(prior in arb_probability(), params in arb_params()) {
        let up = bkt_update(prior, &params, true, 1e-9);
        let down = bkt_update(prior, &params, false, 1e-9);
        prop_assert!(up.posterior >= prior - 1e-12);
        prop_assert!(down.posterior <= prior + 1e-12);
    }

    #[test]
    fn confidence_is_monotone_in_practice(count in 0u32..200, variance in 0.0f64..0.25) {
        let estimator = MasteryEstimator::new(
            MasteryParams::default(),
            Default::default(),
            std::sync::Arc::new(StreakRecoveryPolicy::default()),
        );
        let now = estimator.confidence(count, variance);
        let later = estimator.confidence(count + 1, variance);
        prop_assert!((0.0..=1.0).contains(&now));
        prop_assert!(later >= now);
    }

    #[test]
    fn allocated_time_respects_profile(
        base in 1.0f64..600.0,
        stress in arb_factor(),
        fatigue in arb_factor(),
        mastery in arb_factor(),
        difficulty in arb_factor(),
    ) {
        let allocator = TimeAllocator::new(TimeParams::default());
        let profile = ExamTimeProfile { min_secs: 15.0, max_secs: 180.0 };
        let factors = TimeFactors { stress, fatigue, mastery, difficulty };
        let breakdown = allocator.allocate(base, &factors, profile);
        prop_assert!(breakdown.allocated_secs >= 15.0);
        prop_assert!(breakdown.allocated_secs <= 180.0);
        prop_assert_eq!(breakdown.capped, breakdown.allocated_secs != breakdown.raw_secs);
    }

    #[test]
    fn temperature_preserves_ranking(a in arb_probability(), b in arb_probability(), t in 0.1f64..10.0) {
        prop_assume!(a < b);
        let (ca, cb) = (apply_temperature(a, t), apply_temperature(b, t));
        prop_assert!(ca <= cb);
        prop_assert!((0.0..=1.0).contains(&ca) && (0.0..=1.0).contains(&cb));
    }

    #[test]
    fn stacked_update_stays_bounded_and_counts_practice(
        prior in arb_probability(),
        elapsed_days in 0.0f64..60.0,
        practice in 0u32..10,
        streak in 0u32..6,
        recoveries in 0u32..3,
        neighbour in 0.71f64..1.0,
        strength in 0.0f64..1.0,
        slip_multiplier in 0.5f64..3.0,
        learn_multiplier in 0.5f64..3.0,
        outcomes in proptest::collection::vec(any::<bool>(), 1..12),
    ) {
        let estimator = MasteryEstimator::new(
            MasteryParams::default(),
            AdjustmentBounds::default(),
            Arc::new(StreakRecoveryPolicy::default()),
        );
        let graph = transfer_graph(strength);
        let mut related = HashMap::new();
        let mut neighbour_state = estimator.initial_state("s1", "neighbour");
        neighbour_state.mastery = neighbour;
        related.insert("neighbour".to_string(), neighbour_state);

        let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let mut state = estimator.initial_state("s1", "target");
        state.mastery = prior;
        state.practice_count = practice + streak;
        state.incorrect_count = streak;
        state.consecutive_incorrect = streak;
        state.recoveries_in_streak = recoveries.min(streak);
        state.last_interaction_ts = Some(start);

        let mut now = start + Duration::milliseconds((elapsed_days * 86_400_000.0) as i64);
        for correct in outcomes {
            let update = estimator
                .update(
                    &state,
                    &MasteryInput {
                        graph: &graph,
                        related: &related,
                        correct,
                        adjustment: ParameterAdjustment { slip_multiplier, learn_multiplier },
                        stress: 0.0,
                        now,
                    },
                )
                .unwrap();
            prop_assert!(update.new_mastery >= MASTERY_FLOOR && update.new_mastery <= MASTERY_CEILING);
            prop_assert!(update.recovery_boost <= 0.35);
            prop_assert!((0.0..=1.0).contains(&update.confidence));
            prop_assert_eq!(update.state.practice_count, state.practice_count + 1);
            prop_assert!(update.state.confidence >= 0.0);
            state = update.state;
            now += Duration::minutes(3);
        }
    }
}
