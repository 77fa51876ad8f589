//! End-to-end tests for the interaction pipeline over the in-memory adapters.

mod common;

use std::sync::Arc;
use std::time::Duration;

use adaptive_tutor_core::tutor::config::RecoveryParams;
use adaptive_tutor_core::tutor::decision::{FeatureSchema, LinUcbModel};
use adaptive_tutor_core::tutor::memory::StreakRecoveryPolicy;
use adaptive_tutor_core::tutor::{BatchJobs, DegradedReason, InteractionLog, StudentStateRepository};

use common::*;

#[tokio::test]
async fn correct_answer_raises_mastery_and_offers_next_question() {
    let h = harness();
    let response = h
        .engine
        .process_interaction(request("e1", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap();

    assert!((response.previous_mastery - 0.3).abs() < 1e-12);
    assert!(response.new_mastery > response.previous_mastery);
    assert!(response.confidence > 0.0 && response.confidence <= 1.0);
    assert!(response.recommended_time >= response.breakdown.min_secs);
    assert!(response.recommended_time <= response.breakdown.max_secs);
    assert!((0.0..=1.0).contains(&response.predicted_correctness));
    assert!(!response.degraded);
    assert!(!response.replayed);

    let next = response.next_question_id.as_deref().unwrap();
    assert_ne!(next, "q-alg-1");

    let stored = h.repository.get_state("s1", "alg").await.unwrap().unwrap();
    assert_eq!(stored.practice_count, 1);
    assert_eq!(stored.correct_count, 1);
    assert!((stored.mastery - response.new_mastery).abs() < 1e-12);
    assert_eq!(h.log.len(), 1);
    assert_eq!(h.engine.active_locks(), 0);
}

#[tokio::test]
async fn duplicate_event_is_replayed_without_a_second_write() {
    let h = harness();
    let first = h
        .engine
        .process_interaction(request("dup", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap();
    let second = h
        .engine
        .process_interaction(request("dup", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap();

    assert!(second.replayed);
    assert_eq!(first.decision_id, second.decision_id);
    assert_eq!(first.new_mastery, second.new_mastery);
    assert_eq!(h.repository.writes(), 1);
    assert_eq!(h.log.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_apply_once() {
    let h = harness();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = Arc::clone(&h.engine);
        handles.push(tokio::spawn(async move {
            engine
                .process_interaction(request("same", "s1", "alg", "q-alg-1", false))
                .await
        }));
    }
    let mut fresh = 0;
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        if !response.replayed {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);
    assert_eq!(h.repository.writes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_to_one_concept_are_serialized() {
    let h = harness();
    let n = 16;
    let mut handles = Vec::new();
    for i in 0..n {
        let engine = Arc::clone(&h.engine);
        handles.push(tokio::spawn(async move {
            let mut req = request(&format!("evt-{i}"), "s1", "alg", "q-alg-1", i % 2 == 0);
            req.timestamp = Some(base_time() + chrono::Duration::seconds(i as i64));
            engine.process_interaction(req).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = h.repository.get_state("s1", "alg").await.unwrap().unwrap();
    assert_eq!(stored.practice_count, n);
    assert_eq!(stored.correct_count + stored.incorrect_count, n);
    assert_eq!(h.repository.writes(), u64::from(n));
    assert_eq!(h.engine.active_locks(), 0);
}

#[tokio::test]
async fn repository_outage_is_retryable_and_persists_nothing() {
    let h = harness();
    h.repository.set_available(false);

    let err = h
        .engine
        .process_interaction(request("e1", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.code(), "REPOSITORY_UNAVAILABLE");
    assert!(h.repository.is_empty());
    assert!(h.log.is_empty());
    assert_eq!(h.engine.bandit().pending_len(), 0);
}

#[tokio::test]
async fn slow_repository_times_out() {
    let mut config = test_config();
    config.orchestrator.repository_timeout_ms = 20;
    let h = harness_with(config);
    h.repository.set_latency(Some(Duration::from_millis(200)));

    let err = h
        .engine
        .process_interaction(request("e1", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(h.log.is_empty());

    h.repository.set_latency(None);
    let ok = h
        .engine
        .process_interaction(request("e1", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap();
    assert!(!ok.replayed);
}

#[tokio::test]
async fn failed_log_append_leaves_event_unapplied() {
    let h = harness();
    h.log.set_writable(false);

    let err = h
        .engine
        .process_interaction(request("dup", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.repository.writes(), 0);
    assert!(h.repository.is_empty());

    h.log.set_writable(true);
    let first = h
        .engine
        .process_interaction(request("dup", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap();
    let second = h
        .engine
        .process_interaction(request("dup", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.new_mastery, second.new_mastery);
    let stored = h.repository.get_state("s1", "alg").await.unwrap().unwrap();
    assert_eq!(stored.practice_count, 1);
    assert_eq!(h.repository.writes(), 1);
}

#[tokio::test]
async fn failed_state_write_withdraws_log_entry() {
    let h = harness();
    h.repository.set_writable(false);

    let err = h
        .engine
        .process_interaction(request("e1", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(h.log.is_empty());
    assert!(!h.log.contains("e1").unwrap());

    h.repository.set_writable(true);
    let retried = h
        .engine
        .process_interaction(request("e1", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap();
    assert!(!retried.replayed);
    assert_eq!(h.log.len(), 1);
    let stored = h.repository.get_state("s1", "alg").await.unwrap().unwrap();
    assert_eq!(stored.practice_count, 1);
}

#[tokio::test]
async fn invalid_requests_are_rejected_without_side_effects() {
    let h = harness();

    let unknown_concept = h
        .engine
        .process_interaction(request("e1", "s1", "topology", "q-alg-1", true))
        .await
        .unwrap_err();
    assert_eq!(unknown_concept.code(), "UNKNOWN_CONCEPT");

    let unknown_question = h
        .engine
        .process_interaction(request("e2", "s1", "alg", "q-missing", true))
        .await
        .unwrap_err();
    assert_eq!(unknown_question.code(), "UNKNOWN_QUESTION");

    let mismatch = h
        .engine
        .process_interaction(request("e3", "s1", "geo", "q-alg-1", true))
        .await
        .unwrap_err();
    assert_eq!(mismatch.code(), "CONCEPT_MISMATCH");

    let mut bad_stress = request("e4", "s1", "alg", "q-alg-1", true);
    bad_stress.context.stress = Some(2.0);
    let out_of_range = h.engine.process_interaction(bad_stress).await.unwrap_err();
    assert_eq!(out_of_range.code(), "OUT_OF_RANGE");

    for err in [&unknown_concept, &unknown_question, &mismatch, &out_of_range] {
        assert!(!err.is_retryable());
        assert!(err.is_surfaced());
    }
    assert!(h.repository.is_empty());
    assert!(h.log.is_empty());
}

#[tokio::test]
async fn locked_concepts_are_not_offered() {
    let h = harness();
    let response = h
        .engine
        .process_interaction(request("e1", "s1", "alg", "q-alg-1", false))
        .await
        .unwrap();

    assert!(response.new_mastery < 0.4);
    let next = response.next_question_id.as_deref().unwrap();
    assert_ne!(next, "q-calc-1");
    assert_ne!(next, "q-alg-1");
}

#[tokio::test]
async fn first_failure_on_new_concept_earns_bounded_recovery() {
    let with_recovery = harness();
    let mut no_boost = RecoveryParams::default();
    no_boost.base_boost = 0.0;
    let without = harness_with_policy(Arc::new(StreakRecoveryPolicy::new(no_boost, 0.25)));

    let mut responses = Vec::new();
    for engine in [&with_recovery.engine, &without.engine] {
        let first = request("e1", "s1", "geo", "q-geo-1", false);
        engine.process_interaction(first).await.unwrap();
        let mut second = request("e2", "s1", "geo", "q-geo-1", false);
        second.timestamp = Some(base_time() + chrono::Duration::minutes(5));
        responses.push(engine.process_interaction(second).await.unwrap());
    }

    let boost = responses[0].new_mastery - responses[1].new_mastery;
    assert!((boost - RecoveryParams::default().base_boost).abs() < 1e-9);
    assert!(boost <= 0.35);

    let stored = with_recovery.repository.get_state("s1", "geo").await.unwrap().unwrap();
    assert_eq!(stored.consecutive_incorrect, 2);
    assert_eq!(stored.recoveries_in_streak, 1);
}

#[tokio::test]
async fn corrupted_bandit_falls_back_to_largest_gap() {
    let h = harness();
    h.engine.bandit().replace(LinUcbModel::new(
        FeatureSchema { version: 1, dim: 3 },
        0.5,
        1.0,
    ));

    let response = h
        .engine
        .process_interaction(request("e1", "s1", "alg", "q-alg-1", true))
        .await
        .unwrap();

    assert!(response.degraded);
    assert!(response.degraded_reasons.contains(&DegradedReason::ModelUnavailable));
    // calc and geo share the prior gap; the smaller id wins the tie.
    assert_eq!(response.next_question_id.as_deref(), Some("q-calc-1"));
    assert_eq!(h.repository.writes(), 1);
}

#[tokio::test]
async fn restored_model_from_older_schema_keeps_serving() {
    let h = harness();
    h.engine
        .bandit()
        .replace(LinUcbModel::new(FeatureSchema { version: 0, dim: 7 }, 0.5, 1.0));
    assert_eq!(h.engine.bandit().snapshot().schema(), &FeatureSchema::current());

    for i in 0..5 {
        let response = h
            .engine
            .process_interaction(request(&format!("m-{i}"), &format!("s{i}"), "alg", "q-alg-1", true))
            .await
            .unwrap();
        assert!(!response.degraded, "{:?}", response.degraded_reasons);
    }

    assert_eq!(h.engine.merge_bandit(), 5);
    let model = h.engine.bandit().snapshot();
    assert_eq!(model.schema(), &FeatureSchema::current());
    assert_eq!(model.updates(), 5);
}

#[tokio::test]
async fn batch_jobs_publish_calibration_and_fairness() {
    let h = harness();
    for i in 0..60 {
        let mut req = request(&format!("b-{i}"), &format!("s{i}"), "alg", "q-alg-1", i % 3 != 0);
        req.timestamp = None;
        req.context
            .segments
            .insert("region".to_string(), if i % 2 == 0 { "urban" } else { "rural" }.to_string());
        h.engine.process_interaction(req).await.unwrap();
    }
    assert_eq!(h.log.window(chrono::Utc::now() - chrono::Duration::days(1)).unwrap().len(), 60);

    let profiles = h.engine.refit_calibration(chrono::Duration::days(30)).unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].sample_count, 60);
    let published = h.engine.calibration().lookup(EXAM, "math").unwrap();
    assert!(published.temperature > 0.0);

    let single = h.engine.fit_calibration(EXAM, "math", chrono::Duration::days(30)).unwrap();
    assert_eq!(single.sample_count, 60);
    let empty = h.engine.fit_calibration(EXAM, "physics", chrono::Duration::days(30)).unwrap();
    assert_eq!(empty.sample_count, 0);
    assert!(!empty.calibrated);
    assert_eq!(empty.temperature, 1.0);

    let report = h.engine.compute_fairness_report(chrono::Duration::days(30)).unwrap();
    assert_eq!(report.interactions, 60);
    assert!(report.segments.iter().any(|s| s.segment == "urban"));
    assert!(h.engine.fairness().latest().is_some());

    h.engine.merge_bandit();
    assert_eq!(h.engine.bandit().pending_len(), 0);
    assert!(h.engine.bandit().snapshot().updates() > 0);
}
