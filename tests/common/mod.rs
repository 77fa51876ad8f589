#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use adaptive_tutor_core::tutor::memory::AdaptationPolicy;
use adaptive_tutor_core::tutor::{
    Concept, ConceptGraph, ConceptGraphHandle, ContextFactors, InMemoryInteractionLog, InMemoryQuestionBank,
    InMemoryStateRepository, InteractionRequest, QuestionMetadata, TutorConfig, TutorEngine,
};

pub type TestEngine = TutorEngine<InMemoryStateRepository>;

pub const EXAM: &str = "jee";

pub struct Harness {
    pub engine: Arc<TestEngine>,
    pub repository: Arc<InMemoryStateRepository>,
    pub log: Arc<InMemoryInteractionLog>,
}

pub fn concept(id: &str, prerequisites: &[&str]) -> Concept {
    Concept {
        id: id.to_string(),
        subject: "math".to_string(),
        prerequisites: prerequisites.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        transfer_edges: vec![],
    }
}

pub fn question(id: &str, concept_id: &str, difficulty: f64) -> QuestionMetadata {
    QuestionMetadata {
        question_id: id.to_string(),
        concept_id: concept_id.to_string(),
        exam: EXAM.to_string(),
        subject: "math".to_string(),
        difficulty,
        bloom_level: 3,
        estimated_solve_secs: 60.0,
        scoring_scheme: Default::default(),
        prerequisite_concepts: vec![],
    }
}

/// algebra → calculus, plus an independent geometry concept.
pub fn sample_graph() -> ConceptGraph {
    ConceptGraph::new(
        1,
        vec![concept("alg", &[]), concept("calc", &["alg"]), concept("geo", &[])],
    )
    .expect("fixture graph is valid")
}

pub fn sample_questions() -> Vec<QuestionMetadata> {
    vec![
        question("q-alg-1", "alg", 0.4),
        question("q-alg-2", "alg", 0.6),
        question("q-calc-1", "calc", 0.7),
        question("q-geo-1", "geo", 0.5),
    ]
}

/// Generous latency budget so slow CI hosts do not trip the fallback path.
pub fn test_config() -> TutorConfig {
    let mut config = TutorConfig::default();
    config.orchestrator.latency_budget_ms = 10_000;
    config.orchestrator.repository_timeout_ms = 1_000;
    config
}

pub fn harness_with(config: TutorConfig) -> Harness {
    build(config, None)
}

pub fn harness_with_policy(policy: Arc<dyn AdaptationPolicy>) -> Harness {
    build(test_config(), Some(policy))
}

fn build(config: TutorConfig, policy: Option<Arc<dyn AdaptationPolicy>>) -> Harness {
    let repository = Arc::new(InMemoryStateRepository::new());
    let log = Arc::new(InMemoryInteractionLog::new());
    let engine = TutorEngine::new(
        config,
        Arc::new(ConceptGraphHandle::new(sample_graph())),
        Arc::new(InMemoryQuestionBank::new(sample_questions())),
        Arc::clone(&repository),
        log.clone(),
    )
    .expect("engine builds");
    let engine = match policy {
        Some(policy) => engine.with_policy(policy),
        None => engine,
    };
    Harness {
        engine: Arc::new(engine),
        repository,
        log,
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn base_time() -> DateTime<Utc> {
    "2026-01-10T09:00:00Z".parse().expect("valid timestamp")
}

pub fn request(event_id: &str, student_id: &str, concept_id: &str, question_id: &str, correct: bool) -> InteractionRequest {
    InteractionRequest {
        event_id: event_id.to_string(),
        student_id: student_id.to_string(),
        concept_id: concept_id.to_string(),
        question_id: question_id.to_string(),
        correct,
        response_time_secs: 45.0,
        context: ContextFactors::default(),
        timestamp: Some(base_time()),
    }
}
