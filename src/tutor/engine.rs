//! Per-interaction orchestration.
//!
//! validate → key lock → replay check → batched state read → load → time →
//! mastery → calibration lookup → scheduler → selector → log → state write.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{TutorError, TutorResult, ValidationCode};
use crate::track_component;
use crate::tutor::calibration::{CalibrationProfile, CalibrationRegistry, TemperatureFitter, samples_by_profile};
use crate::tutor::config::TutorConfig;
use crate::tutor::decision::{
    BanditObservation, BanditStore, Candidate, QuestionSelector, Selection, SelectionInput, SessionSignals,
    FEATURE_SCHEMA_VERSION,
};
use crate::tutor::fairness::{FairnessMonitor, FairnessReport, FairnessReportHandle};
use crate::tutor::graph::{ConceptGraph, ConceptGraphHandle};
use crate::tutor::memory::{
    AdaptationPolicy, CorrectnessPredictor, HalfLifeScheduler, MasteryEstimator, MasteryInput, StreakRecoveryPolicy,
};
use crate::tutor::metrics::{registry, ComponentId};
use crate::tutor::modeling::{CognitiveLoadAssessor, TimeAllocator};
use crate::tutor::monitoring::TutorMonitor;
use crate::tutor::store::{InteractionLog, QuestionBank, StudentStateRepository};
use crate::tutor::types::{
    CalibrationMeta, ContextFactors, ContextSnapshot, DegradedReason, Interaction, InteractionRequest,
    InteractionResponse, QuestionMetadata, StudentConceptState,
};

type LockKey = (String, String);

/// Single-writer-per-(student, concept) async locks.
#[derive(Debug, Default)]
struct KeyedLocks {
    inner: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn acquire(&self, key: LockKey) -> KeyedLockEntry<'_> {
        let handle = Arc::clone(self.inner.lock().entry(key.clone()).or_default());
        KeyedLockEntry {
            locks: self,
            key,
            handle,
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Claim on one key's mutex. Dropping it, including when the owning future is
/// cancelled mid-wait, removes the map entry once no one else holds it.
struct KeyedLockEntry<'a> {
    locks: &'a KeyedLocks,
    key: LockKey,
    handle: Arc<tokio::sync::Mutex<()>>,
}

impl KeyedLockEntry<'_> {
    fn mutex(&self) -> &tokio::sync::Mutex<()> {
        &self.handle
    }
}

impl Drop for KeyedLockEntry<'_> {
    fn drop(&mut self) {
        let mut inner = self.locks.inner.lock();
        // Only the map and this entry reference the mutex.
        let idle = inner
            .get(&self.key)
            .is_some_and(|h| Arc::ptr_eq(h, &self.handle) && Arc::strong_count(h) == 2);
        if idle {
            inner.remove(&self.key);
        }
    }
}

/// Batch operations driven by the background workers.
pub trait BatchJobs: Send + Sync {
    /// Fits and publishes one (exam, subject) profile over the trailing window.
    fn fit_calibration(&self, exam: &str, subject: &str, window: chrono::Duration) -> TutorResult<CalibrationProfile>;
    fn refit_calibration(&self, window: chrono::Duration) -> TutorResult<Vec<CalibrationProfile>>;
    fn compute_fairness_report(&self, window: chrono::Duration) -> TutorResult<FairnessReport>;
    fn merge_bandit(&self) -> usize;
}

pub struct TutorEngine<R: StudentStateRepository> {
    config: TutorConfig,
    graph: Arc<ConceptGraphHandle>,
    questions: Arc<dyn QuestionBank>,
    repository: Arc<R>,
    log: Arc<dyn InteractionLog>,
    calibration: Arc<CalibrationRegistry>,
    bandit: Arc<BanditStore>,
    fairness: Arc<FairnessReportHandle>,
    estimator: MasteryEstimator,
    predictor: Arc<dyn CorrectnessPredictor>,
    load: CognitiveLoadAssessor,
    time: TimeAllocator,
    scheduler: HalfLifeScheduler,
    selector: QuestionSelector,
    fitter: TemperatureFitter,
    fairness_monitor: FairnessMonitor,
    monitor: TutorMonitor,
    locks: KeyedLocks,
}

impl<R: StudentStateRepository> TutorEngine<R> {
    pub fn new(
        config: TutorConfig,
        graph: Arc<ConceptGraphHandle>,
        questions: Arc<dyn QuestionBank>,
        repository: Arc<R>,
        log: Arc<dyn InteractionLog>,
    ) -> TutorResult<Self> {
        config.validate()?;
        let policy: Arc<dyn AdaptationPolicy> = Arc::new(StreakRecoveryPolicy::new(
            config.recovery.clone(),
            config.time.fatigue_gain,
        ));
        let estimator = MasteryEstimator::new(config.mastery.clone(), config.adjustment.clone(), policy);
        Ok(Self {
            graph,
            questions,
            repository,
            log,
            calibration: Arc::new(CalibrationRegistry::new()),
            bandit: Arc::new(BanditStore::new(config.bandit.clone())),
            fairness: Arc::new(FairnessReportHandle::new()),
            predictor: Arc::new(estimator.clone()),
            estimator,
            load: CognitiveLoadAssessor::new(config.load.clone(), config.adjustment.clone()),
            time: TimeAllocator::new(config.time.clone()),
            scheduler: HalfLifeScheduler::new(config.scheduler.clone()),
            selector: QuestionSelector::new(config.selector.clone(), config.time.clone(), config.mastery.clone()),
            fitter: TemperatureFitter::new(config.calibration.clone()),
            fairness_monitor: FairnessMonitor::new(config.fairness.clone()),
            monitor: TutorMonitor::from_env(),
            locks: KeyedLocks::default(),
            config,
        })
    }

    /// Swaps the recovery/learning-rate policy.
    pub fn with_policy(mut self, policy: Arc<dyn AdaptationPolicy>) -> Self {
        self.estimator = MasteryEstimator::new(
            self.config.mastery.clone(),
            self.config.adjustment.clone(),
            policy,
        );
        self.predictor = Arc::new(self.estimator.clone());
        self
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn CorrectnessPredictor>) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn with_bandit(mut self, bandit: Arc<BanditStore>) -> Self {
        self.bandit = bandit;
        self
    }

    pub fn with_calibration(mut self, calibration: Arc<CalibrationRegistry>) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn with_monitor(mut self, monitor: TutorMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn config(&self) -> &TutorConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<ConceptGraphHandle> {
        &self.graph
    }

    pub fn calibration(&self) -> &Arc<CalibrationRegistry> {
        &self.calibration
    }

    pub fn bandit(&self) -> &Arc<BanditStore> {
        &self.bandit
    }

    pub fn fairness(&self) -> &Arc<FairnessReportHandle> {
        &self.fairness
    }

    pub fn monitor(&self) -> &TutorMonitor {
        &self.monitor
    }

    pub fn load_graph(&self, graph: ConceptGraph) -> TutorResult<u64> {
        self.graph.load(graph)
    }

    pub async fn process_interaction(&self, request: InteractionRequest) -> TutorResult<InteractionResponse> {
        let started = Instant::now();
        let result = self.process_inner(request, started).await;
        let latency_us = started.elapsed().as_micros() as u64;
        registry().record(ComponentId::Orchestrator, latency_us);
        if result.is_err() {
            registry().record_error(ComponentId::Orchestrator);
        }
        result
    }

    async fn process_inner(&self, request: InteractionRequest, started: Instant) -> TutorResult<InteractionResponse> {
        validate_request(&request)?;

        // Log entries become visible before their state write commits, so
        // replay is only read under the key lock.
        let entry = self
            .locks
            .acquire((request.student_id.clone(), request.concept_id.clone()));
        let _guard = entry.mutex().lock().await;
        if let Some(replayed) = self.replay(&request.event_id)? {
            return Ok(replayed);
        }

        let graph = self.graph.snapshot();
        if !graph.contains(&request.concept_id) {
            return Err(TutorError::validation(
                ValidationCode::UnknownConcept,
                format!("concept {} is not in graph v{}", request.concept_id, graph.version()),
            ));
        }
        let question = self
            .questions
            .get_metadata(&request.question_id)?
            .ok_or_else(|| {
                TutorError::validation(
                    ValidationCode::UnknownQuestion,
                    format!("question {} not found", request.question_id),
                )
            })?;
        if question.concept_id != request.concept_id {
            return Err(TutorError::validation(
                ValidationCode::ConceptMismatch,
                format!(
                    "question {} belongs to {}, not {}",
                    question.question_id, question.concept_id, request.concept_id
                ),
            ));
        }
        if !(0.0..=1.0).contains(&question.difficulty) {
            return Err(TutorError::validation(
                ValidationCode::OutOfRange,
                format!("question {} difficulty {} outside [0, 1]", question.question_id, question.difficulty),
            ));
        }

        self.process_locked(&request, &question, &graph, started).await
    }

    fn replay(&self, event_id: &str) -> TutorResult<Option<InteractionResponse>> {
        Ok(self.log.get(event_id)?.map(|logged| {
            tracing::debug!(event_id, "duplicate event replayed");
            let mut response = logged.response;
            response.replayed = true;
            response
        }))
    }

    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> TutorResult<T>
    where
        F: Future<Output = Result<T, crate::tutor::store::StoreError>>,
    {
        let timeout = Duration::from_millis(self.config.orchestrator.repository_timeout_ms);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                tracing::warn!(operation, error = %err, "state repository call failed");
                Err(err.into())
            }
            Err(_) => {
                tracing::warn!(operation, timeout_ms = timeout.as_millis() as u64, "state repository call timed out");
                Err(TutorError::RepositoryUnavailable(format!("{operation} timed out")))
            }
        }
    }

    async fn process_locked(
        &self,
        request: &InteractionRequest,
        question: &QuestionMetadata,
        graph: &ConceptGraph,
        started: Instant,
    ) -> TutorResult<InteractionResponse> {
        let now = request.timestamp.unwrap_or_else(Utc::now);
        let budget = Duration::from_millis(self.config.orchestrator.latency_budget_ms);
        let context = &request.context;

        let mut states: HashMap<String, StudentConceptState> = self
            .with_timeout("get_states", self.repository.get_states(&request.student_id))
            .await?
            .into_iter()
            .map(|s| (s.concept_id.clone(), s))
            .collect();
        let before = states
            .remove(&request.concept_id)
            .unwrap_or_else(|| self.estimator.initial_state(&request.student_id, &request.concept_id));

        let assessment = track_component!(
            ComponentId::CognitiveLoad,
            self.load.assess(question, &before, context)
        );
        let policy = self.estimator.policy();
        let breakdown = track_component!(
            ComponentId::TimeAllocator,
            self.time
                .allocate_for(question, &before, context, assessment.overload_risk, policy.as_ref())
        );
        let raw_prediction = self.predictor.predict_correctness(&before, question);
        let was_due = self
            .scheduler
            .review_status(&before, question.difficulty, now)
            .is_some_and(|r| r.due);

        let update = track_component!(
            ComponentId::MasteryEstimator,
            self.estimator.update(
                &before,
                &MasteryInput {
                    graph,
                    related: &states,
                    correct: request.correct,
                    adjustment: assessment.adjustment,
                    stress: context.stress_level(),
                    now,
                },
            )
        )?;

        let mut degraded_reasons = Vec::new();
        if update.degraded {
            degraded_reasons.push(DegradedReason::NumericalInstability);
        }

        states.insert(request.concept_id.clone(), update.state.clone());
        let signals = SessionSignals {
            stress: context.stress_level(),
            cognitive_load: assessment.overload_risk,
        };
        let calibration = self.calibration.snapshot();

        let selection = self.select_next(request, question, graph, &states, signals, &calibration, now, started, budget);
        if let Some(reason) = selection.degraded_reason {
            registry().record_error(ComponentId::Selector);
            degraded_reasons.push(reason);
        }

        let (predicted_correctness, calibration_meta) =
            self.response_prediction(&selection, question, &states, &update.state, &calibration);

        let response = InteractionResponse {
            decision_id: Uuid::new_v4(),
            event_id: request.event_id.clone(),
            previous_mastery: update.previous_mastery,
            new_mastery: update.new_mastery,
            confidence: update.confidence,
            recommended_time: breakdown.allocated_secs,
            breakdown: breakdown.clone(),
            next_question_id: selection.question_id.clone(),
            advisories: assessment.advisories.clone(),
            degraded: !degraded_reasons.is_empty(),
            degraded_reasons,
            predicted_correctness,
            calibration: calibration_meta,
            replayed: false,
        };

        let interaction = Interaction {
            event_id: request.event_id.clone(),
            student_id: request.student_id.clone(),
            concept_id: request.concept_id.clone(),
            question_id: request.question_id.clone(),
            exam: question.exam.clone(),
            subject: question.subject.clone(),
            correct: request.correct,
            response_time_secs: request.response_time_secs,
            context: ContextSnapshot {
                stress: context.stress_level(),
                fatigue: context.fatigue_level(),
                total_load: assessment.total_load,
                overload_risk: assessment.overload_risk,
                device_multiplier: assessment.device_multiplier,
                network_multiplier: assessment.network_multiplier,
                distraction_multiplier: assessment.distraction_multiplier,
            },
            segments: context.segments.clone(),
            predicted_correctness: raw_prediction,
            allocated_secs: breakdown.allocated_secs,
            mastery_before: update.previous_mastery,
            mastery_after: update.new_mastery,
            mastery_delta: update.delta(),
            timestamp: now,
            response: response.clone(),
        };
        // The log entry is the dedupe record, so it lands before the state and
        // is withdrawn if the state write does not commit.
        if let Err(err) = self.log.append(interaction) {
            tracing::warn!(event_id = %request.event_id, error = %err, "interaction log append failed");
            return Err(err.into());
        }
        if let Err(err) = self
            .with_timeout("put_state", self.repository.put_state(update.state.clone()))
            .await
        {
            if let Err(rollback) = self.log.remove(&request.event_id) {
                tracing::error!(event_id = %request.event_id, error = %rollback, "interaction log rollback failed");
            }
            return Err(err);
        }

        self.record_bandit_observation(question, &before, was_due, signals, &calibration, raw_prediction, request.correct, breakdown.allocated_secs);

        let latency_ms = started.elapsed().as_millis() as i64;
        self.monitor
            .record_decision(&request.student_id, &before, &update.state, &response, latency_ms);

        tracing::info!(
            student_id = %request.student_id,
            concept_id = %request.concept_id,
            event_id = %request.event_id,
            previous_mastery = update.previous_mastery,
            new_mastery = update.new_mastery,
            recommended_time = response.recommended_time,
            next_question_id = ?response.next_question_id,
            degraded = response.degraded,
            latency_ms,
            "interaction processed"
        );

        Ok(response)
    }

    #[allow(clippy::too_many_arguments)]
    fn select_next(
        &self,
        request: &InteractionRequest,
        question: &QuestionMetadata,
        graph: &ConceptGraph,
        states: &HashMap<String, StudentConceptState>,
        signals: SessionSignals,
        calibration: &HashMap<(String, String), CalibrationProfile>,
        now: chrono::DateTime<Utc>,
        started: Instant,
        budget: Duration,
    ) -> Selection {
        let pool = match self.questions.candidate_pool(&question.exam) {
            Ok(pool) => pool,
            Err(err) => {
                tracing::warn!(exam = %question.exam, error = %err, "candidate pool unavailable");
                return Selection::none(Some(DegradedReason::ModelUnavailable));
            }
        };

        let over_budget = started.elapsed() > budget;
        let due = if over_budget {
            Vec::new()
        } else {
            let difficulty = mean_difficulty_by_concept(&pool);
            track_component!(
                ComponentId::Scheduler,
                self.scheduler.due_concepts(
                    states.values(),
                    |concept| difficulty.get(concept).copied().unwrap_or(0.5),
                    now,
                )
            )
        };

        let input = SelectionInput {
            student_id: &request.student_id,
            graph,
            states,
            pool: &pool,
            exclude_question_id: &request.question_id,
            due: &due,
            signals,
            predictor: self.predictor.as_ref(),
            calibration,
        };

        if over_budget || started.elapsed() > budget {
            tracing::warn!(
                student_id = %request.student_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "latency budget exhausted, using heuristic selector"
            );
            return track_component!(
                ComponentId::HeuristicFallback,
                self.selector.fallback(&input, DegradedReason::LatencyBudgetExceeded)
            );
        }

        let model = self.bandit.snapshot();
        track_component!(ComponentId::Selector, self.selector.select(&model, &input))
    }

    /// Calibrated correctness for the next question, or for the answered
    /// question under the updated state when nothing is offered.
    fn response_prediction(
        &self,
        selection: &Selection,
        answered: &QuestionMetadata,
        states: &HashMap<String, StudentConceptState>,
        updated: &StudentConceptState,
        calibration: &HashMap<(String, String), CalibrationProfile>,
    ) -> (f64, CalibrationMeta) {
        let next = selection
            .question_id
            .as_deref()
            .and_then(|id| self.questions.get_metadata(id).ok().flatten());
        let (question, state) = match &next {
            Some(q) => (
                q,
                states
                    .get(&q.concept_id)
                    .cloned()
                    .unwrap_or_else(|| self.estimator.initial_state(&updated.student_id, &q.concept_id)),
            ),
            None => (answered, updated.clone()),
        };
        let raw = self.predictor.predict_correctness(&state, question);
        match calibration.get(&(question.exam.clone(), question.subject.clone())) {
            Some(profile) => (profile.apply(raw), profile.meta()),
            None => (raw, CalibrationMeta::default()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_bandit_observation(
        &self,
        question: &QuestionMetadata,
        before: &StudentConceptState,
        was_due: bool,
        signals: SessionSignals,
        calibration: &HashMap<(String, String), CalibrationProfile>,
        raw_prediction: f64,
        correct: bool,
        allocated_secs: f64,
    ) {
        let predicted = calibration
            .get(&(question.exam.clone(), question.subject.clone()))
            .map(|p| p.apply(raw_prediction))
            .unwrap_or(raw_prediction);
        let candidate = Candidate {
            question,
            mastery: before.mastery,
            mastery_gap: before.mastery_gap(),
            review_due: was_due,
            predicted_correctness: predicted,
        };
        let features = self.selector.features(&candidate, signals);
        let observation = BanditObservation {
            schema_version: FEATURE_SCHEMA_VERSION,
            features,
            reward: reward_per_time(correct, allocated_secs, &self.config),
        };
        let merged = track_component!(ComponentId::BanditMerge, self.bandit.record(observation));
        if merged > 0 {
            tracing::debug!(merged, "bandit batch merged inline");
        }
    }

    /// Number of live per-key locks; zero when the engine is idle.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }
}

impl<R: StudentStateRepository> BatchJobs for TutorEngine<R> {
    fn fit_calibration(&self, exam: &str, subject: &str, window: chrono::Duration) -> TutorResult<CalibrationProfile> {
        let since = Utc::now() - window;
        let interactions = self.log.window(since)?;
        let samples = samples_by_profile(interactions.iter().filter(|i| i.exam == exam && i.subject == subject))
            .remove(&(exam.to_string(), subject.to_string()))
            .unwrap_or_default();
        let profile = track_component!(
            ComponentId::CalibrationFit,
            self.fitter.fit_calibration(exam, subject, &samples)
        );
        self.calibration.publish([profile.clone()]);
        Ok(profile)
    }

    fn refit_calibration(&self, window: chrono::Duration) -> TutorResult<Vec<CalibrationProfile>> {
        let since = Utc::now() - window;
        let interactions = self.log.window(since)?;
        let grouped = samples_by_profile(&interactions);
        let profiles: Vec<CalibrationProfile> = grouped
            .iter()
            .map(|((exam, subject), samples)| {
                track_component!(
                    ComponentId::CalibrationFit,
                    self.fitter.fit_calibration(exam, subject, samples)
                )
            })
            .collect();
        let published = self.calibration.publish(profiles.clone());
        tracing::info!(published, window_start = %since, "calibration profiles published");
        Ok(profiles)
    }

    fn compute_fairness_report(&self, window: chrono::Duration) -> TutorResult<FairnessReport> {
        let since = Utc::now() - window;
        let interactions = self.log.window(since)?;
        let report = track_component!(
            ComponentId::FairnessReport,
            self.fairness_monitor.compute_fairness_report(&interactions, since)
        );
        self.fairness.publish(report.clone());
        Ok(report)
    }

    fn merge_bandit(&self) -> usize {
        track_component!(ComponentId::BanditMerge, self.bandit.merge())
    }
}

/// Correct answers per allocated time unit, capped.
pub fn reward_per_time(correct: bool, allocated_secs: f64, config: &TutorConfig) -> f64 {
    if !correct {
        return 0.0;
    }
    let unit = config.time.reward_time_unit_secs.max(1.0);
    let units = (allocated_secs / unit).max(f64::EPSILON);
    (1.0 / units).min(config.bandit.reward_cap)
}

fn mean_difficulty_by_concept(pool: &[QuestionMetadata]) -> HashMap<String, f64> {
    let mut sums: HashMap<&str, (f64, usize)> = HashMap::new();
    for q in pool {
        let entry = sums.entry(q.concept_id.as_str()).or_insert((0.0, 0));
        entry.0 += q.difficulty;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(concept, (sum, n))| (concept.to_string(), sum / n as f64))
        .collect()
}

fn validate_request(request: &InteractionRequest) -> TutorResult<()> {
    for (field, value) in [
        ("event_id", &request.event_id),
        ("student_id", &request.student_id),
        ("concept_id", &request.concept_id),
        ("question_id", &request.question_id),
    ] {
        if value.trim().is_empty() {
            return Err(TutorError::validation(ValidationCode::MissingField, format!("{field} is required")));
        }
    }
    if !request.response_time_secs.is_finite() || request.response_time_secs < 0.0 {
        return Err(out_of_range("response_time_secs", request.response_time_secs));
    }
    validate_context(&request.context)
}

fn validate_context(context: &ContextFactors) -> TutorResult<()> {
    for (field, value) in [("stress", context.stress), ("fatigue", context.fatigue)] {
        if let Some(v) = value {
            if !(0.0..=1.0).contains(&v) {
                return Err(out_of_range(field, v));
            }
        }
    }
    for (field, value) in [
        ("device_multiplier", context.device_multiplier),
        ("network_multiplier", context.network_multiplier),
        ("distraction_multiplier", context.distraction_multiplier),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v <= 0.0 {
                return Err(out_of_range(field, v));
            }
        }
    }
    for (field, value) in [
        ("session_minutes", context.session_minutes),
        ("interface_friction", context.interface_friction),
    ] {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(out_of_range(field, v));
            }
        }
    }
    Ok(())
}

fn out_of_range(field: &str, value: f64) -> TutorError {
    TutorError::validation(ValidationCode::OutOfRange, format!("{field} = {value} is out of range"))
}
