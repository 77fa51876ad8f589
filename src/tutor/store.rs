//! Collaborator interfaces consumed by the decision core, plus in-memory
//! adapters used by tests and the reference host.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::TutorError;
use crate::tutor::types::{Concept, Interaction, QuestionMetadata, StudentConceptState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for TutorError {
    fn from(err: StoreError) -> Self {
        TutorError::RepositoryUnavailable(err.to_string())
    }
}

/// Read-only question metadata lookup.
pub trait QuestionBank: Send + Sync {
    fn get_metadata(&self, question_id: &str) -> Result<Option<QuestionMetadata>, StoreError>;

    /// Questions that may be offered next for an exam.
    fn candidate_pool(&self, exam: &str) -> Result<Vec<QuestionMetadata>, StoreError>;
}

pub trait StudentStateRepository: Send + Sync + 'static {
    fn get_state(
        &self,
        student_id: &str,
        concept_id: &str,
    ) -> impl Future<Output = Result<Option<StudentConceptState>, StoreError>> + Send;

    /// Every concept state of one student in a single read.
    fn get_states(&self, student_id: &str) -> impl Future<Output = Result<Vec<StudentConceptState>, StoreError>> + Send;

    fn put_state(&self, state: StudentConceptState) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Append-only interaction log.
pub trait InteractionLog: Send + Sync {
    fn append(&self, interaction: Interaction) -> Result<(), StoreError>;

    fn get(&self, event_id: &str) -> Result<Option<Interaction>, StoreError>;

    /// Removes an entry whose state write did not commit.
    fn remove(&self, event_id: &str) -> Result<(), StoreError>;

    fn contains(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.get(event_id)?.is_some())
    }

    /// Interactions with `timestamp >= since`, oldest first.
    fn window(&self, since: DateTime<Utc>) -> Result<Vec<Interaction>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryQuestionBank {
    questions: RwLock<HashMap<String, QuestionMetadata>>,
}

impl InMemoryQuestionBank {
    pub fn new(questions: impl IntoIterator<Item = QuestionMetadata>) -> Self {
        let bank = Self::default();
        for q in questions {
            bank.insert(q);
        }
        bank
    }

    pub fn insert(&self, question: QuestionMetadata) {
        self.questions.write().insert(question.question_id.clone(), question);
    }

    pub fn len(&self) -> usize {
        self.questions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.read().is_empty()
    }
}

impl QuestionBank for InMemoryQuestionBank {
    fn get_metadata(&self, question_id: &str) -> Result<Option<QuestionMetadata>, StoreError> {
        Ok(self.questions.read().get(question_id).cloned())
    }

    fn candidate_pool(&self, exam: &str) -> Result<Vec<QuestionMetadata>, StoreError> {
        let mut pool: Vec<QuestionMetadata> = self
            .questions
            .read()
            .values()
            .filter(|q| q.exam == exam)
            .cloned()
            .collect();
        pool.sort_by(|a, b| a.question_id.cmp(&b.question_id));
        Ok(pool)
    }
}

/// State repository with switchable availability and injectable latency.
#[derive(Debug)]
pub struct InMemoryStateRepository {
    states: RwLock<HashMap<(String, String), StudentConceptState>>,
    available: AtomicBool,
    writable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    writes: AtomicU64,
}

impl Default for InMemoryStateRepository {
    fn default() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            latency: Mutex::new(None),
            writes: AtomicU64::new(0),
        }
    }
}

impl InMemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Rejects writes while reads keep working.
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    async fn ready(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("state repository offline".into()));
        }
        Ok(())
    }
}

impl StudentStateRepository for InMemoryStateRepository {
    async fn get_state(&self, student_id: &str, concept_id: &str) -> Result<Option<StudentConceptState>, StoreError> {
        self.ready().await?;
        Ok(self
            .states
            .read()
            .get(&(student_id.to_string(), concept_id.to_string()))
            .cloned())
    }

    async fn get_states(&self, student_id: &str) -> Result<Vec<StudentConceptState>, StoreError> {
        self.ready().await?;
        let mut states: Vec<StudentConceptState> = self
            .states
            .read()
            .values()
            .filter(|s| s.student_id == student_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.concept_id.cmp(&b.concept_id));
        Ok(states)
    }

    async fn put_state(&self, state: StudentConceptState) -> Result<(), StoreError> {
        self.ready().await?;
        if !self.writable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("state repository is read-only".into()));
        }
        self.states
            .write()
            .insert((state.student_id.clone(), state.concept_id.clone()), state);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LogInner {
    entries: Vec<Interaction>,
    index: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct InMemoryInteractionLog {
    inner: RwLock<LogInner>,
    writable: AtomicBool,
}

impl Default for InMemoryInteractionLog {
    fn default() -> Self {
        Self {
            inner: RwLock::new(LogInner::default()),
            writable: AtomicBool::new(true),
        }
    }
}

impl InMemoryInteractionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl InteractionLog for InMemoryInteractionLog {
    fn append(&self, interaction: Interaction) -> Result<(), StoreError> {
        if !self.writable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("interaction log is read-only".into()));
        }
        let mut inner = self.inner.write();
        if inner.index.contains_key(&interaction.event_id) {
            return Err(StoreError::Conflict(format!(
                "event {} already logged",
                interaction.event_id
            )));
        }
        let position = inner.entries.len();
        inner.index.insert(interaction.event_id.clone(), position);
        inner.entries.push(interaction);
        Ok(())
    }

    fn get(&self, event_id: &str) -> Result<Option<Interaction>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.index.get(event_id).and_then(|&i| inner.entries.get(i)).cloned())
    }

    fn remove(&self, event_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let Some(position) = inner.index.remove(event_id) else {
            return Ok(());
        };
        inner.entries.remove(position);
        for slot in inner.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Ok(())
    }

    fn contains(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.read().index.contains_key(event_id))
    }

    fn window(&self, since: DateTime<Utc>) -> Result<Vec<Interaction>, StoreError> {
        Ok(self
            .inner
            .read()
            .entries
            .iter()
            .filter(|i| i.timestamp >= since)
            .cloned()
            .collect())
    }
}

/// Concept graph and question bank seed, as shipped to the reference host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub graph_version: u64,
    pub concepts: Vec<Concept>,
    pub questions: Vec<QuestionMetadata>,
}

impl Catalog {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
