pub mod calibration;
pub mod config;
pub mod decision;
pub mod engine;
pub mod fairness;
pub mod graph;
pub mod memory;
pub mod metrics;
pub mod modeling;
pub mod monitoring;
pub mod store;
pub mod types;

pub use config::TutorConfig;
pub use engine::{BatchJobs, TutorEngine};
pub use graph::{ConceptGraph, ConceptGraphHandle};
pub use store::{
    Catalog, InMemoryInteractionLog, InMemoryQuestionBank, InMemoryStateRepository, InteractionLog, QuestionBank,
    StoreError, StudentStateRepository,
};
pub use types::*;
