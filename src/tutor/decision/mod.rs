pub mod heuristic;
pub mod linucb;
pub mod selector;

pub use heuristic::HeuristicSelector;
pub use linucb::{
    BanditObservation, BanditStore, FeatureSchema, LinUcbModel, LinUcbScorer, UcbScore, FEATURE_DIM,
    FEATURE_NAMES, FEATURE_SCHEMA_VERSION,
};
pub use selector::{Candidate, QuestionSelector, Selection, SelectionInput, SessionSignals};
