pub mod cognitive_load;
pub mod time_budget;

pub use cognitive_load::{sigmoid, Advisory, CognitiveLoadAssessor, LoadAssessment, LoadLevel};
pub use time_budget::{TimeAllocator, TimeBreakdown, TimeFactors};
