pub mod bkt;
pub mod half_life;
pub mod mastery;
pub mod policy;

pub use bkt::{bkt_update, clamp_probability, predict_correct, BktParams, BktStep, ParameterAdjustment};
pub use half_life::{HalfLifeScheduler, ReviewStatus};
pub use mastery::{CorrectnessPredictor, MasteryEstimator, MasteryInput, MasteryUpdate};
pub use policy::{AdaptationPolicy, StreakRecoveryPolicy};
