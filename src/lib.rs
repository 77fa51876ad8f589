pub mod config;
pub mod error;
pub mod logging;
pub mod tutor;
pub mod workers;

pub use error::{TutorError, TutorResult, ValidationCode};
pub use tutor::{TutorConfig, TutorEngine};
