use serde::Serialize;

/// Failure taxonomy of the decision core.
///
/// Only [`TutorError::Validation`] and [`TutorError::RepositoryUnavailable`] ever
/// reach the caller of the interaction endpoint; the remaining variants are
/// absorbed inside the pipeline and reported through degraded metadata.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TutorError {
    #[error("validation error [{code}]: {message}")]
    Validation { code: ValidationCode, message: String },
    #[error("numerical instability: {0}")]
    NumericalInstability(String),
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("repository unavailable: {0}")]
    RepositoryUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    MissingField,
    UnknownConcept,
    UnknownQuestion,
    ConceptMismatch,
    OutOfRange,
    InvalidGraph,
    InvalidConfig,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingField => "MISSING_FIELD",
            Self::UnknownConcept => "UNKNOWN_CONCEPT",
            Self::UnknownQuestion => "UNKNOWN_QUESTION",
            Self::ConceptMismatch => "CONCEPT_MISMATCH",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::InvalidGraph => "INVALID_GRAPH",
            Self::InvalidConfig => "INVALID_CONFIG",
        }
    }
}

impl std::fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TutorError {
    pub fn validation(code: ValidationCode, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code.as_str(),
            Self::NumericalInstability(_) => "NUMERICAL_INSTABILITY",
            Self::ModelUnavailable(_) => "MODEL_UNAVAILABLE",
            Self::InsufficientData(_) => "INSUFFICIENT_DATA",
            Self::RepositoryUnavailable(_) => "REPOSITORY_UNAVAILABLE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RepositoryUnavailable(_))
    }

    /// Whether this condition is reported to the caller instead of degrading.
    pub fn is_surfaced(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::RepositoryUnavailable(_))
    }
}

pub type TutorResult<T> = Result<T, TutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_validation_and_repository_errors_are_surfaced() {
        assert!(TutorError::validation(ValidationCode::MissingField, "x").is_surfaced());
        assert!(TutorError::RepositoryUnavailable("down".into()).is_surfaced());
        assert!(!TutorError::ModelUnavailable("corrupt".into()).is_surfaced());
        assert!(!TutorError::NumericalInstability("nan".into()).is_surfaced());
        assert!(!TutorError::InsufficientData("few".into()).is_surfaced());
    }

    #[test]
    fn repository_errors_are_retryable() {
        assert!(TutorError::RepositoryUnavailable("timeout".into()).is_retryable());
        assert!(!TutorError::validation(ValidationCode::OutOfRange, "x").is_retryable());
    }

    #[test]
    fn code_reflects_validation_kind() {
        let err = TutorError::validation(ValidationCode::UnknownConcept, "c-404");
        assert_eq!(err.code(), "UNKNOWN_CONCEPT");
        assert!(err.to_string().contains("c-404"));
    }
}
