use thiserror::Error;

/// Errors raised while building a model or simulating an individual.
///
/// Construction errors ([PharmsimError::is_construction_error]) reject a model or a
/// variance set before any simulation runs. Every other variant belongs to a single
/// run and never affects sibling runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PharmsimError {
    #[error("Invalid variance matrix '{name}': {reason}")]
    InvalidMatrix { name: String, reason: String },

    #[error("Unknown variance matrix '{0}'")]
    UnknownMatrix(String),

    #[error("Undeclared reference '{name}' in {context}")]
    UndeclaredReference { name: String, context: String },

    #[error("Duplicate name '{0}'")]
    DuplicateName(String),

    #[error("Compartment '{0}' has no differential equation")]
    MissingDerivative(String),

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// Per-run input of the wrong size (effects, states, draws)
    #[error("Input size mismatch for {what}: expected {expected}, got {actual}")]
    InputMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Occasion value {value} does not match any declared occasion")]
    UnknownOccasion { value: f64 },

    #[error("Covariate '{name}' is missing from the record at time {time}")]
    MissingCovariate { name: String, time: f64 },

    #[error("Invalid event at time {time}: {reason}")]
    InvalidEvent { time: f64, reason: String },

    #[error("Invalid solver options: {0}")]
    InvalidOptions(String),

    #[error("Integration diverged at t={time} (step {step:e}): {reason}")]
    IntegrationDiverged {
        time: f64,
        step: f64,
        reason: String,
    },

    #[error("State of compartment {compartment} became non-finite at t={time}")]
    NonFiniteState { time: f64, compartment: usize },

    #[error("Simulation cancelled at t={time}")]
    Cancelled { time: f64 },
}

impl PharmsimError {
    /// Returns true for errors that reject a model or variance set as a whole.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            PharmsimError::InvalidMatrix { .. }
                | PharmsimError::UnknownMatrix(_)
                | PharmsimError::UndeclaredReference { .. }
                | PharmsimError::DuplicateName(_)
                | PharmsimError::MissingDerivative(_)
                | PharmsimError::DimensionMismatch { .. }
        )
    }

    pub(crate) fn undeclared(name: impl Into<String>, context: impl Into<String>) -> Self {
        PharmsimError::UndeclaredReference {
            name: name.into(),
            context: context.into(),
        }
    }
}
