use thiserror::Error;

#[derive(Error, Debug)]
pub enum SequenceError {
    /// Rejected at enroll time (missing email, unsubscribed contact, bad input)
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    /// Needs operator action; the enrollment stays at its current step
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid step: {0}")]
    InvalidStep(String),
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type SequenceResult<T> = Result<T, SequenceError>;

impl SequenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Configuration(_) => "configuration",
            Self::InvalidStep(_) => "invalid_step",
            Self::Delivery(_) => "delivery",
            Self::Database(_) => "database",
        }
    }
}
