use thiserror::Error;

use crate::staging::StagingError;

/// Errors surfaced by the recognition core.
#[derive(Error, Debug)]
pub enum RecognitionError {
    /// A verification payload was rejected. Nothing was written.
    #[error("invalid {field}: {message}")]
    InputValidation { field: String, message: String },

    /// The payload targets a stage other than the next one.
    #[error("stage {got} cannot be submitted now (expected stage {expected})")]
    StaleStage { expected: i64, got: i64 },

    /// A worker is still running for this album.
    #[error("album {0} is still processing")]
    AlbumBusy(i64),

    /// Expected staging data is gone; recognition must restart from stage 0.
    #[error("recognition data for album {0} expired, start over")]
    TtlExpired(i64),

    #[error("{0} not found")]
    NotFound(String),

    /// Structural corruption detected; the operation is aborted.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl RecognitionError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        RecognitionError::InputValidation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for RecognitionError {
    fn from(e: rusqlite::Error) -> Self {
        RecognitionError::Backend(e.into())
    }
}

impl From<std::io::Error> for RecognitionError {
    fn from(e: std::io::Error) -> Self {
        RecognitionError::Backend(e.into())
    }
}

pub type RecognitionResult<T> = Result<T, RecognitionError>;
