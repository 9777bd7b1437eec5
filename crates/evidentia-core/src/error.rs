use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Evidence not found: {0}")]
    EvidenceNotFound(Uuid),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Invalid entity type: {0}")]
    InvalidEntityType(String),

    #[error("Invalid relationship type: {0}")]
    InvalidRelationshipType(String),

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Evidence with fingerprint {fingerprint} already exists in engagement {engagement_id}")]
    DuplicateFingerprint {
        engagement_id: Uuid,
        fingerprint: String,
    },

    #[error("Embedding has dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Background write aborted: {0}")]
    WriteAborted(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            value: value.into(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::WriteAborted(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
