use thiserror::Error;

#[derive(Error, Debug)]
pub enum InsightsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed (etag mismatch): {0}")]
    PreconditionFailed(String),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported message schema '{schema}' version {version}")]
    UnsupportedMessage { schema: String, version: u32 },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InsightsError {
    /// Whether redelivering the failing message could plausibly succeed.
    ///
    /// Contract violations (unknown schemas, malformed payloads, bad
    /// arguments) are poison and go straight to the dead-letter area.
    pub fn is_transient(&self) -> bool {
        match self {
            InsightsError::UnsupportedMessage { .. }
            | InsightsError::Serialization(_)
            | InsightsError::InvalidArgument(_) => false,
            InsightsError::HttpStatus { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => true,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, InsightsError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, InsightsError::Conflict(_))
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, InsightsError::PreconditionFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, InsightsError>;
