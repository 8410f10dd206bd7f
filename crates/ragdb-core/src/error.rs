use thiserror::Error;

/// Caller mistakes. Rejected synchronously and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("malformed filter: {0}")]
    MalformedFilter(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// An external embedding or rerank call failed. `transient` failures are
    /// eligible for retry.
    #[error("Provider '{provider}' failed: {message}")]
    Provider {
        provider: String,
        message: String,
        transient: bool,
    },

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Timed out during {stage}")]
    Timeout { stage: String },

    #[error("Operation failed: {0}")]
    Operation(String),
}

/// Coarse classification used in logs and per-chunk error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidConfig,
    Validation,
    Provider,
    RetrievalUnavailable,
    IndexUnavailable,
    Timeout,
    Operation,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Provider { .. } => ErrorKind::Provider,
            Error::RetrievalUnavailable(_) => ErrorKind::RetrievalUnavailable,
            Error::IndexUnavailable(_) => ErrorKind::IndexUnavailable,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Operation(_) => ErrorKind::Operation,
        }
    }

    /// Whether the retry policy may attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Provider { transient: true, .. } | Error::Timeout { .. })
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Error::Provider { provider: provider.into(), message: message.into(), transient }
    }

    pub fn timeout(stage: impl Into<String>) -> Self {
        Error::Timeout { stage: stage.into() }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::Validation(ValidationError::InvalidArgument(msg.into()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
