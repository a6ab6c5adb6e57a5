//! Error types shared by the API client, the sync queue and the entity
//! bindings.

use thiserror::Error;

/// Result type for crate operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by the remote REST backend or the transport under it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// No connection could be made at all: refused, DNS failure, no route.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The connection was made but the exchange broke off (reset, truncated
    /// body).
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// Non-2xx response. `message` carries the server's error text.
    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    /// The body was not JSON, or an envelope reported `success: false`.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ApiError {
    /// HTTP status, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether replaying the same request later could succeed.
    ///
    /// Transport failures, timeouts, 408, 429 and 5xx are transient. Every
    /// other 4xx means the payload itself was rejected.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Unreachable(_) | ApiError::Network(_) | ApiError::Timeout(_) => true,
            ApiError::Http { status, .. } => matches!(*status, 408 | 429) || *status >= 500,
            ApiError::InvalidResponse(_) | ApiError::Config(_) => false,
        }
    }
}

/// Client-side schema violation, raised before any enqueue or network call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Umbrella error for the crate.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A read found nothing cached while the device is offline.
    #[error("offline and nothing cached for {0}")]
    Offline(String),

    /// Credential store failure.
    #[error("credential store error: {0}")]
    Storage(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A queue item that violates the queue invariants.
    #[error("invalid queue item: {0}")]
    InvalidQueueItem(String),
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned(err.to_string())
    }
}
