use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("merge failed between {left} and {right}: {message}")]
    Merge {
        left: String,
        right: String,
        message: String,
    },

    #[error("missing parent commit {parent} referenced by {commit}")]
    MissingParent { commit: String, parent: String },

    #[error("invalid commit {commit}: {message}")]
    InvalidCommit { commit: String, message: String },

    #[error("operation after shutdown")]
    Shutdown,

    #[error("fatal remote error: {0}")]
    Fatal(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether a reconnect is worth attempting after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Protocol(_))
    }
}
