/// Failures reported by the remote list/watch capability.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    /// The cursor is no longer valid on the remote; a full re-list is required.
    #[error("stale cursor: {0}")]
    StaleCursor(String),
    /// Network hiccup or other retryable failure.
    #[error("transient: {0}")]
    Transient(String),
}

impl SourceError {
    pub fn is_stale_cursor(&self) -> bool {
        matches!(self, SourceError::StaleCursor(_))
    }
}

/// Errors surfaced by the watch subsystem to its owner.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InformerError {
    #[error("list failed after {attempts} attempts: {message}")]
    ListFailure { attempts: u32, message: String },
    #[error("watch failed after {attempts} consecutive attempts: {message}")]
    WatchFailure { attempts: u32, message: String },
    #[error("informer already started")]
    AlreadyStarted,
}
