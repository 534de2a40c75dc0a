use thiserror::Error;

/// Errors returned by a [`crate::ListerWatcher`].
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The version token can no longer be resumed (HTTP 410 Gone on kube).
    #[error("resource version expired: {0}")]
    Expired(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AuthorityError {
    pub fn is_expired(&self) -> bool {
        matches!(self, AuthorityError::Expired(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("index already registered: {0}")]
    IndexConflict(String),
    #[error("informer already started")]
    AlreadyStarted,
}

/// Returned by a blocking pop once the queue has been closed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("delta queue closed")]
pub struct QueueClosed;
