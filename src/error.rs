use thiserror::Error;

/// Failures reported by host capabilities (collection store, lender lookup,
/// remote names, snapshot source).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    /// The host does not offer this capability at all.
    #[error("capability unavailable: {0}")]
    Unsupported(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    /// A single remote or host call failed. Never retried within a run.
    #[error("remote call failed: {0}")]
    Remote(String),
}

impl HostError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, HostError::Unsupported(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A failure that aborts a whole reconciliation run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("host never became ready: {0}")]
    NotReady(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
