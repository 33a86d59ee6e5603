use shared::action_queue::QueueClosed;
use std::io;

/// Caller-visible error taxonomy. Structured kinds, not strings: the transport
/// layer translates each kind to a status, and `Transient` tells a polling
/// client to try again.
///
/// The type is `Clone` (string payloads only) so a failed result can be shared
/// between deduplicated waiters of the same cache entry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    /// Bad or absent auth secret; unknown download token. Carries no detail.
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    /// A vault/storage/IO failure a retry could overcome. The offending cache
    /// entry has been invalidated by the time this surfaces.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invariant violated: {0}")]
    Fatal(String),
}

impl DeployError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::Transient(_) | DeployError::Cancelled)
    }

    pub(crate) fn io(context: &str, error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => DeployError::NotFound(format!("{context}: {error}")),
            _ => DeployError::Transient(format!("{context}: {error}")),
        }
    }

    pub(crate) fn json(context: &str, error: &serde_json::Error) -> Self {
        DeployError::Malformed(format!("{context}: {error}"))
    }
}

impl From<QueueClosed> for DeployError {
    fn from(error: QueueClosed) -> Self {
        DeployError::Fatal(error.to_string())
    }
}
