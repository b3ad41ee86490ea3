use thiserror::Error;

use super::backend::BackendError;
use super::keys::Endpoint;

/// Failure surfaced by [`QueryCache::mutate`](super::QueryCache::mutate).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("`{0}` requires a signed-in user")]
    MissingIdentity(Endpoint),
    #[error("backend request failed: {0}")]
    Backend(#[from] BackendError),
}

impl QueryError {
    /// The backend error, when the request reached the backend at all.
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            Self::Backend(error) => Some(error),
            _ => None,
        }
    }
}
