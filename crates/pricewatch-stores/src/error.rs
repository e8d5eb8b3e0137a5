use pricewatch_backend::BackendError;
use pricewatch_core::RowId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("not signed in")]
    NotAuthenticated,
    #[error("{0}")]
    Precondition(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: RowId },
    #[error("local state: {0}")]
    LocalState(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Result of a read. Reads never raise: failures are recorded on the store
/// and reported here.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Loaded,
    /// Already loaded, a fetch was in flight, or the session changed mid-fetch.
    Skipped,
    Failed(String),
}

impl FetchOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, FetchOutcome::Loaded)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            FetchOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }
}
