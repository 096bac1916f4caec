use statline_core::RangeError;
use statline_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error(transparent)]
    InvalidRange(#[from] RangeError),
    #[error("coordinator for stream '{0}' has stopped")]
    CoordinatorClosed(String),
    #[error("no sync tracked for correlation id {0}")]
    UnknownCorrelation(String),
}

impl SyncError {
    /// Whether re-issuing the same sync could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransportUnavailable(_))
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(detail) | TransportError::Send(detail) => {
                SyncError::TransportUnavailable(detail)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to load records: {0}")]
    Load(#[from] StorageError),
    #[error(transparent)]
    InvalidRange(#[from] RangeError),
}
