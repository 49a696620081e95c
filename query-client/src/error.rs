use crate::deduplication::DeduplicationError;

/// Failure reported by a [`DocumentStore`](crate::store::DocumentStore) or
/// [`KeyValueStore`](crate::notes::KeyValueStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document {id} not found in {path}")]
    NotFound { path: String, id: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("channel closed by backend")]
    ChannelClosed,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A page or document fetch failed. Retrying the same call may succeed.
    #[error("fetch failed: {0}")]
    Fetch(StoreError),
    /// A live channel failed. A new subscription is required to recover.
    #[error("subscription failed: {0}")]
    Subscription(StoreError),
    /// The previous page already reported that no further pages exist.
    #[error("pagination exhausted: the last page had no next cursor")]
    PaginationExhausted,
    #[error("document in {path} does not match the expected shape: {message}")]
    Decode { path: String, message: String },
    #[error("invalid query descriptor: {0}")]
    InvalidDescriptor(String),
    #[error(transparent)]
    Deduplication(#[from] DeduplicationError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("local storage failed: {0}")]
    Storage(String),
}

impl Error {
    /// Whether repeating the operation that produced this error can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Fetch(_) | Error::Deduplication(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
