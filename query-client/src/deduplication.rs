use crate::cache::{CacheKey, CachedData};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Configuration for request deduplication
#[derive(Clone, Debug)]
pub struct DeduplicationConfig {
    /// How long a caller waits on someone else's in-flight fetch before giving up.
    /// An in-flight fetch older than this is treated as abandoned and re-issued.
    pub request_timeout: Duration,
    /// Whether deduplication is enabled
    pub enabled: bool,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::seconds(30),
            enabled: true,
        }
    }
}

type Waiter = oneshot::Sender<Result<CachedData>>;

static NEXT_FETCH_ID: AtomicU64 = AtomicU64::new(1);

/// A fetch currently being executed by one caller. Every other caller asking
/// for the same key parks a oneshot sender here and receives a clone of the
/// owner's result. The id tells one owner's fetch apart from a later
/// takeover of the same key.
#[derive(Debug)]
pub(crate) struct InFlight {
    id: u64,
    started_at: DateTime<Utc>,
    waiters: Vec<Waiter>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_FETCH_ID.fetch_add(1, Ordering::Relaxed),
            started_at: Utc::now(),
            waiters: vec![],
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_abandoned(&self, config: &DeduplicationConfig) -> bool {
        Utc::now() - self.started_at > config.request_timeout
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn join(&mut self) -> oneshot::Receiver<Result<CachedData>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    /// Hand the owner's result to every waiter. Returns how many were notified.
    pub(crate) fn notify(self, key: &CacheKey, result: &Result<CachedData>) -> usize {
        let count = self.waiters.len();
        if count > 0 {
            log::debug!("Notifying {} waiters for key: {:?}", count, key);
        }
        for waiter in self.waiters {
            // the waiter may have timed out and gone away
            let _ = waiter.send(result.clone());
        }
        count
    }
}

/// Wait for the owner of an in-flight fetch to publish its result.
pub(crate) async fn wait_for(
    key: &CacheKey,
    rx: oneshot::Receiver<Result<CachedData>>,
    config: &DeduplicationConfig,
) -> Result<CachedData> {
    let timeout = config
        .request_timeout
        .to_std()
        .unwrap_or(std::time::Duration::ZERO);

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => {
            log::debug!("Received deduplicated result for key: {:?}", key);
            result
        }
        Ok(Err(_)) => {
            log::warn!("Sender dropped for key: {:?}", key);
            Err(DeduplicationError::SenderDropped.into())
        }
        Err(_) => {
            log::warn!("Request timeout for key: {:?}", key);
            Err(DeduplicationError::Timeout.into())
        }
    }
}

/// Statistics for request deduplication
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeduplicationStats {
    pub pending_requests: usize,
    pub total_waiters: usize,
}

/// Errors that can occur during request deduplication
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeduplicationError {
    #[error("Request timed out")]
    Timeout,
    #[error("Sender was dropped")]
    SenderDropped,
}
