use crate::deduplication::{self, DeduplicationConfig, DeduplicationStats, InFlight};
use crate::descriptor::QueryDescriptor;
use crate::error::{Error, Result};
use crate::page::{Cursor, Page};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

#[cfg(feature = "graphql")]
use async_graphql::SimpleObject;

/// Configuration for the cache system
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// How long a resolved result stays fresh
    pub stale_time: Duration,
    /// Maximum number of cached entries
    pub max_entries: usize,
    /// Whether caching is enabled
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::seconds(60),
            max_entries: 1000,
            enabled: true,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration
    pub fn new(stale_time: Duration, max_entries: usize) -> Self {
        Self {
            stale_time,
            max_entries,
            enabled: true,
        }
    }
}

/// What the store returned for a key, before decoding into a typed item.
#[derive(Clone, Debug, PartialEq)]
pub enum CachedData {
    Page(Page<Value>),
    Document(Value),
}

/// Cached result with metadata
#[derive(Clone, Debug)]
pub struct CachedResult {
    pub data: CachedData,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CachedResult {
    pub fn new(data: CachedData, ttl: Duration) -> Self {
        Self {
            data,
            created_at: Utc::now(),
            ttl,
        }
    }

    /// Check if the cached result is still valid
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.created_at + self.ttl
    }
}

/// Cache key for query operations. Each variant carries the hex SHA-256 of the
/// canonical request, so semantically equal descriptors share one key.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub enum CacheKey {
    Page(String),
    InfinitePage(String),
    Document(String),
}

impl CacheKey {
    /// Key for a one-shot query (first page, items only).
    pub fn page(descriptor: &QueryDescriptor) -> Self {
        CacheKey::Page(digest(&[descriptor.canonical().as_str()]))
    }

    /// Key for one page of an infinite query, identified by the cursor it starts at.
    pub fn infinite_page(descriptor: &QueryDescriptor, cursor: Option<&Cursor>) -> Self {
        let cursor = cursor.map_or(Value::Null, |cursor| cursor.as_value().clone());
        let canonical = descriptor.canonical();
        let cursor = cursor.to_string();
        CacheKey::InfinitePage(digest(&[canonical.as_str(), cursor.as_str()]))
    }

    pub fn document(path: &str, id: &str) -> Self {
        CacheKey::Document(digest(&[path, id]))
    }

    pub fn hash(&self) -> &str {
        match self {
            CacheKey::Page(hash) | CacheKey::InfinitePage(hash) | CacheKey::Document(hash) => hash,
        }
    }
}

pub(crate) fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        // separator so ("ab", "c") and ("a", "bc") differ
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
enum EntryState {
    Pending(InFlight),
    Resolved(CachedResult),
    Errored { error: Error, at: DateTime<Utc> },
}

/// How a caller takes part in a lookup that missed the fresh cache.
enum Role {
    Owner(u64),
    Waiter(oneshot::Receiver<Result<CachedData>>),
    Bypass,
}

#[derive(Debug)]
struct CacheEntry {
    collection_path: String,
    state: EntryState,
}

impl CacheEntry {
    /// Start a new in-flight fetch owned by the caller.
    fn take_over(&mut self) -> Role {
        let in_flight = InFlight::new();
        let id = in_flight.id();
        self.state = EntryState::Pending(in_flight);
        Role::Owner(id)
    }

    fn is_pending_for(&self, fetch_id: u64) -> bool {
        matches!(&self.state, EntryState::Pending(in_flight) if in_flight.id() == fetch_id)
    }
}

/// In-memory query cache using DashMap for thread safety.
///
/// At most one fetch per key is in flight at any time: callers that find a
/// pending entry wait for its owner instead of hitting the store again.
/// Failed fetches are recorded as `Errored` and never served; the next call
/// for the key retries.
pub struct QueryCache {
    entries: DashMap<CacheKey, CacheEntry>,
    pub config: CacheConfig,
    pub deduplication: DeduplicationConfig,
}

impl QueryCache {
    pub fn new(config: CacheConfig, deduplication: DeduplicationConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            deduplication,
        }
    }

    /// Return the fresh cached value for `key`, join the fetch already in
    /// flight for it, or run `fetch` and publish its result.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: CacheKey,
        collection_path: &str,
        fetch: F,
    ) -> Result<CachedData>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedData>>,
    {
        if !self.config.enabled {
            return fetch().await;
        }

        let role = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                match &mut entry.state {
                    EntryState::Resolved(cached) if cached.is_valid() => {
                        log::debug!("Cache hit for key: {:?}", key);
                        return Ok(cached.data.clone());
                    }
                    EntryState::Pending(_) if !self.deduplication.enabled => Role::Bypass,
                    EntryState::Pending(in_flight) if !in_flight.is_abandoned(&self.deduplication) => {
                        log::debug!("Request already pending for key: {:?}", key);
                        Role::Waiter(in_flight.join())
                    }
                    EntryState::Errored { error, .. } => {
                        log::debug!("Retrying key {:?} after failed fetch: {}", key, error);
                        entry.take_over()
                    }
                    EntryState::Pending(_) => {
                        log::warn!("Taking over abandoned fetch for key: {:?}", key);
                        entry.take_over()
                    }
                    EntryState::Resolved(_) => {
                        log::debug!("Cache entry stale for key: {:?}", key);
                        entry.take_over()
                    }
                }
            }
            Entry::Vacant(vacant) => {
                log::debug!("Cache miss for key: {:?}", key);
                let in_flight = InFlight::new();
                let id = in_flight.id();
                vacant.insert(CacheEntry {
                    collection_path: collection_path.to_string(),
                    state: EntryState::Pending(in_flight),
                });
                Role::Owner(id)
            }
        };

        match role {
            Role::Waiter(rx) => deduplication::wait_for(&key, rx, &self.deduplication).await,
            Role::Bypass => fetch().await,
            Role::Owner(fetch_id) => {
                let guard = PendingGuard {
                    cache: self,
                    key,
                    fetch_id,
                    armed: true,
                };
                let result = fetch().await;
                guard.complete(&result);
                result
            }
        }
    }

    /// Get cached result if available and valid
    pub fn get(&self, key: &CacheKey) -> Option<CachedData> {
        if !self.config.enabled {
            return None;
        }

        let entry = self.entries.get(key)?;
        match &entry.state {
            EntryState::Resolved(cached) if cached.is_valid() => Some(cached.data.clone()),
            _ => None,
        }
    }

    /// Store result in cache
    pub fn put(&self, key: CacheKey, collection_path: &str, data: CachedData) {
        if !self.config.enabled {
            return;
        }

        self.ensure_capacity();
        let result = Ok(data.clone());
        let state = EntryState::Resolved(CachedResult::new(data, self.config.stale_time));
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let previous = std::mem::replace(&mut occupied.get_mut().state, state);
                // a direct put also settles anyone waiting on this key
                if let EntryState::Pending(in_flight) = previous {
                    in_flight.notify(occupied.key(), &result);
                }
            }
            Entry::Vacant(vacant) => {
                log::debug!("Stored in cache with key: {:?}", vacant.key());
                vacant.insert(CacheEntry {
                    collection_path: collection_path.to_string(),
                    state,
                });
            }
        }
    }

    /// Drop the stored result for one key. In-flight fetches are left alone.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries
            .remove_if(key, |_, entry| !matches!(entry.state, EntryState::Pending(_)))
            .is_some()
    }

    /// Drop every stored result belonging to a collection.
    pub fn invalidate_collection(&self, collection_path: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            matches!(entry.state, EntryState::Pending(_)) || entry.collection_path != collection_path
        });
        let removed = before.saturating_sub(self.entries.len());
        log::debug!("Invalidated {} entries for {}", removed, collection_path);
        removed
    }

    /// Remove expired and errored entries from cache
    pub fn evict_expired(&self) {
        let expired_keys: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| match &entry.value().state {
                EntryState::Resolved(cached) => !cached.is_valid(),
                EntryState::Errored { .. } => true,
                EntryState::Pending(_) => false,
            })
            .map(|entry| entry.key().clone())
            .collect();

        let expired_count = expired_keys.len();

        for key in expired_keys {
            self.entries.remove(&key);
        }

        log::debug!("Evicted {} expired cache entries", expired_count);
    }

    /// Remove oldest entries when at capacity. Returns how many were removed.
    fn evict_oldest(&self) -> usize {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter_map(|entry| match &entry.value().state {
                EntryState::Resolved(cached) => Some((entry.key().clone(), cached.created_at)),
                EntryState::Errored { at, .. } => Some((entry.key().clone(), *at)),
                EntryState::Pending(_) => None,
            })
            .collect();

        // Sort by creation time (oldest first)
        entries.sort_by_key(|(_, created_at)| *created_at);

        // Remove oldest 25% of entries
        let to_remove = (self.config.max_entries / 4).max(1);
        let mut removed = 0;
        for (key, _) in entries.into_iter().take(to_remove) {
            // an entry may have turned pending since the scan
            if self
                .entries
                .remove_if(&key, |_, entry| !matches!(entry.state, EntryState::Pending(_)))
                .is_some()
            {
                removed += 1;
            }
        }

        log::debug!("Evicted {} oldest cache entries", removed);
        removed
    }

    fn ensure_capacity(&self) {
        if self.entries.len() >= self.config.max_entries {
            self.evict_expired();

            if self.entries.len() >= self.config.max_entries {
                self.evict_oldest();
            }
        }
    }

    /// Clear all stored results. Fetches still in flight keep their entries.
    pub fn clear(&self) {
        self.entries
            .retain(|_, entry| matches!(entry.state, EntryState::Pending(_)));
        log::info!("Cache cleared");
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            max_entries: self.config.max_entries,
            ..CacheStats::default()
        };

        for entry in self.entries.iter() {
            stats.total_entries += 1;
            match &entry.value().state {
                EntryState::Resolved(cached) if cached.is_valid() => stats.valid_entries += 1,
                EntryState::Resolved(_) => stats.expired_entries += 1,
                EntryState::Pending(_) => stats.pending_entries += 1,
                EntryState::Errored { .. } => stats.errored_entries += 1,
            }
        }

        stats
    }

    /// Get statistics about in-flight fetches
    pub fn deduplication_stats(&self) -> DeduplicationStats {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.value().state {
                EntryState::Pending(in_flight) => Some(in_flight.waiter_count()),
                _ => None,
            })
            .fold(DeduplicationStats::default(), |mut stats, waiters| {
                stats.pending_requests += 1;
                stats.total_waiters += waiters;
                stats
            })
    }
}

/// Owner side of an in-flight fetch. If the owning future is dropped before
/// completing, the pending entry is removed so that waiters fail fast with
/// `SenderDropped` and the next caller starts a fresh fetch.
///
/// The guard only ever touches the entry while it is still pending for its
/// own `fetch_id`; an entry taken over by another caller is left alone.
struct PendingGuard<'a> {
    cache: &'a QueryCache,
    key: CacheKey,
    fetch_id: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    fn complete(mut self, result: &Result<CachedData>) {
        self.armed = false;

        let state = match result {
            Ok(data) => EntryState::Resolved(CachedResult::new(
                data.clone(),
                self.cache.config.stale_time,
            )),
            Err(error) => {
                log::warn!("Fetch failed for key: {:?}: {}", self.key, error);
                EntryState::Errored {
                    error: error.clone(),
                    at: Utc::now(),
                }
            }
        };

        // must not hold an entry guard while evicting
        self.cache.ensure_capacity();

        let previous = match self.cache.entries.get_mut(&self.key) {
            Some(mut entry) => match &entry.state {
                EntryState::Pending(in_flight) if in_flight.id() != self.fetch_id => {
                    log::debug!("Fetch for key {:?} was taken over, result not stored", self.key);
                    None
                }
                _ => Some(std::mem::replace(&mut entry.state, state)),
            },
            None => None,
        };

        if let Some(EntryState::Pending(in_flight)) = previous {
            in_flight.notify(&self.key, result);
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("Fetch abandoned before completion for key: {:?}", self.key);
            self.cache
                .entries
                .remove_if(&self.key, |_, entry| entry.is_pending_for(self.fetch_id));
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "graphql", derive(SimpleObject))]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub pending_entries: usize,
    pub errored_entries: usize,
    pub max_entries: usize,
}

/// Thread-safe wrapper for the cache
pub type SharedQueryCache = Arc<QueryCache>;
