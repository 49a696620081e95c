use crate::cache::{CacheKey, CacheStats, CachedData, QueryCache, SharedQueryCache};
use crate::config::QueryConfig;
use crate::debounce::SearchInput;
use crate::deduplication::DeduplicationStats;
use crate::descriptor::{QueryDescriptor, QueryDescriptorBuilder};
use crate::error::{Error, Result};
use crate::infinite::InfiniteQuery;
use crate::live::{self, LiveQuery, Subscription};
use crate::page::{decode_document, decode_items, Cursor, Page};
use crate::store::SharedDocumentStore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Entry point of the query layer.
///
/// Cloning is cheap; clones share the same cache, so one client per process
/// gives process-wide deduplication.
#[derive(Clone)]
pub struct QueryClient {
    store: SharedDocumentStore,
    cache: SharedQueryCache,
    config: Arc<QueryConfig>,
}

impl QueryClient {
    /// Create a client with default settings.
    pub fn new(store: SharedDocumentStore) -> Self {
        Self::with_config(store, QueryConfig::default())
    }

    pub fn with_config(store: SharedDocumentStore, config: QueryConfig) -> Self {
        let cache = QueryCache::new(config.cache_config(), config.deduplication_config());
        log::info!(
            "Initialized QueryClient (stale time: {}s, max entries: {}, debounce: {}ms)",
            config.stale_time_secs,
            config.max_entries,
            config.debounce_ms
        );

        Self {
            store,
            cache: Arc::new(cache),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &SharedDocumentStore {
        &self.store
    }

    /// Descriptor builder preset with the configured default page size.
    pub fn descriptor(&self, collection_path: impl Into<String>) -> QueryDescriptorBuilder {
        QueryDescriptor::builder(collection_path).page_size(self.config.default_page_size)
    }

    /// Debounced search text bound to `base`, using the configured delay.
    pub fn search_input(&self, base: QueryDescriptor) -> Result<SearchInput> {
        SearchInput::new(base, self.config.debounce())
    }

    /// One-shot query: the items of the first page of `descriptor`.
    pub async fn fetch_page<T: DeserializeOwned>(&self, descriptor: &QueryDescriptor) -> Result<Vec<T>> {
        let path = descriptor.collection_path();
        let data = self
            .cache
            .get_or_fetch(CacheKey::page(descriptor), path, || async {
                self.store
                    .query_page(descriptor, None)
                    .await
                    .map(CachedData::Page)
                    .map_err(Error::Fetch)
            })
            .await?;

        decode_items(path, expect_page(path, data)?.items)
    }

    /// One page of `descriptor` starting at `cursor`. Pass `None` for the first
    /// page and the previous page's `next_cursor` afterwards.
    pub async fn fetch_next_page<T: DeserializeOwned>(
        &self,
        descriptor: &QueryDescriptor,
        cursor: Option<&Cursor>,
    ) -> Result<Page<T>> {
        let path = descriptor.collection_path();
        let data = self
            .cache
            .get_or_fetch(CacheKey::infinite_page(descriptor, cursor), path, || async {
                self.store
                    .query_page(descriptor, cursor)
                    .await
                    .map(CachedData::Page)
                    .map_err(Error::Fetch)
            })
            .await?;

        expect_page(path, data)?.decode(path)
    }

    /// Paginated view over `descriptor` that accumulates pages in fetch order.
    pub fn infinite<T: DeserializeOwned>(&self, descriptor: QueryDescriptor) -> InfiniteQuery<T> {
        InfiniteQuery::new(self.clone(), descriptor)
    }

    /// Fetch a single document. Without an id nothing is fetched and `Ok(None)`
    /// is returned: the document is simply not available yet.
    pub async fn fetch_by_id<T: DeserializeOwned>(&self, path: &str, id: Option<&str>) -> Result<Option<T>> {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            log::debug!("Skipping fetch from {}: no id yet", path);
            return Ok(None);
        };

        let data = self
            .cache
            .get_or_fetch(CacheKey::document(path, id), path, || async {
                self.store
                    .get_doc_by_id(path, id)
                    .await
                    .map(CachedData::Document)
                    .map_err(Error::Fetch)
            })
            .await?;

        match data {
            CachedData::Document(document) => decode_document(path, document).map(Some),
            CachedData::Page(_) => Err(mismatch(path)),
        }
    }

    /// Open a live channel. `on_data` receives the full result set on every
    /// change; `on_error` is called at most once, after which the channel is
    /// dead. Dropping the returned [`Subscription`] closes the channel.
    pub fn subscribe<T, D, E>(&self, descriptor: &QueryDescriptor, on_data: D, on_error: E) -> Result<Subscription>
    where
        T: DeserializeOwned + 'static,
        D: Fn(Vec<T>) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        live::open_channel(&self.store, descriptor, on_data, on_error)
    }

    /// Live query bound to one call site; see [`LiveQuery`].
    pub fn live<T>(&self, descriptor: QueryDescriptor) -> Result<LiveQuery<T>>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        LiveQuery::open(self, descriptor)
    }

    /// Drop cached results of a collection, e.g. after writing to it.
    pub fn invalidate_collection(&self, collection_path: &str) -> usize {
        self.cache.invalidate_collection(collection_path)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn deduplication_stats(&self) -> DeduplicationStats {
        self.cache.deduplication_stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn evict_expired_cache(&self) {
        self.cache.evict_expired();
    }
}

fn expect_page(path: &str, data: CachedData) -> Result<Page<Value>> {
    match data {
        CachedData::Page(page) => Ok(page),
        CachedData::Document(_) => Err(mismatch(path)),
    }
}

fn mismatch(path: &str) -> Error {
    Error::Decode {
        path: path.to_string(),
        message: "cached entry has the wrong kind".into(),
    }
}
