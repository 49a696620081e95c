//! Debounced, cached, cursor-paginated and live queries over a document store.

pub mod cache;
mod client;
pub mod config;
pub mod debounce;
pub mod deduplication;
pub mod descriptor;
mod error;
mod infinite;
pub mod live;
pub mod notes;
mod page;
pub mod store;


pub use cache::{CacheConfig, CacheKey, CacheStats, QueryCache, SharedQueryCache};
pub use client::QueryClient;
pub use config::QueryConfig;
pub use debounce::{Debouncer, SearchInput};
pub use deduplication::{DeduplicationConfig, DeduplicationError, DeduplicationStats};
pub use descriptor::{Filter, FilterOp, Order, QueryDescriptor, QueryDescriptorBuilder, SearchClause, Sort};
pub use error::{Error, Result, StoreError};
pub use infinite::InfiniteQuery;
pub use live::{LiveQuery, LiveSnapshot, Subscription};
pub use notes::{KeyValueStore, Note, NotesCache};
pub use page::{Cursor, Page};
pub use store::{DocumentStore, MemoryStore, RestStore, SharedDocumentStore};
