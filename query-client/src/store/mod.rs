//! The document store the query layer talks to.
//!
//! The store executes queries and pushes live snapshots; the query layer only
//! caches, deduplicates, paginates and decodes. Documents cross this boundary
//! as raw JSON and are decoded into the caller's item type afterwards.

pub mod memory;
pub mod rest;

use crate::descriptor::QueryDescriptor;
use crate::error::StoreError;
use crate::page::{Cursor, Page};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use rest::RestStore;

/// Receives the full current result set of a live channel.
pub type SnapshotFn = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Receives the error that ended a live channel.
pub type ErrorFn = Arc<dyn Fn(StoreError) + Send + Sync>;

/// Closes a live channel. Teardown is synchronous.
pub struct Unsubscribe(Box<dyn FnOnce() + Send>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn call(self) {
        (self.0)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unsubscribe")
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one page of `descriptor`, starting at `cursor` (or the beginning).
    async fn query_page(
        &self,
        descriptor: &QueryDescriptor,
        cursor: Option<&Cursor>,
    ) -> Result<Page<Value>, StoreError>;

    async fn get_doc_by_id(&self, path: &str, id: &str) -> Result<Value, StoreError>;

    /// Open a push channel for the whole result set of `descriptor`,
    /// ignoring its page size.
    ///
    /// `on_snapshot` is called with the full result set every time it
    /// changes. `on_error` is called at most once and ends the channel.
    fn subscribe_list(
        &self,
        descriptor: &QueryDescriptor,
        on_snapshot: SnapshotFn,
        on_error: ErrorFn,
    ) -> Result<Unsubscribe, StoreError>;
}

pub type SharedDocumentStore = Arc<dyn DocumentStore>;
