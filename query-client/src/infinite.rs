use crate::client::QueryClient;
use crate::descriptor::QueryDescriptor;
use crate::error::{Error, Result};
use crate::page::{Cursor, Page};
use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq)]
enum Progress {
    NotStarted,
    Next(Cursor),
    Exhausted,
}

/// Cursor-chained pagination over one descriptor.
///
/// Each [`fetch_next_page`](Self::fetch_next_page) resumes from the cursor the
/// previous page returned, and pages accumulate in fetch order. Once a page
/// comes back without a cursor the query is exhausted; asking for more is a
/// caller error.
pub struct InfiniteQuery<T> {
    client: QueryClient,
    descriptor: QueryDescriptor,
    pages: Vec<Page<T>>,
    progress: Progress,
}

impl<T: DeserializeOwned> InfiniteQuery<T> {
    pub(crate) fn new(client: QueryClient, descriptor: QueryDescriptor) -> Self {
        Self {
            client,
            descriptor,
            pages: vec![],
            progress: Progress::NotStarted,
        }
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub async fn fetch_next_page(&mut self) -> Result<&Page<T>> {
        let cursor = match &self.progress {
            Progress::NotStarted => None,
            Progress::Next(cursor) => Some(cursor.clone()),
            Progress::Exhausted => return Err(Error::PaginationExhausted),
        };

        // on failure progress is untouched, so the same call can be retried
        let page = self
            .client
            .fetch_next_page::<T>(&self.descriptor, cursor.as_ref())
            .await?;

        self.progress = match &page.next_cursor {
            Some(next) => Progress::Next(next.clone()),
            None => Progress::Exhausted,
        };
        log::debug!(
            "Fetched page {} of {} ({} items)",
            self.pages.len() + 1,
            self.descriptor.collection_path(),
            page.items.len()
        );
        self.pages.push(page);

        Ok(&self.pages[self.pages.len() - 1])
    }

    pub fn has_next_page(&self) -> bool {
        self.progress != Progress::Exhausted
    }

    pub fn pages(&self) -> &[Page<T>] {
        &self.pages
    }

    /// All fetched items, pages concatenated in fetch order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    /// Switch to another descriptor, e.g. when settled search text changes.
    /// Accumulated pages are dropped unless the descriptor is canonically equal.
    pub fn set_descriptor(&mut self, descriptor: QueryDescriptor) -> bool {
        if descriptor.canonical() == self.descriptor.canonical() {
            return false;
        }
        self.descriptor = descriptor;
        self.reset();
        true
    }

    /// Forget fetched pages and start again from the first page.
    pub fn reset(&mut self) {
        self.pages.clear();
        self.progress = Progress::NotStarted;
    }
}
