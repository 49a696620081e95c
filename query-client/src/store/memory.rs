use super::{DocumentStore, ErrorFn, SnapshotFn, Unsubscribe};
use crate::descriptor::{Filter, FilterOp, Order, QueryDescriptor};
use crate::error::StoreError;
use crate::page::{Cursor, Page};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

#[derive(Clone)]
struct Listener {
    descriptor: QueryDescriptor,
    on_snapshot: SnapshotFn,
    on_error: ErrorFn,
}

/// Reference document store kept entirely in memory.
///
/// Documents live in collections keyed by path and are returned in id order
/// unless the query sorts. Cursors are offsets into the evaluated result.
/// Live channels receive a snapshot on subscribe and after every write to
/// their collection.
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, BTreeMap<String, Value>>,
    listeners: Arc<DashMap<u64, Listener>>,
    next_listener: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document. Object documents get their `id` field set.
    pub fn insert(&self, path: &str, id: &str, mut document: Value) {
        if let Value::Object(map) = &mut document {
            map.insert("id".into(), Value::String(id.to_string()));
        }
        self.collections
            .entry(path.to_string())
            .or_default()
            .insert(id.to_string(), document);
        self.notify(path);
    }

    pub fn remove(&self, path: &str, id: &str) -> Option<Value> {
        let removed = self
            .collections
            .get_mut(path)
            .and_then(|mut collection| collection.remove(id));
        if removed.is_some() {
            self.notify(path);
        }
        removed
    }

    pub fn len(&self, path: &str) -> usize {
        self.collections
            .get(path)
            .map_or(0, |collection| collection.len())
    }

    pub fn is_empty(&self, path: &str) -> bool {
        self.len(path) == 0
    }

    /// Number of live channels currently open.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// End every open channel with `error`, as a dropped backend connection would.
    pub fn fail_channels(&self, error: StoreError) {
        let ids: Vec<u64> = self.listeners.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, listener)) = self.listeners.remove(&id) {
                (listener.on_error)(error.clone());
            }
        }
    }

    fn evaluate(&self, descriptor: &QueryDescriptor) -> Vec<Value> {
        let Some(collection) = self.collections.get(descriptor.collection_path()) else {
            return vec![];
        };

        let search = descriptor
            .search()
            .as_ref()
            .zip(descriptor.search_text())
            .map(|(clause, text)| (clause.field().clone(), text.to_lowercase()));

        let mut documents: Vec<Value> = collection
            .values()
            .filter(|document| descriptor.filters().iter().all(|filter| matches(document, filter)))
            .filter(|document| match &search {
                Some((field, text)) => field_value(document, field)
                    .and_then(Value::as_str)
                    .is_some_and(|value| value.to_lowercase().contains(text.as_str())),
                None => true,
            })
            .cloned()
            .collect();
        drop(collection);

        if let Some(sort) = descriptor.sort() {
            documents.sort_by(|a, b| {
                let ordering = sort_order(field_value(a, sort.field()), field_value(b, sort.field()));
                match sort.order() {
                    Order::Ascending => ordering,
                    Order::Descending => ordering.reverse(),
                }
            });
        }

        documents
    }

    fn notify(&self, path: &str) {
        // collect first: callbacks may unsubscribe, which writes to the map
        let listeners: Vec<Listener> = self
            .listeners
            .iter()
            .filter(|entry| entry.value().descriptor.collection_path() == path)
            .map(|entry| entry.value().clone())
            .collect();

        for listener in listeners {
            (listener.on_snapshot)(self.evaluate(&listener.descriptor));
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn query_page(
        &self,
        descriptor: &QueryDescriptor,
        cursor: Option<&Cursor>,
    ) -> Result<Page<Value>, StoreError> {
        let offset = match cursor {
            None => 0,
            Some(cursor) => cursor.as_value().as_u64().ok_or_else(|| StoreError::Rejected {
                status: 400,
                message: format!("malformed cursor {}", cursor.as_value()),
            })? as usize,
        };

        let documents = self.evaluate(descriptor);
        let end = (offset + descriptor.page_size()).min(documents.len());
        let items = documents.get(offset..end).map(<[Value]>::to_vec).unwrap_or_default();
        let next_cursor = (end < documents.len()).then(|| Cursor::new(end as u64));

        Ok(Page::new(items, next_cursor))
    }

    async fn get_doc_by_id(&self, path: &str, id: &str) -> Result<Value, StoreError> {
        self.collections
            .get(path)
            .and_then(|collection| collection.get(id).cloned())
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_string(),
                id: id.to_string(),
            })
    }

    fn subscribe_list(
        &self,
        descriptor: &QueryDescriptor,
        on_snapshot: SnapshotFn,
        on_error: ErrorFn,
    ) -> Result<Unsubscribe, StoreError> {
        let id = self.next_listener.fetch_add(1, AtomicOrdering::SeqCst);
        self.listeners.insert(
            id,
            Listener {
                descriptor: descriptor.clone(),
                on_snapshot: on_snapshot.clone(),
                on_error,
            },
        );
        on_snapshot(self.evaluate(descriptor));

        let listeners = Arc::downgrade(&self.listeners);
        Ok(Unsubscribe::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.remove(&id);
            }
        }))
    }
}

/// Resolve a dotted field path such as `address.city`.
fn field_value<'a>(document: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(document, |value, segment| value.get(segment))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (a, b) if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

fn equals(a: &Value, b: &Value) -> bool {
    compare(a, b) == Some(Ordering::Equal)
}

fn matches(document: &Value, filter: &Filter) -> bool {
    let Some(actual) = field_value(document, filter.field()) else {
        return false;
    };
    let expected = filter.value();

    match filter.op() {
        FilterOp::Eq => equals(actual, expected),
        FilterOp::NotEq => !equals(actual, expected),
        FilterOp::Lt => compare(actual, expected) == Some(Ordering::Less),
        FilterOp::Lte => matches!(compare(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        FilterOp::Gt => compare(actual, expected) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::In => expected
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|candidate| equals(actual, candidate))),
        FilterOp::ArrayContains => actual
            .as_array()
            .is_some_and(|values| values.iter().any(|value| equals(value, expected))),
    }
}

/// Total order used for sorting: missing < null < bool < number < string < other.
fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }

    match (a, b) {
        (Some(a), Some(b)) => compare(a, b).unwrap_or_else(|| rank(Some(a)).cmp(&rank(Some(b)))),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert("shops", "a", json!({"name": "Cat Cafe", "rating": 5, "tags": ["coffee"]}));
        store.insert("shops", "b", json!({"name": "Bakery", "rating": 3, "tags": ["bread"]}));
        store.insert("shops", "c", json!({"name": "Catnip", "rating": 4, "tags": ["pets", "coffee"]}));
        store
    }

    fn ids(documents: &[Value]) -> Vec<&str> {
        documents
            .iter()
            .map(|document| document["id"].as_str().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_pages_follow_offset_cursors() {
        let store = seeded();
        let descriptor = QueryDescriptor::builder("shops").page_size(2).build().unwrap();

        let first = store.query_page(&descriptor, None).await.unwrap();
        assert_eq!(ids(&first.items), vec!["a", "b"]);
        let second = store
            .query_page(&descriptor, first.next_cursor.as_ref())
            .await
            .unwrap();
        assert_eq!(ids(&second.items), vec!["c"]);
        assert!(second.is_last());
    }

    #[tokio::test]
    async fn test_filters_sort_and_search() {
        let store = seeded();
        let descriptor = QueryDescriptor::builder("shops")
            .filter("tags", FilterOp::ArrayContains, "coffee")
            .filter("rating", FilterOp::Gte, 4)
            .order_by("rating", Order::Ascending)
            .build()
            .unwrap();
        let page = store.query_page(&descriptor, None).await.unwrap();
        assert_eq!(ids(&page.items), vec!["c", "a"]);

        let search = QueryDescriptor::builder("shops")
            .search("name", "CAT")
            .order_by("name", Order::Descending)
            .build()
            .unwrap();
        let page = store.query_page(&search, None).await.unwrap();
        assert_eq!(ids(&page.items), vec!["c", "a"]);

        let within = QueryDescriptor::builder("shops")
            .filter("id", FilterOp::In, json!(["b", "z"]))
            .build()
            .unwrap();
        let page = store.query_page(&within, None).await.unwrap();
        assert_eq!(ids(&page.items), vec!["b"]);
    }

    #[tokio::test]
    async fn test_get_doc_by_id() {
        let store = seeded();
        assert_eq!(store.get_doc_by_id("shops", "b").await.unwrap()["name"], "Bakery");
        assert!(matches!(
            store.get_doc_by_id("shops", "zzz").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_live_channel_pushes_full_snapshots() {
        let store = seeded();
        let descriptor = QueryDescriptor::builder("shops")
            .filter("rating", FilterOp::Gt, 3)
            .page_size(1)
            .build()
            .unwrap();
        let snapshots = Arc::new(Mutex::new(Vec::<usize>::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let sink = snapshots.clone();
        let error_sink = errors.clone();
        let unsubscribe = store
            .subscribe_list(
                &descriptor,
                Arc::new(move |documents| sink.lock().unwrap().push(documents.len())),
                Arc::new(move |err| error_sink.lock().unwrap().push(err)),
            )
            .unwrap();

        store.insert("shops", "d", json!({"name": "Deli", "rating": 4}));
        store.insert("other", "x", json!({}));
        assert_eq!(*snapshots.lock().unwrap(), vec![2, 3]);

        unsubscribe.call();
        assert_eq!(store.listener_count(), 0);
        store.remove("shops", "d");
        assert_eq!(snapshots.lock().unwrap().len(), 2);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fail_channels_reports_once_and_closes() {
        let store = seeded();
        let descriptor = QueryDescriptor::builder("shops").build().unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let error_sink = errors.clone();

        let _unsubscribe = store
            .subscribe_list(
                &descriptor,
                Arc::new(|_| {}),
                Arc::new(move |err| error_sink.lock().unwrap().push(err)),
            )
            .unwrap();

        store.fail_channels(StoreError::ChannelClosed);
        store.fail_channels(StoreError::ChannelClosed);
        assert_eq!(*errors.lock().unwrap(), vec![StoreError::ChannelClosed]);
        assert_eq!(store.listener_count(), 0);
    }
}
