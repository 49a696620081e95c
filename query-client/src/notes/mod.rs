//! Notes kept on the device, outside the document store.

mod kv;

use crate::cache::digest;
use crate::error::{Error, Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use kv::{FileKeyValueStore, MemoryKeyValueStore};

pub const NOTES_KEY: &str = "notes";

/// Local string key-value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Notes persisted as one JSON array under a single key.
pub struct NotesCache<S> {
    store: S,
    key: String,
}

impl<S: KeyValueStore> NotesCache<S> {
    pub fn new(store: S) -> Self {
        Self::with_key(store, NOTES_KEY)
    }

    pub fn with_key(store: S, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// All notes, newest first.
    pub async fn list(&self) -> Result<Vec<Note>> {
        let Some(raw) = self.store.get(&self.key).await.map_err(storage)? else {
            return Ok(vec![]);
        };
        serde_json::from_str(&raw).map_err(|err| Error::Storage(err.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Note>> {
        Ok(self.list().await?.into_iter().find(|note| note.id == id))
    }

    pub async fn add(&self, title: impl Into<String>, body: impl Into<String>) -> Result<Note> {
        let mut notes = self.list().await?;
        let now = Utc::now();
        let title = title.into();
        let nanos = now.timestamp_nanos_opt().unwrap_or_default().to_string();
        let count = notes.len().to_string();
        let id = digest(&[nanos.as_str(), title.as_str(), count.as_str()])[..16].to_string();

        let note = Note {
            id,
            title,
            body: body.into(),
            created_at: now,
            updated_at: now,
        };
        notes.insert(0, note.clone());
        self.save(&notes).await?;
        log::debug!("Added note {}", note.id);
        Ok(note)
    }

    /// Replace title and body of an existing note. `None` if no such note.
    pub async fn update(
        &self,
        id: &str,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Option<Note>> {
        let mut notes = self.list().await?;
        let Some(note) = notes.iter_mut().find(|note| note.id == id) else {
            return Ok(None);
        };
        note.title = title.into();
        note.body = body.into();
        note.updated_at = Utc::now();
        let updated = note.clone();

        self.save(&notes).await?;
        Ok(Some(updated))
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut notes = self.list().await?;
        let before = notes.len();
        notes.retain(|note| note.id != id);
        if notes.len() == before {
            return Ok(false);
        }
        self.save(&notes).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.remove(&self.key).await.map_err(storage)
    }

    async fn save(&self, notes: &[Note]) -> Result<()> {
        let raw = serde_json::to_string(notes).map_err(|err| Error::Storage(err.to_string()))?;
        self.store.set(&self.key, &raw).await.map_err(storage)
    }
}

fn storage(err: StoreError) -> Error {
    Error::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notes_lifecycle() {
        let notes = NotesCache::new(MemoryKeyValueStore::new());
        assert!(notes.list().await.unwrap().is_empty());

        let first = notes.add("Groceries", "milk").await.unwrap();
        let second = notes.add("Ideas", "").await.unwrap();
        assert_ne!(first.id, second.id);

        let listed = notes.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);

        let updated = notes
            .update(&first.id, "Groceries", "milk, eggs")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.body, "milk, eggs");
        assert!(updated.updated_at >= updated.created_at);
        assert_eq!(notes.get(&first.id).await.unwrap(), Some(updated));

        assert!(notes.update("missing", "x", "y").await.unwrap().is_none());
        assert!(notes.remove(&second.id).await.unwrap());
        assert!(!notes.remove(&second.id).await.unwrap());

        notes.clear().await.unwrap();
        assert!(notes.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_a_storage_error() {
        let store = MemoryKeyValueStore::new();
        store.set(NOTES_KEY, "{not json").await.unwrap();
        let notes = NotesCache::new(store);

        assert!(matches!(notes.list().await, Err(Error::Storage(_))));
    }
}
