use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque continuation token issued by the document store.
///
/// The query layer only stores and forwards cursors; it never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(Value);

impl Cursor {
    pub fn new(token: impl Into<Value>) -> Self {
        Self(token.into())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// One page of results. `next_cursor == None` means there are no further pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<Cursor>) -> Self {
        Self { items, next_cursor }
    }

    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

impl Page<Value> {
    /// Decode raw store documents into the collection's item type.
    pub fn decode<T: DeserializeOwned>(self, path: &str) -> Result<Page<T>> {
        Ok(Page {
            items: decode_items(path, self.items)?,
            next_cursor: self.next_cursor,
        })
    }
}

pub(crate) fn decode_document<T: DeserializeOwned>(path: &str, document: Value) -> Result<T> {
    serde_json::from_value(document).map_err(|err| Error::Decode {
        path: path.to_string(),
        message: err.to_string(),
    })
}

pub(crate) fn decode_items<T: DeserializeOwned>(path: &str, documents: Vec<Value>) -> Result<Vec<T>> {
    documents
        .into_iter()
        .map(|document| decode_document(path, document))
        .collect()
}
