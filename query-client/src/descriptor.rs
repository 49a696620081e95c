use crate::error::{Error, Result};
use getset::{CopyGetters, Getters};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

pub const DEFAULT_PAGE_SIZE: usize = 50;

lazy_static! {
    static ref COLLECTION_PATH: Regex = Regex::new(r"^[A-Za-z0-9_\-]+(/[A-Za-z0-9_\-]+)*$").unwrap();
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum FilterOp {
    #[strum(serialize = "==")]
    #[serde(rename = "==")]
    Eq,
    #[strum(serialize = "!=")]
    #[serde(rename = "!=")]
    NotEq,
    #[strum(serialize = "<")]
    #[serde(rename = "<")]
    Lt,
    #[strum(serialize = "<=")]
    #[serde(rename = "<=")]
    Lte,
    #[strum(serialize = ">")]
    #[serde(rename = ">")]
    Gt,
    #[strum(serialize = ">=")]
    #[serde(rename = ">=")]
    Gte,
    #[strum(serialize = "in")]
    #[serde(rename = "in")]
    In,
    #[strum(serialize = "array-contains")]
    #[serde(rename = "array-contains")]
    ArrayContains,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum Order {
    #[default]
    #[strum(serialize = "asc")]
    #[serde(rename = "asc")]
    Ascending,
    #[strum(serialize = "desc")]
    #[serde(rename = "desc")]
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct Filter {
    field: String,
    op: FilterOp,
    value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    fn canonical(&self) -> Value {
        json!({ "field": self.field, "op": self.op.as_ref(), "value": self.value })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct Sort {
    #[getset(get = "pub")]
    field: String,
    #[getset(get_copy = "pub")]
    order: Order,
}

/// Free-text search over a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct SearchClause {
    field: String,
    text: String,
}

/// Normalized description of a collection query.
///
/// Descriptors are immutable once built. Use [`QueryDescriptor::canonical`]
/// (or a [`CacheKey`](crate::cache::CacheKey) derived from it) whenever two
/// descriptors need to be compared: it ignores filter construction order and
/// blank search text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, CopyGetters)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    #[getset(get = "pub")]
    collection_path: String,
    #[getset(get = "pub")]
    filters: Vec<Filter>,
    #[getset(get = "pub")]
    sort: Option<Sort>,
    #[getset(get = "pub")]
    search: Option<SearchClause>,
    #[getset(get_copy = "pub")]
    page_size: usize,
}

impl QueryDescriptor {
    pub fn builder(collection_path: impl Into<String>) -> QueryDescriptorBuilder {
        QueryDescriptorBuilder {
            collection_path: collection_path.into(),
            filters: vec![],
            sort: None,
            search: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Search text if a search clause is present and not blank.
    pub fn search_text(&self) -> Option<&str> {
        self.search
            .as_ref()
            .map(|search| search.text.trim())
            .filter(|text| !text.is_empty())
    }

    /// Copy of this descriptor with the search clause text replaced. The
    /// text is stored trimmed, as the store receives it.
    ///
    /// Descriptors without a search clause are returned unchanged.
    pub fn with_search_text(&self, text: impl Into<String>) -> Self {
        let text: String = text.into();
        let mut descriptor = self.clone();
        if let Some(search) = descriptor.search.as_mut() {
            search.text = text.trim().to_string();
        }
        descriptor
    }

    /// Stable serialization used for cache keys and live channel identity.
    pub fn canonical(&self) -> String {
        self.canonical_value(true).to_string()
    }

    /// Canonical form without the page-size dimension. Live channels always
    /// observe the whole matching set, so page size must not split them.
    pub fn live_view(&self) -> String {
        self.canonical_value(false).to_string()
    }

    fn canonical_value(&self, include_page_size: bool) -> Value {
        // serde_json's default map is ordered, so object keys come out sorted
        let mut filters: Vec<Value> = self.filters.iter().map(Filter::canonical).collect();
        filters.sort_by_cached_key(|filter| filter.to_string());

        let mut map = Map::new();
        map.insert("collectionPath".into(), json!(self.collection_path));
        map.insert("filters".into(), Value::Array(filters));
        if let Some(sort) = &self.sort {
            map.insert(
                "sort".into(),
                json!({ "field": sort.field, "order": sort.order.as_ref() }),
            );
        }
        if let (Some(search), Some(text)) = (&self.search, self.search_text()) {
            map.insert(
                "search".into(),
                json!({ "field": search.field, "text": text }),
            );
        }
        if include_page_size {
            map.insert("pageSize".into(), json!(self.page_size));
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone)]
pub struct QueryDescriptorBuilder {
    collection_path: String,
    filters: Vec<Filter>,
    sort: Option<Sort>,
    search: Option<SearchClause>,
    page_size: usize,
}

impl QueryDescriptorBuilder {
    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.sort = Some(Sort {
            field: field.into(),
            order,
        });
        self
    }

    pub fn search(mut self, field: impl Into<String>, text: impl Into<String>) -> Self {
        let text: String = text.into();
        self.search = Some(SearchClause {
            field: field.into(),
            text: text.trim().to_string(),
        });
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn build(self) -> Result<QueryDescriptor> {
        if !COLLECTION_PATH.is_match(&self.collection_path) {
            return Err(Error::InvalidDescriptor(format!(
                "collection path {:?} is not a slash separated list of names",
                self.collection_path
            )));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidDescriptor("page size must be positive".into()));
        }
        if let Some(filter) = self.filters.iter().find(|filter| filter.field.is_empty()) {
            return Err(Error::InvalidDescriptor(format!(
                "filter {} has an empty field name",
                filter.op
            )));
        }

        Ok(QueryDescriptor {
            collection_path: self.collection_path,
            filters: self.filters,
            sort: self.sort,
            search: self.search,
            page_size: self.page_size,
        })
    }
}
