use crate::cache::CacheConfig;
use crate::deduplication::DeduplicationConfig;
use crate::error::{Error, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "COLLECTION_QUERY_";

/// Settings for the query layer, passed explicitly to [`QueryClient`](crate::QueryClient).
#[serde_inline_default]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Settle delay for typed search text.
    #[serde_inline_default(300)]
    pub debounce_ms: u64,
    #[serde_inline_default(50)]
    pub default_page_size: usize,
    /// Freshness window of cached results.
    #[serde_inline_default(60)]
    pub stale_time_secs: i64,
    #[serde_inline_default(1000)]
    pub max_entries: usize,
    #[serde_inline_default(30)]
    pub request_timeout_secs: i64,
    #[serde_inline_default(true)]
    pub cache_enabled: bool,
    #[serde_inline_default(true)]
    pub deduplication_enabled: bool,
    /// Poll period of live channels on backends without push.
    #[serde_inline_default(2000)]
    pub poll_interval_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            default_page_size: 50,
            stale_time_secs: 60,
            max_entries: 1000,
            request_timeout_secs: 30,
            cache_enabled: true,
            deduplication_enabled: true,
            poll_interval_ms: 2000,
        }
    }
}

impl QueryConfig {
    /// Defaults, overridden by the YAML file at `path` (if given), overridden
    /// by `COLLECTION_QUERY_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(QueryConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }

        let config: QueryConfig = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|err| Error::Config(err.to_string()))?;
        config.validated()
    }

    pub fn validated(self) -> Result<Self> {
        if self.default_page_size == 0 {
            return Err(Error::Config("default_page_size must be positive".into()));
        }
        if self.max_entries == 0 {
            return Err(Error::Config("max_entries must be positive".into()));
        }
        if self.stale_time_secs < 0 {
            return Err(Error::Config("stale_time_secs must not be negative".into()));
        }
        if self.request_timeout_secs <= 0 {
            return Err(Error::Config("request_timeout_secs must be positive".into()));
        }
        Ok(self)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            stale_time: chrono::Duration::seconds(self.stale_time_secs),
            max_entries: self.max_entries,
            enabled: self.cache_enabled,
        }
    }

    pub fn deduplication_config(&self) -> DeduplicationConfig {
        DeduplicationConfig {
            request_timeout: chrono::Duration::seconds(self.request_timeout_secs),
            enabled: self.deduplication_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempdir::TempDir;

    #[test]
    fn test_partial_documents_fill_defaults() {
        let config: QueryConfig =
            serde_json::from_value(serde_json::json!({ "debounce_ms": 150 })).unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(150));
        assert_eq!(
            config,
            QueryConfig {
                debounce_ms: 150,
                ..QueryConfig::default()
            }
        );
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = TempDir::new("query-config").unwrap();
        let path = dir.path().join("query.yaml");
        fs::write(&path, "stale_time_secs: 5\nmax_entries: 10\ncache_enabled: false\n").unwrap();

        let config = QueryConfig::load(Some(&path)).unwrap();
        assert_eq!(config.cache_config().stale_time, chrono::Duration::seconds(5));
        assert_eq!(config.cache_config().max_entries, 10);
        assert!(!config.cache_config().enabled);
        assert_eq!(config.default_page_size, 50);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new("query-config").unwrap();
        let path = dir.path().join("query.yaml");
        fs::write(&path, "default_page_size: 0\n").unwrap();

        assert!(matches!(QueryConfig::load(Some(&path)), Err(Error::Config(_))));
        assert!(QueryConfig {
            request_timeout_secs: 0,
            ..QueryConfig::default()
        }
        .validated()
        .is_err());
    }
}
