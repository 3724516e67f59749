//! Runtime configuration.
//!
//! Every tunable of the reconciliation loop lives here so tests can shrink
//! intervals and hosts can rename storage keys without touching the engine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::StoreError;

pub const DEFAULT_TEMPLATE: &str = "{name}'s Library";
pub const LEGACY_COLLECTION_NAME: &str = "Family Shared";

/// Upper bound for the lender cache TTL (one year).
pub const MAX_LENDER_CACHE_TTL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageKeys {
    pub lender_cache: String,
    pub collection_names: String,
    pub owner_overrides: String,
    pub template: String,
    pub owner_names: String,
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            lender_cache: "sfs.lenderCache.v1".to_string(),
            collection_names: "sfs.collectionNames.v1".to_string(),
            owner_overrides: "sfs.ownerNameOverrides.v1".to_string(),
            template: "sfs.collectionTemplate.v1".to_string(),
            owner_names: "sfs.ownerNames.v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub min_run_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub lender_cache_ttl_secs: u64,
    pub lookup_concurrency: usize,
    pub add_batch_size: usize,
    pub settle_delay_ms: u64,
    pub legacy_collection_name: String,
    pub default_template: String,
    pub relevant_paths: Vec<String>,
    pub storage_keys: StorageKeys,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_run_interval_ms: 15_000,
            tick_interval_ms: 1_500,
            lender_cache_ttl_secs: 6 * 60 * 60,
            lookup_concurrency: 8,
            add_batch_size: 100,
            settle_delay_ms: 750,
            legacy_collection_name: LEGACY_COLLECTION_NAME.to_string(),
            default_template: DEFAULT_TEMPLATE.to_string(),
            relevant_paths: vec![
                "/library".to_string(),
                "/library/home".to_string(),
                "/library/collections".to_string(),
            ],
            storage_keys: StorageKeys::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        let config: SyncConfig = serde_yaml::from_str(raw)?;
        Ok(config.clamped())
    }

    /// Reads a YAML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw).map_err(|e| StoreError::Backend(format!("invalid config: {e}")))
    }

    /// Like [`SyncConfig::load`] but never fails.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "falling back to default config");
                Self::default()
            }
        }
    }

    fn clamped(mut self) -> Self {
        self.lookup_concurrency = self.lookup_concurrency.max(1);
        self.add_batch_size = self.add_batch_size.max(1);
        self.lender_cache_ttl_secs = self.lender_cache_ttl_secs.min(MAX_LENDER_CACHE_TTL_SECS);
        if self.default_template.trim().is_empty() {
            self.default_template = DEFAULT_TEMPLATE.to_string();
        }
        self
    }

    pub fn min_run_interval(&self) -> Duration {
        Duration::from_millis(self.min_run_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn lender_cache_ttl(&self) -> chrono::Duration {
        // bounded here too: configs built in code skip `clamped`
        let secs = self.lender_cache_ttl_secs.min(MAX_LENDER_CACHE_TTL_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// Exact match, or a sub-path of one of the configured paths.
    pub fn is_relevant_path(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        self.relevant_paths.iter().any(|p| {
            let p = p.trim_end_matches('/');
            path == p || path.strip_prefix(p).is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.min_run_interval(), Duration::from_secs(15));
        assert_eq!(config.tick_interval(), Duration::from_millis(1500));
        assert_eq!(config.lender_cache_ttl(), chrono::Duration::hours(6));
        assert_eq!(config.lookup_concurrency, 8);
        assert_eq!(config.add_batch_size, 100);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = SyncConfig::from_yaml_str("min_run_interval_ms: 10\nlookup_concurrency: 0\n").unwrap();
        assert_eq!(config.min_run_interval_ms, 10);
        assert_eq!(config.lookup_concurrency, 1);
        assert_eq!(config.add_batch_size, 100);
        assert_eq!(config.storage_keys, StorageKeys::default());
    }

    #[test]
    fn test_cache_ttl_is_bounded_and_never_negative() {
        let config = SyncConfig::from_yaml_str("lender_cache_ttl_secs: 18446744073709551615\n").unwrap();
        assert_eq!(config.lender_cache_ttl_secs, MAX_LENDER_CACHE_TTL_SECS);
        assert_eq!(config.lender_cache_ttl(), chrono::Duration::days(365));

        assert!(SyncConfig::from_yaml_str("lender_cache_ttl_secs: -5\n").is_err());

        let unclamped = SyncConfig {
            lender_cache_ttl_secs: u64::MAX,
            ..SyncConfig::default()
        };
        assert_eq!(unclamped.lender_cache_ttl(), chrono::Duration::days(365));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_relevant_paths() {
        let config = SyncConfig::default();
        assert!(config.is_relevant_path("/library"));
        assert!(config.is_relevant_path("/library/home/"));
        assert!(config.is_relevant_path("/library/collections/42"));
        assert!(!config.is_relevant_path("/libraryfoo"));
        assert!(!config.is_relevant_path("/store"));
    }
}
