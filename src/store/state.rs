use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::KeyValueStore;
use crate::config::StorageKeys;
use crate::error::StoreError;
use crate::input_validation::{normalize_override, normalize_template, sanitize_collection_name};
use crate::sync_engine::types::{ItemId, LenderCache, LenderCacheEntry, OwnerId};

/// Everything a run needs from persistence, loaded in one go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub lender_cache: LenderCache,
    pub overrides: BTreeMap<OwnerId, String>,
    pub collection_names: BTreeMap<OwnerId, String>,
    pub template: String,
}

/// Typed access to the persisted maps. Malformed stored values load as empty.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    default_template: String,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, keys: StorageKeys, default_template: impl Into<String>) -> Self {
        Self {
            backend,
            keys,
            default_template: default_template.into(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.backend
    }

    async fn load_json<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        let raw = match self.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return T::default(),
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read persisted state");
                return T::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding malformed persisted state");
                T::default()
            }
        }
    }

    async fn save_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(key, &raw).await
    }

    pub async fn load_lender_cache(&self) -> LenderCache {
        // keys are item ids as strings on disk
        let raw: BTreeMap<String, serde_json::Value> = self.load_json(&self.keys.lender_cache).await;
        raw.into_iter()
            .filter_map(|(item, entry)| {
                let item: ItemId = item.trim().parse().ok()?;
                let mut entry: LenderCacheEntry = serde_json::from_value(entry).ok()?;
                entry.owner_id = entry.owner_id.trim().to_string();
                if entry.owner_id.is_empty() || entry.updated_at <= 0 {
                    return None;
                }
                entry.owner_name = entry.owner_name.and_then(|n| normalize_override(&n));
                Some((item, entry))
            })
            .collect()
    }

    pub async fn save_lender_cache(&self, cache: &LenderCache) -> Result<(), StoreError> {
        self.save_json(&self.keys.lender_cache, cache).await
    }

    pub async fn load_overrides(&self) -> BTreeMap<OwnerId, String> {
        let raw: BTreeMap<String, serde_json::Value> = self.load_json(&self.keys.owner_overrides).await;
        raw.into_iter()
            .filter_map(|(owner, name)| {
                let owner = owner.trim().to_string();
                let name = normalize_override(name.as_str()?)?;
                (!owner.is_empty()).then_some((owner, name))
            })
            .collect()
    }

    pub async fn save_overrides(&self, overrides: &BTreeMap<OwnerId, String>) -> Result<(), StoreError> {
        self.save_json(&self.keys.owner_overrides, overrides).await
    }

    pub async fn load_collection_names(&self) -> BTreeMap<OwnerId, String> {
        let raw: BTreeMap<String, serde_json::Value> = self.load_json(&self.keys.collection_names).await;
        raw.into_iter()
            .filter_map(|(owner, name)| {
                let owner = owner.trim().to_string();
                let name = sanitize_collection_name(name.as_str()?);
                (!owner.is_empty() && !name.is_empty()).then_some((owner, name))
            })
            .collect()
    }

    pub async fn save_collection_names(&self, names: &BTreeMap<OwnerId, String>) -> Result<(), StoreError> {
        self.save_json(&self.keys.collection_names, names).await
    }

    pub async fn load_template(&self) -> String {
        let raw: Option<String> = self.load_json(&self.keys.template).await;
        normalize_template(raw.as_deref().unwrap_or_default(), &self.default_template)
    }

    /// Normalizes before writing and returns what was stored.
    pub async fn save_template(&self, template: &str) -> Result<String, StoreError> {
        let normalized = normalize_template(template, &self.default_template);
        self.save_json(&self.keys.template, &normalized).await?;
        Ok(normalized)
    }

    pub async fn load_all(&self) -> PersistedState {
        PersistedState {
            lender_cache: self.load_lender_cache().await,
            overrides: self.load_overrides().await,
            collection_names: self.load_collection_names().await,
            template: self.load_template().await,
        }
    }
}
