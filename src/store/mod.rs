//! Key-value persistence.
//!
//! All persisted state is a string value under a string key. Backends may
//! fail; [`FallbackStore`] hides that from callers by switching to a local
//! store.

mod file_store;
mod state;

pub use file_store::JsonFileStore;
pub use state::{PersistedState, StateStore};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// In-process store, used as the local fallback and in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    writes: Arc<Mutex<Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys written so far, in write order.
    pub fn write_log(&self) -> Vec<String> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self
            .values
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .insert(key.to_string(), value.to_string());
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(key.to_string());
        }
        Ok(())
    }
}

/// Uses `primary` and silently switches to `fallback` whenever it fails.
pub struct FallbackStore {
    primary: Arc<dyn KeyValueStore>,
    fallback: Arc<dyn KeyValueStore>,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn KeyValueStore>, fallback: Arc<dyn KeyValueStore>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl KeyValueStore for FallbackStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.primary.get(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "primary store read failed, using fallback");
                self.fallback.get(key).await
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        match self.primary.set(key, value).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(key, error = %e, "primary store write failed, using fallback");
                self.fallback.set(key, value).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("offline".into()))
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.write_log(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_store_is_transparent() {
        let local = MemoryStore::new();
        let store = FallbackStore::new(Arc::new(BrokenStore), Arc::new(local.clone()));

        store.set("k", "v").await.unwrap();
        assert_eq!(local.raw("k"), Some("v".to_string()));
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_fallback_store_prefers_primary() {
        let primary = MemoryStore::new();
        let local = MemoryStore::new();
        let store = FallbackStore::new(Arc::new(primary.clone()), Arc::new(local.clone()));

        store.set("k", "v").await.unwrap();
        assert_eq!(primary.raw("k"), Some("v".to_string()));
        assert_eq!(local.raw("k"), None);
    }
}
