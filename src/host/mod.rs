//! Capabilities consumed from the host application.
//!
//! The reconciler never talks to the host directly; it goes through these
//! traits. Optional capabilities report [`HostError::Unsupported`] and are
//! detected once through [`HostCapabilities`].

pub mod adapters;
pub mod memory;

pub use adapters::{detect_adapter, SnapshotAdapter};
pub use memory::{HostFixture, MemoryHost, Mutation};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::HostError;
use crate::sync_engine::types::{Collection, CollectionId, ItemId, LenderCandidate, OwnerId};

/// Bulk sharing state, as raw host JSON. `None` when the host has none yet.
#[async_trait]
pub trait SharingSnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<Option<serde_json::Value>, HostError>;
}

/// Per-item "who lent me this" query.
#[async_trait]
pub trait LenderLookup: Send + Sync {
    async fn lenders_for(&self, item: ItemId) -> Result<Vec<LenderCandidate>, HostError>;
}

/// Batch owner-name resolution. May return a partial map.
#[async_trait]
pub trait OwnerNameSource: Send + Sync {
    async fn resolve_names(
        &self,
        owner_ids: &[OwnerId],
        force_refresh: bool,
    ) -> Result<BTreeMap<OwnerId, String>, HostError>;
}

/// Gate that resolves once the host's collection store can be used.
#[async_trait]
pub trait HostReadiness: Send + Sync {
    async fn wait_ready(&self) -> Result<(), HostError>;
}

/// Source of the host's current navigation path, polled on timer ticks.
pub trait PathSource: Send + Sync {
    fn current_path(&self) -> Option<String>;
}

#[async_trait]
pub trait CollectionStore: Send + Sync {
    async fn get_by_id(&self, id: &CollectionId) -> Result<Option<Collection>, HostError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Collection>, HostError>;

    async fn create(&self, name: &str) -> Result<Collection, HostError>;

    async fn delete(&self, id: &CollectionId) -> Result<(), HostError>;

    async fn add_items(&self, id: &CollectionId, items: &[ItemId]) -> Result<(), HostError>;

    async fn remove_items(&self, id: &CollectionId, items: &[ItemId]) -> Result<(), HostError>;

    /// Rename through the collection object itself.
    async fn rename_direct(&self, _id: &CollectionId, _name: &str) -> Result<(), HostError> {
        Err(HostError::Unsupported("collection.rename"))
    }

    /// Rename through the store, addressed by ID.
    async fn rename_by_id(&self, _id: &CollectionId, _name: &str) -> Result<(), HostError> {
        Err(HostError::Unsupported("store.renameById"))
    }

    fn supports_rename_direct(&self) -> bool {
        false
    }

    fn supports_rename_by_id(&self) -> bool {
        false
    }
}

/// Everything the orchestrator needs from the host.
#[derive(Clone)]
pub struct HostBindings {
    pub collections: Arc<dyn CollectionStore>,
    pub snapshot: Arc<dyn SharingSnapshotSource>,
    pub readiness: Arc<dyn HostReadiness>,
    pub lender_lookup: Option<Arc<dyn LenderLookup>>,
    pub owner_names: Option<Arc<dyn OwnerNameSource>>,
}

impl HostBindings {
    /// Binds every capability to one in-process host.
    pub fn from_memory(host: &MemoryHost) -> Self {
        let host = Arc::new(host.clone());
        Self {
            collections: host.clone(),
            snapshot: host.clone(),
            readiness: host.clone(),
            lender_lookup: Some(host.clone()),
            owner_names: Some(host),
        }
    }

    pub fn without_lender_lookup(mut self) -> Self {
        self.lender_lookup = None;
        self
    }

    pub fn with_owner_names(mut self, names: Arc<dyn OwnerNameSource>) -> Self {
        self.owner_names = Some(names);
        self
    }

    pub fn capabilities(&self) -> HostCapabilities {
        HostCapabilities::detect(
            self.collections.as_ref(),
            self.lender_lookup.as_deref(),
            self.owner_names.as_deref(),
        )
    }
}

/// Optional capabilities, detected once when the orchestrator is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    pub rename_direct: bool,
    pub rename_by_id: bool,
    pub lender_lookup: bool,
    pub remote_names: bool,
}

impl HostCapabilities {
    pub fn detect(
        store: &dyn CollectionStore,
        lookup: Option<&dyn LenderLookup>,
        names: Option<&dyn OwnerNameSource>,
    ) -> Self {
        let caps = Self {
            rename_direct: store.supports_rename_direct(),
            rename_by_id: store.supports_rename_by_id(),
            lender_lookup: lookup.is_some(),
            remote_names: names.is_some(),
        };
        tracing::debug!(?caps, "detected host capabilities");
        caps
    }
}
