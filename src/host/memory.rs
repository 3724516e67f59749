//! In-process host: collections, sharing snapshot, lender answers and owner
//! names held in memory, with a journal of every mutating call.
//!
//! Backs the CLI's fixture mode and the test suite.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use super::{CollectionStore, HostReadiness, LenderLookup, OwnerNameSource, SharingSnapshotSource};
use crate::error::HostError;
use crate::sync_engine::types::{Collection, CollectionId, ItemId, LenderCandidate, OwnerId, RenameMethod};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Mutation {
    Create { id: CollectionId, name: String },
    Rename { id: CollectionId, name: String, method: RenameMethod },
    Delete { id: CollectionId },
    Add { id: CollectionId, items: Vec<ItemId> },
    Remove { id: CollectionId, items: Vec<ItemId> },
}

/// Serializable host state, as read and written by the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostFixture {
    pub snapshot: Option<serde_json::Value>,
    pub collections: Vec<Collection>,
    pub lenders: BTreeMap<ItemId, Vec<LenderCandidate>>,
    pub owner_names: BTreeMap<OwnerId, String>,
    pub rename_direct: bool,
    pub rename_by_id: bool,
}

#[derive(Debug, Default)]
struct HostState {
    snapshot: Option<serde_json::Value>,
    collections: BTreeMap<CollectionId, Collection>,
    next_id: u64,
    lenders: BTreeMap<ItemId, Vec<LenderCandidate>>,
    failing_items: BTreeSet<ItemId>,
    owner_names: BTreeMap<OwnerId, String>,
    names_fail: bool,
    deletes_fail: bool,
    journal: Vec<Mutation>,
}

#[derive(Debug, Default)]
struct CallStats {
    lookups: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    name_calls: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default)]
struct RenameConfig {
    direct: bool,
    by_id: bool,
    /// Renames report success but leave the name unchanged.
    silent_noop: bool,
}

#[derive(Clone, Default)]
pub struct MemoryHost {
    state: Arc<Mutex<HostState>>,
    stats: Arc<CallStats>,
    rename: RenameConfig,
    lookup_delay: Option<Duration>,
    snapshot_gate: Option<Arc<Notify>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: HostFixture) -> Self {
        let host = Self::new().with_rename(fixture.rename_direct, fixture.rename_by_id);
        {
            let mut state = host.lock();
            state.snapshot = fixture.snapshot;
            state.lenders = fixture.lenders;
            state.owner_names = fixture.owner_names;
            for collection in fixture.collections {
                state.collections.insert(collection.id.clone(), collection);
            }
            state.next_id = state.collections.len() as u64;
        }
        host
    }

    pub fn to_fixture(&self) -> HostFixture {
        let state = self.lock();
        HostFixture {
            snapshot: state.snapshot.clone(),
            collections: state.collections.values().cloned().collect(),
            lenders: state.lenders.clone(),
            owner_names: state.owner_names.clone(),
            rename_direct: self.rename.direct,
            rename_by_id: self.rename.by_id,
        }
    }

    pub fn with_rename(mut self, direct: bool, by_id: bool) -> Self {
        self.rename.direct = direct;
        self.rename.by_id = by_id;
        self
    }

    pub fn with_silent_rename_noop(mut self) -> Self {
        self.rename.silent_noop = true;
        self
    }

    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = Some(delay);
        self
    }

    /// Every snapshot read waits for one `notify_one` on the returned handle.
    pub fn with_snapshot_gate(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.snapshot_gate = Some(gate.clone());
        (self, gate)
    }

    // A poisoned lock only means another test thread panicked; keep going.
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_snapshot(&self, snapshot: serde_json::Value) {
        self.lock().snapshot = Some(snapshot);
    }

    pub fn set_lenders(&self, item: ItemId, lenders: Vec<LenderCandidate>) {
        self.lock().lenders.insert(item, lenders);
    }

    pub fn fail_lookup(&self, item: ItemId) {
        self.lock().failing_items.insert(item);
    }

    pub fn set_owner_name(&self, owner: &str, name: &str) {
        self.lock().owner_names.insert(owner.to_string(), name.to_string());
    }

    pub fn fail_names(&self) {
        self.lock().names_fail = true;
    }

    pub fn fail_deletes(&self) {
        self.lock().deletes_fail = true;
    }

    /// Inserts a collection without journaling it, as if a user made it.
    pub fn seed_collection(&self, name: &str, items: &[ItemId]) -> CollectionId {
        let mut state = self.lock();
        let id = Self::next_id(&mut state);
        state.collections.insert(
            id.clone(),
            Collection {
                id: id.clone(),
                name: name.to_string(),
                items: items.to_vec(),
            },
        );
        id
    }

    /// Renames without journaling, as an external actor would.
    pub fn rename_externally(&self, id: &CollectionId, name: &str) {
        if let Some(c) = self.lock().collections.get_mut(id) {
            c.name = name.to_string();
        }
    }

    pub fn collections(&self) -> Vec<Collection> {
        self.lock().collections.values().cloned().collect()
    }

    pub fn collection_named(&self, name: &str) -> Option<Collection> {
        self.lock().collections.values().find(|c| c.name == name).cloned()
    }

    pub fn journal(&self) -> Vec<Mutation> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    pub fn lookup_calls(&self) -> usize {
        self.stats.lookups.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_lookups(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn name_calls(&self) -> usize {
        self.stats.name_calls.load(Ordering::SeqCst)
    }

    fn next_id(state: &mut HostState) -> CollectionId {
        loop {
            state.next_id += 1;
            let id = CollectionId(format!("uc-{}", state.next_id));
            if !state.collections.contains_key(&id) {
                return id;
            }
        }
    }

    fn apply_rename(&self, id: &CollectionId, name: &str, method: RenameMethod) -> Result<(), HostError> {
        let mut state = self.lock();
        if !state.collections.contains_key(id) {
            return Err(HostError::NotFound(id.to_string()));
        }
        if self.rename.silent_noop {
            return Ok(());
        }
        if let Some(c) = state.collections.get_mut(id) {
            c.name = name.to_string();
        }
        state.journal.push(Mutation::Rename {
            id: id.clone(),
            name: name.to_string(),
            method,
        });
        Ok(())
    }
}

#[async_trait]
impl CollectionStore for MemoryHost {
    async fn get_by_id(&self, id: &CollectionId) -> Result<Option<Collection>, HostError> {
        Ok(self.lock().collections.get(id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Collection>, HostError> {
        Ok(self.collection_named(name))
    }

    async fn create(&self, name: &str) -> Result<Collection, HostError> {
        let mut state = self.lock();
        let id = Self::next_id(&mut state);
        let collection = Collection {
            id: id.clone(),
            name: name.to_string(),
            items: Vec::new(),
        };
        state.collections.insert(id.clone(), collection.clone());
        state.journal.push(Mutation::Create {
            id,
            name: name.to_string(),
        });
        Ok(collection)
    }

    async fn delete(&self, id: &CollectionId) -> Result<(), HostError> {
        let mut state = self.lock();
        if state.deletes_fail {
            return Err(HostError::Remote(format!("delete of {id} rejected")));
        }
        if state.collections.remove(id).is_none() {
            return Err(HostError::NotFound(id.to_string()));
        }
        state.journal.push(Mutation::Delete { id: id.clone() });
        Ok(())
    }

    async fn add_items(&self, id: &CollectionId, items: &[ItemId]) -> Result<(), HostError> {
        let mut state = self.lock();
        let collection = state
            .collections
            .get_mut(id)
            .ok_or_else(|| HostError::NotFound(id.to_string()))?;
        for item in items {
            if !collection.items.contains(item) {
                collection.items.push(*item);
            }
        }
        state.journal.push(Mutation::Add {
            id: id.clone(),
            items: items.to_vec(),
        });
        Ok(())
    }

    async fn remove_items(&self, id: &CollectionId, items: &[ItemId]) -> Result<(), HostError> {
        let mut state = self.lock();
        let collection = state
            .collections
            .get_mut(id)
            .ok_or_else(|| HostError::NotFound(id.to_string()))?;
        collection.items.retain(|item| !items.contains(item));
        state.journal.push(Mutation::Remove {
            id: id.clone(),
            items: items.to_vec(),
        });
        Ok(())
    }

    async fn rename_direct(&self, id: &CollectionId, name: &str) -> Result<(), HostError> {
        if !self.rename.direct {
            return Err(HostError::Unsupported("collection.rename"));
        }
        self.apply_rename(id, name, RenameMethod::Direct)
    }

    async fn rename_by_id(&self, id: &CollectionId, name: &str) -> Result<(), HostError> {
        if !self.rename.by_id {
            return Err(HostError::Unsupported("store.renameById"));
        }
        self.apply_rename(id, name, RenameMethod::ById)
    }

    fn supports_rename_direct(&self) -> bool {
        self.rename.direct
    }

    fn supports_rename_by_id(&self) -> bool {
        self.rename.by_id
    }
}

#[async_trait]
impl SharingSnapshotSource for MemoryHost {
    async fn snapshot(&self) -> Result<Option<serde_json::Value>, HostError> {
        if let Some(gate) = &self.snapshot_gate {
            gate.notified().await;
        }
        Ok(self.lock().snapshot.clone())
    }
}

#[async_trait]
impl LenderLookup for MemoryHost {
    async fn lenders_for(&self, item: ItemId) -> Result<Vec<LenderCandidate>, HostError> {
        self.stats.lookups.fetch_add(1, Ordering::SeqCst);
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let state = self.lock();
            if state.failing_items.contains(&item) {
                Err(HostError::Remote(format!("lookup for {item} failed")))
            } else {
                Ok(state.lenders.get(&item).cloned().unwrap_or_default())
            }
        };
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl OwnerNameSource for MemoryHost {
    async fn resolve_names(
        &self,
        owner_ids: &[OwnerId],
        _force_refresh: bool,
    ) -> Result<BTreeMap<OwnerId, String>, HostError> {
        self.stats.name_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        if state.names_fail {
            return Err(HostError::Remote("name service unavailable".into()));
        }
        Ok(owner_ids
            .iter()
            .filter_map(|id| state.owner_names.get(id).map(|n| (id.clone(), n.clone())))
            .collect())
    }
}

#[async_trait]
impl HostReadiness for MemoryHost {
    async fn wait_ready(&self) -> Result<(), HostError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_journal_records_mutations_only() {
        let host = MemoryHost::new();
        let seeded = host.seed_collection("Mine", &[1]);
        let created = host.create("New").await.unwrap();
        host.add_items(&created.id, &[4, 5]).await.unwrap();
        host.remove_items(&created.id, &[4]).await.unwrap();
        host.find_by_name("Mine").await.unwrap();
        host.delete(&seeded).await.unwrap();

        let journal = host.journal();
        assert_eq!(journal.len(), 4);
        assert_eq!(host.collection_named("New").unwrap().items, vec![5]);
        assert!(host.collection_named("Mine").is_none());
    }

    #[tokio::test]
    async fn test_rename_capabilities() {
        let host = MemoryHost::new().with_rename(false, true);
        let id = host.seed_collection("Old", &[]);
        assert!(host.rename_direct(&id, "New").await.unwrap_err().is_unsupported());
        host.rename_by_id(&id, "New").await.unwrap();
        assert_eq!(host.get_by_id(&id).await.unwrap().unwrap().name, "New");
    }

    #[tokio::test]
    async fn test_fixture_roundtrip_keeps_ids_unique() {
        let host = MemoryHost::new();
        host.seed_collection("A", &[1]);
        let fixture = host.to_fixture();

        let restored = MemoryHost::from_fixture(fixture);
        let created = restored.create("B").await.unwrap();
        assert_eq!(restored.collections().len(), 2);
        assert_ne!(created.id, restored.collection_named("A").unwrap().id);
    }
}
