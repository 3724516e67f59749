use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::HostError;
use crate::host::{CollectionStore, HostCapabilities};
use crate::sync_engine::types::{
    Collection, CollectionAction, CollectionId, ItemId, MembershipDiff, OwnerId, OwnerOutcome, OwnerPlan, RenameMethod,
};

/// Keeps one host collection per owner, named and filled as desired.
///
/// Built once per run. A collection picked for one owner is claimed and is
/// never handed to another owner in the same run.
pub struct CollectionReconciler<'a> {
    store: &'a dyn CollectionStore,
    caps: HostCapabilities,
    batch_size: usize,
    claimed: Mutex<BTreeSet<CollectionId>>,
}

impl<'a> CollectionReconciler<'a> {
    pub fn new(store: &'a dyn CollectionStore, caps: HostCapabilities, batch_size: usize) -> Self {
        Self {
            store,
            caps,
            batch_size: batch_size.max(1),
            claimed: Mutex::new(BTreeSet::new()),
        }
    }

    fn is_claimed(&self, id: &CollectionId) -> bool {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner()).contains(id)
    }

    fn claim(&self, id: &CollectionId) {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner()).insert(id.clone());
    }

    /// Backed-up name first, then the desired name.
    async fn locate(
        &self,
        owner_id: &str,
        desired_name: &str,
        backup: &BTreeMap<OwnerId, String>,
    ) -> Result<Option<Collection>, HostError> {
        if let Some(previous) = backup.get(owner_id) {
            match self.store.find_by_name(previous).await? {
                Some(found) if !self.is_claimed(&found.id) => return Ok(Some(found)),
                Some(found) => debug!(owner_id, id = %found.id, "backed-up collection already claimed this run"),
                None => debug!(owner_id, previous = %previous, "backed-up collection name not found"),
            }
        }
        let found = self.store.find_by_name(desired_name).await?;
        Ok(found.filter(|c| !self.is_claimed(&c.id)))
    }

    /// What [`Self::reconcile_owner`] would do, without touching the host.
    pub async fn plan_owner(
        &self,
        owner_id: &str,
        desired_name: &str,
        desired_items: &BTreeSet<ItemId>,
        backup: &BTreeMap<OwnerId, String>,
    ) -> Result<OwnerPlan, HostError> {
        let located = self.locate(owner_id, desired_name, backup).await?;
        if let Some(c) = &located {
            self.claim(&c.id);
        }
        let current = located.as_ref().map(Collection::item_set).unwrap_or_default();

        let action = match located {
            None => CollectionAction::Create,
            Some(c) if c.name == desired_name => CollectionAction::Keep { id: c.id },
            Some(c) => CollectionAction::Rename { id: c.id, from: c.name },
        };

        Ok(OwnerPlan {
            owner_id: owner_id.to_string(),
            desired_name: desired_name.to_string(),
            action,
            diff: MembershipDiff::compute(&current, desired_items),
        })
    }

    /// Find, create or rename the owner's collection, then patch its
    /// membership. Records the resulting name in `backup` when it changed.
    pub async fn reconcile_owner(
        &self,
        owner_id: &str,
        desired_name: &str,
        desired_items: &BTreeSet<ItemId>,
        backup: &mut BTreeMap<OwnerId, String>,
    ) -> Result<OwnerOutcome, HostError> {
        let (mut collection, created) = match self.locate(owner_id, desired_name, backup).await? {
            Some(found) => (found, false),
            None => {
                info!(owner_id, name = desired_name, "creating collection");
                (self.store.create(desired_name).await?, true)
            }
        };

        self.claim(&collection.id);

        let mut renamed = None;
        if collection.name != desired_name {
            let (fresh, method) = self.rename(collection, desired_name).await?;
            collection = fresh;
            self.claim(&collection.id);
            renamed = Some(method);
        }

        // membership may have changed under us; always diff against a fresh read
        let live = self
            .store
            .get_by_id(&collection.id)
            .await?
            .ok_or_else(|| HostError::NotFound(collection.id.to_string()))?;
        let diff = MembershipDiff::compute(&live.item_set(), desired_items);

        if !diff.to_remove.is_empty() {
            self.store.remove_items(&live.id, &diff.to_remove).await?;
        }
        self.add_in_batches(&live, &diff.to_add).await?;

        if backup.get(owner_id) != Some(&live.name) {
            backup.insert(owner_id.to_string(), live.name.clone());
        }

        if !diff.is_empty() {
            debug!(
                owner_id,
                added = diff.to_add.len(),
                removed = diff.to_remove.len(),
                "membership patched"
            );
        }

        Ok(OwnerOutcome {
            owner_id: owner_id.to_string(),
            collection_id: live.id,
            collection_name: live.name,
            created,
            renamed,
            added: diff.to_add.len(),
            removed: diff.to_remove.len(),
        })
    }

    async fn add_in_batches(&self, collection: &Collection, items: &[ItemId]) -> Result<(), HostError> {
        for batch in items.chunks(self.batch_size) {
            self.store.add_items(&collection.id, batch).await?;
        }
        Ok(())
    }

    /// Direct rename, then rename-by-ID, then recreate-and-migrate. A rename
    /// only counts once a re-fetch by ID shows the new name.
    async fn rename(&self, collection: Collection, desired_name: &str) -> Result<(Collection, RenameMethod), HostError> {
        let id = collection.id.clone();

        if self.caps.rename_direct {
            match self.store.rename_direct(&id, desired_name).await {
                Ok(()) => {
                    if let Some(fresh) = self.confirm_renamed(&collection, desired_name).await? {
                        info!(id = %id, from = %collection.name, to = desired_name, "renamed collection");
                        return Ok((fresh, RenameMethod::Direct));
                    }
                }
                Err(e) => warn!(id = %id, error = %e, "direct rename failed"),
            }
        }

        if self.caps.rename_by_id {
            match self.store.rename_by_id(&id, desired_name).await {
                Ok(()) => {
                    if let Some(fresh) = self.confirm_renamed(&collection, desired_name).await? {
                        info!(id = %id, from = %collection.name, to = desired_name, "renamed collection by id");
                        return Ok((fresh, RenameMethod::ById));
                    }
                }
                Err(e) => warn!(id = %id, error = %e, "rename by id failed"),
            }
        }

        let fresh = self.recreate(collection, desired_name).await?;
        Ok((fresh, RenameMethod::Recreated))
    }

    async fn confirm_renamed(&self, collection: &Collection, desired_name: &str) -> Result<Option<Collection>, HostError> {
        match self.store.get_by_id(&collection.id).await? {
            Some(fresh) if fresh.name == desired_name => Ok(Some(fresh)),
            _ => {
                debug!(id = %collection.id, "rename reported success but did not take effect");
                Ok(None)
            }
        }
    }

    /// Changes the collection's identity; only used when no rename works.
    /// An unclaimed collection already carrying the desired name is reused
    /// rather than created twice.
    async fn recreate(&self, collection: Collection, desired_name: &str) -> Result<Collection, HostError> {
        let old = self.store.get_by_id(&collection.id).await?.unwrap_or(collection);
        warn!(id = %old.id, from = %old.name, to = desired_name, "no working rename, recreating collection");

        let target = match self.store.find_by_name(desired_name).await? {
            Some(existing) if existing.id != old.id && !self.is_claimed(&existing.id) => {
                info!(id = %existing.id, name = desired_name, "migrating into existing collection");
                existing
            }
            _ => self.store.create(desired_name).await?,
        };
        let items: Vec<ItemId> = old.item_set().difference(&target.item_set()).copied().collect();
        self.add_in_batches(&target, &items).await?;

        // the new collection is the managed one from here on
        if let Err(e) = self.store.delete(&old.id).await {
            warn!(id = %old.id, error = %e, "old collection left behind after migration");
        }

        Ok(self.store.get_by_id(&target.id).await?.unwrap_or(target))
    }
}
