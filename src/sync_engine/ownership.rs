use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::host::LenderLookup;
use crate::store::StateStore;
use crate::sync_engine::types::{
    ItemId, LenderCache, LenderCacheEntry, LenderCandidate, LookupStats, OwnerId, Ownership, SharedEntry,
    StepResult,
};

/// Builds the owner → items map for one run.
///
/// Items listed in the snapshot without an owner are resolved one by one
/// through the lender lookup, cache first, with at most `concurrency`
/// lookups in flight.
pub struct OwnershipResolver<'a> {
    lookup: Option<&'a dyn LenderLookup>,
    clock: &'a dyn Clock,
    ttl: chrono::Duration,
    concurrency: usize,
    persist_to: Option<&'a StateStore>,
}

impl<'a> OwnershipResolver<'a> {
    pub fn new(lookup: Option<&'a dyn LenderLookup>, clock: &'a dyn Clock, ttl: chrono::Duration, concurrency: usize) -> Self {
        Self {
            lookup,
            clock,
            ttl,
            concurrency: concurrency.max(1),
            persist_to: None,
        }
    }

    /// Persist the lender cache (once) after lookups change it.
    pub fn persisting_to(mut self, store: &'a StateStore) -> Self {
        self.persist_to = Some(store);
        self
    }

    pub async fn resolve(&self, entries: &[SharedEntry], cache: &mut LenderCache) -> Ownership {
        let mut item_to_owner: BTreeMap<ItemId, OwnerId> = BTreeMap::new();
        let mut hints: BTreeMap<OwnerId, String> = BTreeMap::new();
        let mut listed: BTreeSet<ItemId> = BTreeSet::new();

        // First entry to claim an item keeps it. This mirrors how the host has
        // always been read; the host itself makes no such promise.
        for entry in entries {
            listed.extend(entry.item_ids.iter().copied());
            let Some(owner) = &entry.owner_id else {
                continue;
            };
            if let Some(name) = &entry.owner_name {
                hints.entry(owner.clone()).or_insert_with(|| name.clone());
            }
            for item in &entry.item_ids {
                item_to_owner.entry(*item).or_insert_with(|| owner.clone());
            }
        }

        let missing: Vec<ItemId> = listed
            .iter()
            .filter(|item| !item_to_owner.contains_key(item))
            .copied()
            .collect();

        let lookups = if missing.is_empty() {
            None
        } else {
            Some(self.resolve_missing(&missing, cache, &mut item_to_owner, &mut hints).await)
        };

        let mut cache_changed = matches!(&lookups, Some(StepResult::Done(stats)) if stats.resolved > 0);
        // an empty snapshot usually means the host is not ready; keep the cache then
        if self.lookup.is_some() && !listed.is_empty() {
            let before = cache.len();
            cache.retain(|item, _| listed.contains(item));
            if cache.len() < before {
                debug!(pruned = before - cache.len(), "dropped lender cache entries for unlisted items");
                cache_changed = true;
            }
        }
        if cache_changed {
            if let Some(store) = self.persist_to {
                if let Err(e) = store.save_lender_cache(cache).await {
                    warn!(error = %e, "failed to persist lender cache");
                }
            }
        }

        let mut owner_to_items: BTreeMap<OwnerId, BTreeSet<ItemId>> = BTreeMap::new();
        for (item, owner) in item_to_owner {
            owner_to_items.entry(owner).or_default().insert(item);
        }

        Ownership {
            owner_to_items,
            owner_name_hints: hints,
            lookups,
        }
    }

    async fn resolve_missing(
        &self,
        missing: &[ItemId],
        cache: &mut LenderCache,
        item_to_owner: &mut BTreeMap<ItemId, OwnerId>,
        hints: &mut BTreeMap<OwnerId, String>,
    ) -> StepResult<LookupStats> {
        let Some(lookup) = self.lookup else {
            debug!(missing = missing.len(), "lender lookup unavailable, leaving items unresolved");
            return StepResult::Skipped("lender lookup unavailable".to_string());
        };

        let now = self.clock.now();
        let mut stats = LookupStats::default();
        let mut queue = Vec::new();

        for item in missing {
            match cache.get(item) {
                Some(entry) if !entry.is_stale(now, self.ttl) => {
                    stats.cache_hits += 1;
                    item_to_owner.insert(*item, entry.owner_id.clone());
                    if let Some(name) = &entry.owner_name {
                        hints.entry(entry.owner_id.clone()).or_insert_with(|| name.clone());
                    }
                }
                _ => queue.push(*item),
            }
        }

        if queue.is_empty() {
            return StepResult::Done(stats);
        }

        let workers = self.concurrency.min(queue.len());
        stats.queried = queue.len();
        debug!(queued = queue.len(), workers, "querying lenders");

        let mut results: Vec<(ItemId, Option<LenderCacheEntry>)> = stream::iter(queue)
            .map(|item| async move { (item, self.lookup_one(lookup, item).await) })
            .buffer_unordered(workers)
            .collect()
            .await;
        // completion order is arbitrary; merge in item order
        results.sort_by_key(|(item, _)| *item);

        for (item, entry) in results {
            let Some(entry) = entry else {
                stats.unresolved += 1;
                continue;
            };
            stats.resolved += 1;
            item_to_owner.insert(item, entry.owner_id.clone());
            if let Some(name) = &entry.owner_name {
                hints.entry(entry.owner_id.clone()).or_insert_with(|| name.clone());
            }
            cache.insert(item, entry);
        }

        info!(
            cache_hits = stats.cache_hits,
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            "lender lookups finished"
        );
        StepResult::Done(stats)
    }

    async fn lookup_one(&self, lookup: &dyn LenderLookup, item: ItemId) -> Option<LenderCacheEntry> {
        match lookup.lenders_for(item).await {
            Ok(candidates) => {
                let picked = pick_lender(&candidates);
                if picked.is_none() {
                    debug!(item, "no usable lender returned");
                }
                picked.map(|(owner, name)| LenderCacheEntry::new(owner, name, self.clock.now()))
            }
            Err(e) => {
                debug!(item, error = %e, "lender lookup failed");
                None
            }
        }
    }
}

/// Preferred lender with a usable ID, else the first lender with one.
pub fn pick_lender(candidates: &[LenderCandidate]) -> Option<(OwnerId, Option<String>)> {
    let usable = |c: &&LenderCandidate| c.owner_id.as_deref().is_some_and(|id| !id.trim().is_empty());

    let chosen = candidates
        .iter()
        .filter(usable)
        .find(|c| c.preferred)
        .or_else(|| candidates.iter().find(usable))?;

    let owner = chosen.owner_id.as_deref()?.trim().to_string();
    let name = chosen
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Some((owner, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{StorageKeys, DEFAULT_TEMPLATE};
    use crate::host::MemoryHost;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn entry(owner: Option<&str>, name: Option<&str>, items: &[ItemId]) -> SharedEntry {
        SharedEntry {
            owner_id: owner.map(str::to_string),
            owner_name: name.map(str::to_string),
            item_ids: items.to_vec(),
        }
    }

    fn candidate(owner: &str, preferred: bool) -> LenderCandidate {
        LenderCandidate {
            owner_id: Some(owner.to_string()),
            preferred,
            name: None,
        }
    }

    #[test]
    fn test_pick_lender_prefers_flagged() {
        let picked = pick_lender(&[candidate("a", false), candidate("b", true)]);
        assert_eq!(picked, Some(("b".to_string(), None)));
    }

    #[test]
    fn test_pick_lender_skips_invalid_ids() {
        let blank = LenderCandidate {
            owner_id: Some("  ".into()),
            preferred: true,
            name: None,
        };
        let picked = pick_lender(&[LenderCandidate::default(), blank, candidate("c", false)]);
        assert_eq!(picked.map(|p| p.0), Some("c".to_string()));
        assert_eq!(pick_lender(&[]), None);
    }

    #[tokio::test]
    async fn test_first_entry_wins_for_shared_items() {
        let clock = ManualClock::default();
        let resolver = OwnershipResolver::new(None, &clock, chrono::Duration::hours(6), 8);
        let entries = vec![
            entry(Some("a"), Some("Alice"), &[1, 2]),
            entry(Some("b"), Some("Bob"), &[2, 3]),
            entry(Some("a"), Some("Other"), &[4]),
        ];

        let ownership = resolver.resolve(&entries, &mut LenderCache::new()).await;
        assert_eq!(ownership.owner_to_items["a"], BTreeSet::from([1, 2, 4]));
        assert_eq!(ownership.owner_to_items["b"], BTreeSet::from([3]));
        assert_eq!(ownership.owner_name_hints["a"], "Alice");
        assert_eq!(ownership.lookups, None);
    }

    #[tokio::test]
    async fn test_missing_items_skipped_without_lookup_capability() {
        let clock = ManualClock::default();
        let resolver = OwnershipResolver::new(None, &clock, chrono::Duration::hours(6), 8);
        let ownership = resolver
            .resolve(&[entry(None, None, &[9])], &mut LenderCache::new())
            .await;

        assert!(ownership.owner_to_items.is_empty());
        assert!(matches!(ownership.lookups, Some(StepResult::Skipped(_))));
    }

    #[tokio::test]
    async fn test_fresh_cache_is_used_without_query() {
        let clock = ManualClock::default();
        let host = MemoryHost::new();
        host.set_lenders(9, vec![candidate("remote", false)]);

        let mut cache = LenderCache::new();
        cache.insert(
            9,
            LenderCacheEntry::new("cached".into(), Some("Cee".into()), clock.now() - chrono::Duration::hours(1)),
        );

        let resolver = OwnershipResolver::new(Some(&host), &clock, chrono::Duration::hours(6), 8);
        let ownership = resolver.resolve(&[entry(None, None, &[9])], &mut cache).await;

        assert_eq!(host.lookup_calls(), 0);
        assert!(ownership.owner_to_items.contains_key("cached"));
        assert_eq!(ownership.owner_name_hints["cached"], "Cee");
    }

    #[tokio::test]
    async fn test_stale_cache_is_requeried_and_refreshed() {
        let clock = ManualClock::default();
        let host = MemoryHost::new();
        host.set_lenders(9, vec![candidate("remote", false)]);

        let mut cache = LenderCache::new();
        cache.insert(
            9,
            LenderCacheEntry::new("cached".into(), None, clock.now() - chrono::Duration::hours(7)),
        );

        let resolver = OwnershipResolver::new(Some(&host), &clock, chrono::Duration::hours(6), 8);
        let ownership = resolver.resolve(&[entry(None, None, &[9])], &mut cache).await;

        assert_eq!(host.lookup_calls(), 1);
        assert!(ownership.owner_to_items.contains_key("remote"));
        assert_eq!(cache[&9].owner_id, "remote");
        assert_eq!(cache[&9].updated_at, clock.now().timestamp_millis());
    }

    #[tokio::test]
    async fn test_failed_lookups_stay_unresolved_and_cache_persists_once() {
        let clock = ManualClock::default();
        let host = MemoryHost::new();
        for item in 1..=5 {
            host.set_lenders(item, vec![candidate("o", false)]);
        }
        host.fail_lookup(2);
        host.set_lenders(3, vec![]);

        let memory = MemoryStore::new();
        let state = StateStore::new(Arc::new(memory.clone()), StorageKeys::default(), DEFAULT_TEMPLATE);
        let resolver = OwnershipResolver::new(Some(&host), &clock, chrono::Duration::hours(6), 8).persisting_to(&state);

        let mut cache = LenderCache::new();
        let ownership = resolver
            .resolve(&[entry(None, None, &[1, 2, 3, 4, 5])], &mut cache)
            .await;

        assert_eq!(ownership.owner_to_items["o"], BTreeSet::from([1, 4, 5]));
        match ownership.lookups {
            Some(StepResult::Done(stats)) => {
                assert_eq!(stats.queried, 5);
                assert_eq!(stats.resolved, 3);
                assert_eq!(stats.unresolved, 2);
            }
            other => panic!("unexpected lookup result: {other:?}"),
        }
        assert_eq!(memory.write_log(), vec![StorageKeys::default().lender_cache]);
        assert_eq!(state.load_lender_cache().await.len(), 3);
    }

    #[tokio::test]
    async fn test_cache_pruned_to_listed_items_in_one_write() {
        let clock = ManualClock::default();
        let host = MemoryHost::new();
        host.set_lenders(2, vec![candidate("o", false)]);

        let memory = MemoryStore::new();
        let state = StateStore::new(Arc::new(memory.clone()), StorageKeys::default(), DEFAULT_TEMPLATE);
        let resolver = OwnershipResolver::new(Some(&host), &clock, chrono::Duration::hours(6), 8).persisting_to(&state);

        let mut cache = LenderCache::new();
        for item in [1, 3] {
            cache.insert(item, LenderCacheEntry::new("gone".into(), None, clock.now()));
        }
        cache.insert(4, LenderCacheEntry::new("kept".into(), None, clock.now()));

        resolver
            .resolve(&[entry(None, None, &[2, 4]), entry(Some("a"), None, &[5])], &mut cache)
            .await;

        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(memory.write_log(), vec![StorageKeys::default().lender_cache]);
        assert_eq!(state.load_lender_cache().await.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_snapshot_keeps_cache() {
        let clock = ManualClock::default();
        let host = MemoryHost::new();
        let mut cache = LenderCache::new();
        cache.insert(1, LenderCacheEntry::new("o".into(), None, clock.now()));

        let resolver = OwnershipResolver::new(Some(&host), &clock, chrono::Duration::hours(6), 8);
        resolver.resolve(&[], &mut cache).await;

        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_concurrency_is_bounded() {
        let clock = ManualClock::default();
        let host = MemoryHost::new().with_lookup_delay(Duration::from_millis(10));
        let items: Vec<ItemId> = (1..=40).collect();
        for item in &items {
            host.set_lenders(*item, vec![candidate("o", false)]);
        }

        let resolver = OwnershipResolver::new(Some(&host), &clock, chrono::Duration::hours(6), 8);
        let ownership = resolver
            .resolve(&[entry(None, None, &items)], &mut LenderCache::new())
            .await;

        assert_eq!(host.lookup_calls(), 40);
        assert!(host.max_concurrent_lookups() <= 8);
        assert!(host.max_concurrent_lookups() > 1);
        assert_eq!(ownership.owner_to_items["o"].len(), 40);
    }
}
