use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Stable identifier of a remote lender.
pub type OwnerId = String;

/// Identifier of a shared item.
pub type ItemId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(pub String);

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A host-owned collection as last read from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    #[serde(default)]
    pub items: Vec<ItemId>,
}

impl Collection {
    pub fn item_set(&self) -> BTreeSet<ItemId> {
        self.items.iter().copied().collect()
    }
}

/// Cached answer of a per-item lender lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LenderCacheEntry {
    pub owner_id: OwnerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    /// Milliseconds since the Unix epoch at write time.
    pub updated_at: i64,
}

impl LenderCacheEntry {
    pub fn new(owner_id: OwnerId, owner_name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            owner_name,
            updated_at: now.timestamp_millis(),
        }
    }

    /// Entries dated in the future, or too old to measure, count as stale.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        match now.timestamp_millis().checked_sub(self.updated_at) {
            Some(age) if age >= 0 => age > ttl.num_milliseconds(),
            _ => true,
        }
    }
}

pub type LenderCache = BTreeMap<ItemId, LenderCacheEntry>;

/// One lender candidate returned by a per-item lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LenderCandidate {
    #[serde(default)]
    pub owner_id: Option<OwnerId>,
    #[serde(default)]
    pub preferred: bool,
    #[serde(default)]
    pub name: Option<String>,
}

/// One shared-library entry of the bulk sharing snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedEntry {
    pub owner_id: Option<OwnerId>,
    pub owner_name: Option<String>,
    pub item_ids: Vec<ItemId>,
}

/// Outcome of one step of a run, kept distinct so callers can tell a skipped
/// capability from a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "camelCase")]
pub enum StepResult<T> {
    Done(T),
    Skipped(String),
    Failed(String),
}

impl<T> StepResult<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, StepResult::Done(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepResult::Failed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupStats {
    pub cache_hits: usize,
    pub queried: usize,
    pub resolved: usize,
    pub unresolved: usize,
}

/// Output of the ownership resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ownership {
    pub owner_to_items: BTreeMap<OwnerId, BTreeSet<ItemId>>,
    pub owner_name_hints: BTreeMap<OwnerId, String>,
    pub lookups: Option<StepResult<LookupStats>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipDiff {
    pub to_add: Vec<ItemId>,
    pub to_remove: Vec<ItemId>,
}

impl MembershipDiff {
    pub fn compute(current: &BTreeSet<ItemId>, desired: &BTreeSet<ItemId>) -> Self {
        Self {
            to_add: desired.difference(current).copied().collect(),
            to_remove: current.difference(desired).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CollectionAction {
    Keep { id: CollectionId },
    Rename { id: CollectionId, from: String },
    Create,
}

/// Dry-run view of what reconciling one owner would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerPlan {
    pub owner_id: OwnerId,
    pub desired_name: String,
    pub action: CollectionAction,
    pub diff: MembershipDiff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RenameMethod {
    Direct,
    ById,
    Recreated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerOutcome {
    pub owner_id: OwnerId,
    pub collection_id: CollectionId,
    pub collection_name: String,
    pub created: bool,
    pub renamed: Option<RenameMethod>,
    pub added: usize,
    pub removed: usize,
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub legacy_cleanup: Option<StepResult<bool>>,
    pub lookups: Option<StepResult<LookupStats>>,
    pub remote_names: Option<StepResult<usize>>,
    pub owners: BTreeMap<OwnerId, StepResult<OwnerOutcome>>,
    pub backup_persisted: bool,
}

impl RunReport {
    pub fn failed_owners(&self) -> usize {
        self.owners.values().filter(|r| r.is_failed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_diff() {
        let current: BTreeSet<ItemId> = [1, 2, 3].into_iter().collect();
        let desired: BTreeSet<ItemId> = [2, 3, 4].into_iter().collect();
        let diff = MembershipDiff::compute(&current, &desired);
        assert_eq!(diff.to_remove, vec![1]);
        assert_eq!(diff.to_add, vec![4]);
        assert!(!diff.is_empty());
        assert!(MembershipDiff::compute(&desired, &desired).is_empty());
    }

    #[test]
    fn test_cache_entry_staleness() {
        let now = Utc::now();
        let ttl = chrono::Duration::hours(6);
        let fresh = LenderCacheEntry::new("o".into(), None, now - chrono::Duration::hours(5));
        let stale = LenderCacheEntry::new("o".into(), None, now - chrono::Duration::hours(7));
        assert!(!fresh.is_stale(now, ttl));
        assert!(stale.is_stale(now, ttl));
    }

    #[test]
    fn test_cache_entry_with_bad_timestamp_is_stale() {
        let now = Utc::now();
        let ttl = chrono::Duration::hours(6);
        let future = LenderCacheEntry::new("o".into(), None, now + chrono::Duration::days(30));
        let ancient = LenderCacheEntry {
            owner_id: "o".into(),
            owner_name: None,
            updated_at: i64::MIN,
        };
        assert!(future.is_stale(now, ttl));
        assert!(ancient.is_stale(now, ttl));
    }

    #[test]
    fn test_cache_entry_wire_format() {
        let entry = LenderCacheEntry {
            owner_id: "765".into(),
            owner_name: Some("Bob".into()),
            updated_at: 42,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json, serde_json::json!({"ownerId": "765", "ownerName": "Bob", "updatedAt": 42}));
    }
}
