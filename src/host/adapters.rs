//! Versioned mappings from raw host snapshot JSON to [`SharedEntry`] lists.
//!
//! Each known host data shape gets its own adapter. The orchestrator detects
//! the adapter once from the first non-empty snapshot and keeps using it.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::sync_engine::types::{ItemId, OwnerId, SharedEntry};

pub trait SnapshotAdapter: Send + Sync + std::fmt::Debug {
    fn version(&self) -> &'static str;

    /// True when `raw` carries this shape's list field as a non-empty array.
    fn matches(&self, raw: &Value) -> bool;

    fn entries(&self, raw: &Value) -> Vec<SharedEntry>;
}

/// Owner IDs arrive as strings or as bare numbers.
fn owner_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<OwnerId>, D::Error> {
    let value = Option::<Value>::deserialize(de)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn opt_name<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(de)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        _ => None,
    })
}

/// Numbers or numeric strings; anything else is dropped.
fn item_ids<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<ItemId>, D::Error> {
    let values = Option::<Vec<Value>>::deserialize(de)?.unwrap_or_default();
    Ok(values
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_u64().and_then(|n| ItemId::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect())
}

fn dedup(items: Vec<ItemId>) -> Vec<ItemId> {
    let mut seen = BTreeSet::new();
    items.into_iter().filter(|id| seen.insert(*id)).collect()
}

fn list_field<'a>(raw: &'a Value, field: &str) -> Option<&'a Vec<Value>> {
    raw.get(field)?.as_array().filter(|list| !list.is_empty())
}

/// Deserializes each element independently so one bad entry does not sink
/// the whole snapshot.
fn parse_list<T, F>(raw: &Value, field: &str, into_entry: F) -> Vec<SharedEntry>
where
    T: for<'de> Deserialize<'de>,
    F: Fn(T) -> SharedEntry,
{
    list_field(raw, field)
        .map(|list| {
            list.iter()
                .filter_map(|v| T::deserialize(v).ok())
                .map(into_entry)
                .map(|mut entry| {
                    entry.item_ids = dedup(entry.item_ids);
                    entry
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentEntry {
    #[serde(default, deserialize_with = "owner_id", alias = "steamid")]
    owner_steam_id: Option<OwnerId>,
    #[serde(default, deserialize_with = "opt_name")]
    owner_name: Option<String>,
    #[serde(default, deserialize_with = "item_ids")]
    app_ids: Vec<ItemId>,
}

/// `sharedLibraries[].{ownerSteamId, ownerName, appIds}`
#[derive(Debug, Default)]
pub struct CurrentShape;

impl SnapshotAdapter for CurrentShape {
    fn version(&self) -> &'static str {
        "current"
    }

    fn matches(&self, raw: &Value) -> bool {
        list_field(raw, "sharedLibraries").is_some()
    }

    fn entries(&self, raw: &Value) -> Vec<SharedEntry> {
        parse_list(raw, "sharedLibraries", |e: CurrentEntry| SharedEntry {
            owner_id: e.owner_steam_id,
            owner_name: e.owner_name,
            item_ids: e.app_ids,
        })
    }
}

#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(default, deserialize_with = "owner_id")]
    steamid: Option<OwnerId>,
    #[serde(default, rename = "strPersonaName", deserialize_with = "opt_name")]
    persona_name: Option<String>,
    #[serde(default, rename = "rgAppIDs", deserialize_with = "item_ids")]
    app_ids: Vec<ItemId>,
}

/// `rgSharedLibraries[].{steamid, strPersonaName, rgAppIDs}`
#[derive(Debug, Default)]
pub struct LegacyShape;

impl SnapshotAdapter for LegacyShape {
    fn version(&self) -> &'static str {
        "legacy"
    }

    fn matches(&self, raw: &Value) -> bool {
        list_field(raw, "rgSharedLibraries").is_some()
    }

    fn entries(&self, raw: &Value) -> Vec<SharedEntry> {
        parse_list(raw, "rgSharedLibraries", |e: LegacyEntry| SharedEntry {
            owner_id: e.steamid,
            owner_name: e.persona_name,
            item_ids: e.app_ids,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SnakeEntry {
    #[serde(default, deserialize_with = "owner_id")]
    owner_steamid: Option<OwnerId>,
    #[serde(default, deserialize_with = "opt_name")]
    owner_name: Option<String>,
    #[serde(default, deserialize_with = "item_ids")]
    appids: Vec<ItemId>,
}

/// `shared_libraries[].{owner_steamid, owner_name, appids}`
#[derive(Debug, Default)]
pub struct SnakeShape;

impl SnapshotAdapter for SnakeShape {
    fn version(&self) -> &'static str {
        "snake"
    }

    fn matches(&self, raw: &Value) -> bool {
        list_field(raw, "shared_libraries").is_some()
    }

    fn entries(&self, raw: &Value) -> Vec<SharedEntry> {
        parse_list(raw, "shared_libraries", |e: SnakeEntry| SharedEntry {
            owner_id: e.owner_steamid,
            owner_name: e.owner_name,
            item_ids: e.appids,
        })
    }
}

/// Known adapters in detection priority order.
pub fn known_adapters() -> Vec<Box<dyn SnapshotAdapter>> {
    vec![Box::new(CurrentShape), Box::new(LegacyShape), Box::new(SnakeShape)]
}

pub fn detect_adapter(raw: &Value) -> Option<Box<dyn SnapshotAdapter>> {
    known_adapters().into_iter().find(|a| a.matches(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detects_current_shape() {
        let raw = json!({
            "sharedLibraries": [
                {"ownerSteamId": "765", "ownerName": " Alice ", "appIds": [10, 20, 10, "30"]},
                {"steamid": 766, "appIds": []}
            ]
        });
        let adapter = detect_adapter(&raw).unwrap();
        assert_eq!(adapter.version(), "current");

        let entries = adapter.entries(&raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].owner_id.as_deref(), Some("765"));
        assert_eq!(entries[0].owner_name.as_deref(), Some("Alice"));
        assert_eq!(entries[0].item_ids, vec![10, 20, 30]);
        assert_eq!(entries[1].owner_id.as_deref(), Some("766"));
    }

    #[test]
    fn test_detects_legacy_shape() {
        let raw = json!({
            "sharedLibraries": [],
            "rgSharedLibraries": [
                {"steamid": "1", "strPersonaName": "Bob", "rgAppIDs": [5]}
            ]
        });
        let adapter = detect_adapter(&raw).unwrap();
        assert_eq!(adapter.version(), "legacy");
        assert_eq!(adapter.entries(&raw)[0].owner_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_detects_snake_shape() {
        let raw = json!({"shared_libraries": [{"owner_steamid": "9", "appids": [1, 2]}]});
        let adapter = detect_adapter(&raw).unwrap();
        assert_eq!(adapter.version(), "snake");
        assert_eq!(adapter.entries(&raw)[0].item_ids, vec![1, 2]);
    }

    #[test]
    fn test_unknown_or_empty_shape() {
        assert!(detect_adapter(&json!({})).is_none());
        assert!(detect_adapter(&json!({"sharedLibraries": []})).is_none());
        assert!(detect_adapter(&json!([1, 2])).is_none());
    }

    #[test]
    fn test_entry_without_owner_keeps_items() {
        let raw = json!({"sharedLibraries": [{"ownerSteamId": "  ", "appIds": [7]}, "garbage"]});
        let entries = CurrentShape.entries(&raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].owner_id, None);
        assert_eq!(entries[0].item_ids, vec![7]);
    }
}
