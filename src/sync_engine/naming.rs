use std::collections::{BTreeMap, BTreeSet};

use crate::input_validation::{apply_template, normalize_override, sanitize_collection_name, MAX_COLLECTION_NAME_LENGTH};
use crate::sync_engine::types::OwnerId;

const FALLBACK_SUFFIX_LEN: usize = 6;

/// Last six characters of the owner ID, or the whole ID when shorter.
pub fn fallback_name(owner_id: &str) -> String {
    let owner_id = owner_id.trim();
    if owner_id.is_empty() {
        return "Unknown".to_string();
    }
    let count = owner_id.chars().count();
    owner_id.chars().skip(count.saturating_sub(FALLBACK_SUFFIX_LEN)).collect()
}

/// Override, then the name looked up for this run, then [`fallback_name`].
/// Always non-empty and deterministic for identical inputs.
pub fn resolve_display_name(
    owner_id: &str,
    web_names: &BTreeMap<OwnerId, String>,
    overrides: &BTreeMap<OwnerId, String>,
) -> String {
    overrides
        .get(owner_id)
        .and_then(|n| normalize_override(n))
        .or_else(|| web_names.get(owner_id).and_then(|n| normalize_override(n)))
        .unwrap_or_else(|| fallback_name(owner_id))
}

/// Names for this run: remote answers, with inline snapshot hints filling
/// the gaps.
pub fn merge_name_sources(
    remote: &BTreeMap<OwnerId, String>,
    hints: &BTreeMap<OwnerId, String>,
) -> BTreeMap<OwnerId, String> {
    let mut merged: BTreeMap<OwnerId, String> = hints
        .iter()
        .filter_map(|(id, n)| normalize_override(n).map(|n| (id.clone(), n)))
        .collect();
    for (id, name) in remote {
        if let Some(name) = normalize_override(name) {
            merged.insert(id.clone(), name);
        }
    }
    merged
}

/// Template applied to the display name, sanitized, never empty.
pub fn desired_collection_name(template: &str, display_name: &str, owner_id: &str) -> String {
    let candidate = sanitize_collection_name(&apply_template(template, display_name));
    if !candidate.is_empty() {
        return candidate;
    }
    let bare = sanitize_collection_name(display_name);
    if !bare.is_empty() {
        return bare;
    }
    let fallback = sanitize_collection_name(&fallback_name(owner_id));
    if fallback.is_empty() {
        "Shared Library".to_string()
    } else {
        format!("Shared {fallback}")
    }
}

/// Makes desired names unique across owners. In owner-ID order the first
/// owner keeps the plain name; later ones get their ID suffix appended.
pub fn disambiguate_collection_names(desired: &BTreeMap<OwnerId, String>) -> BTreeMap<OwnerId, String> {
    let mut taken: BTreeSet<String> = BTreeSet::new();
    let mut unique = BTreeMap::new();

    for (owner_id, name) in desired {
        let mut candidate = name.clone();
        if taken.contains(&candidate) {
            let tag = Some(sanitize_collection_name(&fallback_name(owner_id)))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "owner".to_string());
            let mut attempt = 1;
            while taken.contains(&candidate) {
                let label = if attempt == 1 { tag.clone() } else { format!("{tag} {attempt}") };
                candidate = with_suffix(name, &label);
                attempt += 1;
            }
            tracing::debug!(owner_id = %owner_id, name = %candidate, "collection name already taken this run");
        }
        taken.insert(candidate.clone());
        unique.insert(owner_id.clone(), candidate);
    }
    unique
}

fn with_suffix(name: &str, label: &str) -> String {
    let suffix = format!(" ({label})");
    let room = MAX_COLLECTION_NAME_LENGTH.saturating_sub(suffix.chars().count());
    let base: String = name.chars().take(room).collect();
    format!("{}{suffix}", base.trim_end())
}
