//! Input normalization and sanitization
//!
//! Cleans up user-provided names and templates before they reach the host's
//! collection store, which rejects filesystem-hostile characters.

use anyhow::{bail, Result};

use crate::config::DEFAULT_TEMPLATE;

/// Placeholder replaced by the owner's display name.
pub const NAME_TOKEN: &str = "{name}";

const MAX_OWNER_ID_LENGTH: usize = 64;
pub const MAX_COLLECTION_NAME_LENGTH: usize = 128;

/// Normalize a naming template
///
/// Empty input falls back to `default`; a template without [`NAME_TOKEN`]
/// gets it appended. Normalizing an already normalized template is a no-op.
pub fn normalize_template(raw: &str, default: &str) -> String {
    let trimmed = raw.trim();
    let base = if !trimmed.is_empty() {
        trimmed
    } else if !default.trim().is_empty() {
        default.trim()
    } else {
        DEFAULT_TEMPLATE
    };

    if base.contains(NAME_TOKEN) {
        base.to_string()
    } else {
        format!("{base}{NAME_TOKEN}")
    }
}

/// Substitute the display name into a normalized template.
pub fn apply_template(template: &str, display_name: &str) -> String {
    template.replace(NAME_TOKEN, display_name)
}

/// Strip characters the host refuses in collection names
///
/// Removes `< > : " / \ | ? *` and control characters, collapses runs of
/// whitespace and trims. May return an empty string; callers own the fallback.
pub fn sanitize_collection_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') && !c.is_control())
        .collect();

    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_COLLECTION_NAME_LENGTH).collect::<String>().trim().to_string()
}

/// Trim a user-entered override; `None` means "no override".
pub fn normalize_override(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Validate an owner ID coming from the settings surface
pub fn validate_owner_id(owner_id: &str) -> Result<()> {
    let owner_id = owner_id.trim();

    if owner_id.is_empty() {
        bail!("Owner ID cannot be empty");
    }

    if owner_id.len() > MAX_OWNER_ID_LENGTH {
        bail!(
            "Owner ID too long: {} chars (max: {})",
            owner_id.len(),
            MAX_OWNER_ID_LENGTH
        );
    }

    if owner_id.chars().any(|c| c.is_control() || c.is_whitespace()) {
        bail!("Owner ID contains invalid characters: '{}'", owner_id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_template_empty_uses_default() {
        assert_eq!(normalize_template("", DEFAULT_TEMPLATE), DEFAULT_TEMPLATE);
        assert_eq!(normalize_template("   ", DEFAULT_TEMPLATE), DEFAULT_TEMPLATE);
    }

    #[test]
    fn test_normalize_template_appends_token() {
        assert_eq!(normalize_template("X", DEFAULT_TEMPLATE), "X{name}");
        assert_eq!(normalize_template("{name}!", DEFAULT_TEMPLATE), "{name}!");
    }

    #[test]
    fn test_normalize_template_idempotent() {
        for raw in ["", "X", "{name}!", "  Shared by ", "a {name} b {name}", "{nam"] {
            let once = normalize_template(raw, DEFAULT_TEMPLATE);
            assert_eq!(normalize_template(&once, DEFAULT_TEMPLATE), once, "input {raw:?}");
        }
    }

    #[test]
    fn test_normalize_template_bad_default() {
        assert_eq!(normalize_template("", ""), DEFAULT_TEMPLATE);
        assert_eq!(normalize_template("", "Shared"), "Shared{name}");
    }

    #[test]
    fn test_sanitize_collection_name() {
        assert_eq!(sanitize_collection_name("Alice's Library"), "Alice's Library");
        assert_eq!(sanitize_collection_name("a/b\\c:d*e?f\"g<h>i|j"), "abcdefghij");
        assert_eq!(sanitize_collection_name("  lots   of\tspace \n"), "lots of space");
        assert_eq!(sanitize_collection_name("???"), "");
    }

    #[test]
    fn test_sanitize_collection_name_truncates() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_collection_name(&long).len(), 128);
    }

    #[test]
    fn test_normalize_override() {
        assert_eq!(normalize_override("  Alice "), Some("Alice".to_string()));
        assert_eq!(normalize_override("   "), None);
    }

    #[test]
    fn test_validate_owner_id() {
        assert!(validate_owner_id("76561198000000001").is_ok());
        assert!(validate_owner_id("").is_err());
        assert!(validate_owner_id("has space").is_err());
        assert!(validate_owner_id(&"9".repeat(65)).is_err());
    }
}
