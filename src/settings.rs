//! Operations behind the settings view: owner name overrides, the naming
//! template, the collection-name backup and "sync now".
//!
//! Every mutating call answers with a [`StatusMessage`] so the view can show
//! a status line and translate the error code.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error_codes::{ERR_OWNER_ID_REQUIRED, ERR_PERSIST_FAILED, ERR_SYNC_BUSY, ERR_SYNC_FAILED};
use crate::input_validation::{normalize_override, validate_owner_id};
use crate::orchestrator::{RunOutcome, SkipReason, SyncOrchestrator, Trigger};
use crate::sync_engine::types::OwnerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl StatusMessage {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            code: None,
            message: message.into(),
        }
    }

    fn err(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            code: Some(code.to_string()),
            message: message.into(),
        }
    }
}

/// One line of the owner table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRow {
    pub owner_id: OwnerId,
    pub resolved_name: Option<String>,
    pub override_name: Option<String>,
    pub collection_name: Option<String>,
}

pub struct SettingsService {
    orchestrator: Arc<SyncOrchestrator>,
}

impl SettingsService {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Every owner seen by the last run, with an override, or with a backup entry.
    pub async fn owner_rows(&self) -> Vec<OwnerRow> {
        let store = self.orchestrator.state_store();
        let overrides = store.load_overrides().await;
        let backup = store.load_collection_names().await;
        let resolved = self.orchestrator.last_display_names();

        let owners: BTreeSet<&OwnerId> = resolved.keys().chain(overrides.keys()).chain(backup.keys()).collect();
        owners
            .into_iter()
            .map(|owner| OwnerRow {
                owner_id: owner.clone(),
                resolved_name: resolved.get(owner).cloned(),
                override_name: overrides.get(owner).cloned(),
                collection_name: backup.get(owner).cloned(),
            })
            .collect()
    }

    /// Stores a display-name override. An empty name clears it.
    pub async fn set_owner_override(&self, owner_id: &str, name: &str) -> StatusMessage {
        if let Err(e) = validate_owner_id(owner_id) {
            return StatusMessage::err(ERR_OWNER_ID_REQUIRED, e.to_string());
        }
        let owner_id = owner_id.trim();
        let Some(name) = normalize_override(name) else {
            return self.clear_owner_override(owner_id).await;
        };

        let mut overrides = self.orchestrator.state_store().load_overrides().await;
        overrides.insert(owner_id.to_string(), name.clone());
        self.persist_overrides(&overrides, format!("Name for {owner_id} set to \"{name}\""))
            .await
    }

    pub async fn clear_owner_override(&self, owner_id: &str) -> StatusMessage {
        if let Err(e) = validate_owner_id(owner_id) {
            return StatusMessage::err(ERR_OWNER_ID_REQUIRED, e.to_string());
        }
        let owner_id = owner_id.trim();

        let mut overrides = self.orchestrator.state_store().load_overrides().await;
        if overrides.remove(owner_id).is_none() {
            return StatusMessage::ok(format!("No override for {owner_id}"));
        }
        self.persist_overrides(&overrides, format!("Override for {owner_id} cleared"))
            .await
    }

    async fn persist_overrides(&self, overrides: &BTreeMap<OwnerId, String>, message: String) -> StatusMessage {
        match self.orchestrator.state_store().save_overrides(overrides).await {
            Ok(()) => {
                info!("{message}");
                StatusMessage::ok(message)
            }
            Err(e) => {
                warn!(error = %e, "failed to save owner overrides");
                StatusMessage::err(ERR_PERSIST_FAILED, format!("Could not save overrides: {e}"))
            }
        }
    }

    pub async fn naming_template(&self) -> String {
        self.orchestrator.state_store().load_template().await
    }

    pub async fn set_naming_template(&self, template: &str) -> StatusMessage {
        match self.orchestrator.state_store().save_template(template).await {
            Ok(saved) => StatusMessage::ok(format!("Template set to \"{saved}\"")),
            Err(e) => {
                warn!(error = %e, "failed to save naming template");
                StatusMessage::err(ERR_PERSIST_FAILED, format!("Could not save template: {e}"))
            }
        }
    }

    pub async fn reset_naming_template(&self) -> StatusMessage {
        let default = self.orchestrator.config().default_template.clone();
        self.set_naming_template(&default).await
    }

    pub async fn collection_backup(&self) -> BTreeMap<OwnerId, String> {
        self.orchestrator.state_store().load_collection_names().await
    }

    /// Forgets the remembered collection names. The collections themselves stay.
    pub async fn clear_collection_backup(&self) -> StatusMessage {
        match self
            .orchestrator
            .state_store()
            .save_collection_names(&BTreeMap::new())
            .await
        {
            Ok(()) => StatusMessage::ok("Collection name backup cleared"),
            Err(e) => StatusMessage::err(ERR_PERSIST_FAILED, format!("Could not clear backup: {e}")),
        }
    }

    pub async fn sync_now(&self) -> StatusMessage {
        match self.orchestrator.trigger(Trigger::Manual).await {
            RunOutcome::Completed(report) => {
                let failed = report.failed_owners();
                if failed == 0 {
                    StatusMessage::ok(format!("Synced {} owner collection(s)", report.owners.len()))
                } else {
                    StatusMessage::err(
                        ERR_SYNC_FAILED,
                        format!("{failed} of {} owner collection(s) failed", report.owners.len()),
                    )
                }
            }
            RunOutcome::Skipped(SkipReason::AlreadyRunning) => {
                StatusMessage::err(ERR_SYNC_BUSY, "A sync is already running")
            }
            RunOutcome::Skipped(reason) => StatusMessage::err(ERR_SYNC_BUSY, format!("Sync skipped: {reason:?}")),
            RunOutcome::Failed(e) => StatusMessage::err(ERR_SYNC_FAILED, format!("Sync failed: {e}")),
        }
    }
}
