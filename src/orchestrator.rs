//! Single-flight scheduling of reconciliation runs.
//!
//! A run is resolve owners → resolve names → reconcile each owner's
//! collection → persist the collection-name backup. At most one run executes
//! at a time; unforced triggers are also throttled by a minimum interval
//! since the last successful run.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{HostError, Result, SyncError};
use crate::host::{detect_adapter, HostBindings, HostCapabilities, SnapshotAdapter};
use crate::logging::ActivityLog;
use crate::store::{KeyValueStore, PersistedState, StateStore};
use crate::sync_engine::types::{OwnerId, OwnerPlan, Ownership, RunReport, SharedEntry, StepResult};
use crate::sync_engine::{
    desired_collection_name, disambiguate_collection_names, merge_name_sources, resolve_display_name, CollectionReconciler,
    OwnershipResolver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// First run after the host became ready.
    Activation,
    /// Explicit "sync now" from the settings surface.
    Manual,
    Navigation,
    Tick,
}

impl Trigger {
    pub fn is_forced(self) -> bool {
        matches!(self, Trigger::Activation | Trigger::Manual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Throttled { since_last: Duration },
    IrrelevantPath(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunReport),
    Skipped(SkipReason),
    Failed(String),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

#[derive(Debug)]
struct Schedule {
    state: RunState,
    last_success: Option<DateTime<Utc>>,
}

/// Returns the orchestrator to `Idle` however the run ends.
struct RunGuard<'a> {
    schedule: &'a Mutex<Schedule>,
    succeeded_at: Option<DateTime<Utc>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut schedule = self.schedule.lock().unwrap_or_else(|e| e.into_inner());
        schedule.state = RunState::Idle;
        if let Some(at) = self.succeeded_at {
            schedule.last_success = Some(at);
        }
    }
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    host: HostBindings,
    capabilities: HostCapabilities,
    state_store: StateStore,
    clock: Arc<dyn Clock>,
    activity: Arc<ActivityLog>,
    adapter: OnceLock<Box<dyn SnapshotAdapter>>,
    schedule: Mutex<Schedule>,
    last_display_names: Mutex<BTreeMap<OwnerId, String>>,
}

impl SyncOrchestrator {
    pub fn new(config: SyncConfig, host: HostBindings, storage: Arc<dyn KeyValueStore>) -> Self {
        let state_store = StateStore::new(storage, config.storage_keys.clone(), config.default_template.clone());
        let capabilities = host.capabilities();
        Self {
            config,
            host,
            capabilities,
            state_store,
            clock: Arc::new(SystemClock),
            activity: Arc::new(ActivityLog::default()),
            adapter: OnceLock::new(),
            schedule: Mutex::new(Schedule {
                state: RunState::Idle,
                last_success: None,
            }),
            last_display_names: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_activity_log(mut self, activity: Arc<ActivityLog>) -> Self {
        self.activity = activity;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> RunState {
        self.schedule().state
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.schedule().last_success
    }

    /// Display names resolved by the most recent completed run.
    pub fn last_display_names(&self) -> BTreeMap<OwnerId, String> {
        self.last_display_names.lock().map(|n| n.clone()).unwrap_or_default()
    }

    fn try_begin(&self, trigger: Trigger) -> std::result::Result<RunGuard<'_>, SkipReason> {
        let mut schedule = self.schedule();
        if schedule.state == RunState::Running {
            return Err(SkipReason::AlreadyRunning);
        }
        if !trigger.is_forced() {
            if let Some(last) = schedule.last_success {
                let since_last = (self.clock.now() - last).to_std().unwrap_or_default();
                if since_last < self.config.min_run_interval() {
                    return Err(SkipReason::Throttled { since_last });
                }
            }
        }
        schedule.state = RunState::Running;
        Ok(RunGuard {
            schedule: &self.schedule,
            succeeded_at: None,
        })
    }

    /// Wait for the host, let it settle, then run once, forced.
    pub async fn activate(&self) -> RunOutcome {
        if let Err(e) = self.host.readiness.wait_ready().await {
            let err = SyncError::NotReady(e.to_string());
            error!(error = %err, "activation aborted");
            return RunOutcome::Failed(err.to_string());
        }
        let settle = self.config.settle_delay();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        self.trigger(Trigger::Activation).await
    }

    pub async fn on_navigation(&self, path: &str) -> RunOutcome {
        if !self.config.is_relevant_path(path) {
            return RunOutcome::Skipped(SkipReason::IrrelevantPath(path.to_string()));
        }
        self.trigger(Trigger::Navigation).await
    }

    pub async fn on_tick(&self, current_path: Option<&str>) -> RunOutcome {
        match current_path {
            Some(path) if self.config.is_relevant_path(path) => self.trigger(Trigger::Tick).await,
            other => RunOutcome::Skipped(SkipReason::IrrelevantPath(other.unwrap_or_default().to_string())),
        }
    }

    pub async fn trigger(&self, trigger: Trigger) -> RunOutcome {
        let mut guard = match self.try_begin(trigger) {
            Ok(guard) => guard,
            Err(reason) => {
                debug!(?trigger, ?reason, "run skipped");
                return RunOutcome::Skipped(reason);
            }
        };

        info!(?trigger, "reconciliation run started");
        match self.run_once(trigger.is_forced()).await {
            Ok(report) => {
                guard.succeeded_at = Some(self.clock.now());
                let failed = report.failed_owners();
                let message = format!(
                    "Synced {} owner collection(s), {} failed",
                    report.owners.len() - failed,
                    failed
                );
                info!(owners = report.owners.len(), failed, "reconciliation run finished");
                self.activity.record(if failed == 0 { "info" } else { "warn" }, &message, None);
                RunOutcome::Completed(report)
            }
            Err(e) => {
                error!(error = %e, "reconciliation run failed");
                self.activity.record("error", &format!("Sync failed: {e}"), None);
                RunOutcome::Failed(e.to_string())
            }
        }
    }

    async fn run_once(&self, force: bool) -> Result<RunReport> {
        let mut report = RunReport {
            legacy_cleanup: Some(self.cleanup_legacy().await),
            ..RunReport::default()
        };

        let mut persisted = self.state_store.load_all().await;
        let ownership = self.resolve_ownership(&mut persisted.lender_cache, true).await?;
        report.lookups = ownership.lookups.clone();

        let (remote, remote_step) = self.fetch_remote_names(&ownership, force).await;
        report.remote_names = Some(remote_step);
        let web_names = merge_name_sources(&remote, &ownership.owner_name_hints);

        let reconciler = CollectionReconciler::new(
            self.host.collections.as_ref(),
            self.capabilities,
            self.config.add_batch_size,
        );
        let mut backup = persisted.collection_names.clone();
        let (display_names, desired_names) = Self::plan_names(&ownership, &web_names, &persisted);

        for (owner_id, items) in &ownership.owner_to_items {
            let Some(desired) = desired_names.get(owner_id) else {
                continue;
            };

            let step = match reconciler.reconcile_owner(owner_id, desired, items, &mut backup).await {
                Ok(outcome) => StepResult::Done(outcome),
                Err(e) => {
                    warn!(owner_id = %owner_id, error = %e, "owner reconciliation failed");
                    self.activity
                        .record("warn", &format!("Could not update \"{desired}\": {e}"), Some(owner_id));
                    StepResult::Failed(e.to_string())
                }
            };
            report.owners.insert(owner_id.clone(), step);
        }

        if backup != persisted.collection_names {
            match self.state_store.save_collection_names(&backup).await {
                Ok(()) => report.backup_persisted = true,
                Err(e) => warn!(error = %e, "failed to persist collection name backup"),
            }
        }

        if let Ok(mut names) = self.last_display_names.lock() {
            *names = display_names;
        }
        Ok(report)
    }

    /// Plans every owner without mutating the host or persisting anything.
    pub async fn dry_run(&self) -> Result<Vec<OwnerPlan>> {
        let mut persisted = self.state_store.load_all().await;
        let ownership = self.resolve_ownership(&mut persisted.lender_cache, false).await?;
        let (remote, _) = self.fetch_remote_names(&ownership, false).await;
        let web_names = merge_name_sources(&remote, &ownership.owner_name_hints);

        let reconciler = CollectionReconciler::new(
            self.host.collections.as_ref(),
            self.capabilities,
            self.config.add_batch_size,
        );

        let (_, desired_names) = Self::plan_names(&ownership, &web_names, &persisted);
        let mut plans = Vec::with_capacity(ownership.owner_to_items.len());
        for (owner_id, items) in &ownership.owner_to_items {
            let Some(desired) = desired_names.get(owner_id) else {
                continue;
            };
            plans.push(
                reconciler
                    .plan_owner(owner_id, desired, items, &persisted.collection_names)
                    .await?,
            );
        }
        Ok(plans)
    }

    /// Display name and unique desired collection name per owner.
    fn plan_names(
        ownership: &Ownership,
        web_names: &BTreeMap<OwnerId, String>,
        persisted: &PersistedState,
    ) -> (BTreeMap<OwnerId, String>, BTreeMap<OwnerId, String>) {
        let mut display_names = BTreeMap::new();
        let mut desired = BTreeMap::new();
        for owner_id in ownership.owner_to_items.keys() {
            let display = resolve_display_name(owner_id, web_names, &persisted.overrides);
            desired.insert(
                owner_id.clone(),
                desired_collection_name(&persisted.template, &display, owner_id),
            );
            display_names.insert(owner_id.clone(), display);
        }
        (display_names, disambiguate_collection_names(&desired))
    }

    async fn resolve_ownership(
        &self,
        cache: &mut crate::sync_engine::types::LenderCache,
        persist: bool,
    ) -> Result<Ownership> {
        let entries = self.snapshot_entries().await?;
        let resolver = OwnershipResolver::new(
            self.host.lender_lookup.as_deref(),
            self.clock.as_ref(),
            self.config.lender_cache_ttl(),
            self.config.lookup_concurrency,
        );
        let resolver = if persist {
            resolver.persisting_to(&self.state_store)
        } else {
            resolver
        };
        Ok(resolver.resolve(&entries, cache).await)
    }

    async fn snapshot_entries(&self) -> Result<Vec<SharedEntry>> {
        let Some(raw) = self.host.snapshot.snapshot().await? else {
            debug!("host has no sharing snapshot yet");
            return Ok(Vec::new());
        };

        let adapter = match self.adapter.get() {
            Some(adapter) => adapter,
            None => match detect_adapter(&raw) {
                Some(detected) => {
                    info!(shape = detected.version(), "detected sharing snapshot shape");
                    self.adapter.get_or_init(|| detected)
                }
                None => {
                    debug!("sharing snapshot has no recognizable entries");
                    return Ok(Vec::new());
                }
            },
        };
        Ok(adapter.entries(&raw))
    }

    async fn fetch_remote_names(&self, ownership: &Ownership, force: bool) -> (BTreeMap<OwnerId, String>, StepResult<usize>) {
        let Some(source) = self.host.owner_names.as_deref() else {
            return (BTreeMap::new(), StepResult::Skipped("remote names unavailable".to_string()));
        };
        let owners: Vec<OwnerId> = ownership.owner_to_items.keys().cloned().collect();
        if owners.is_empty() {
            return (BTreeMap::new(), StepResult::Done(0));
        }

        match source.resolve_names(&owners, force).await {
            Ok(names) => {
                let count = names.len();
                (names, StepResult::Done(count))
            }
            Err(e) => {
                warn!(error = %e, "remote owner name lookup failed");
                (BTreeMap::new(), StepResult::Failed(e.to_string()))
            }
        }
    }

    /// Deletes collections left behind under the old fixed name. A no-op once
    /// they are gone.
    async fn cleanup_legacy(&self) -> StepResult<bool> {
        let name = self.config.legacy_collection_name.trim();
        if name.is_empty() {
            return StepResult::Skipped("no legacy name configured".to_string());
        }

        let mut removed = false;
        // bounded in case the host keeps reporting a collection it cannot delete
        for _ in 0..16 {
            let found = match self.host.collections.find_by_name(name).await {
                Ok(found) => found,
                Err(e) => return Self::legacy_failure(e),
            };
            let Some(collection) = found else {
                break;
            };
            if let Err(e) = self.host.collections.delete(&collection.id).await {
                return Self::legacy_failure(e);
            }
            info!(id = %collection.id, name, "removed legacy collection");
            removed = true;
        }
        StepResult::Done(removed)
    }

    fn legacy_failure(e: HostError) -> StepResult<bool> {
        if e.is_unsupported() {
            StepResult::Skipped(e.to_string())
        } else {
            warn!(error = %e, "legacy collection cleanup failed");
            StepResult::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::{MemoryHost, Mutation};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn config() -> SyncConfig {
        SyncConfig {
            settle_delay_ms: 0,
            ..SyncConfig::default()
        }
    }

    fn orchestrator(host: &MemoryHost, clock: &ManualClock) -> SyncOrchestrator {
        SyncOrchestrator::new(config(), HostBindings::from_memory(host), Arc::new(MemoryStore::new()))
            .with_clock(Arc::new(clock.clone()))
    }

    fn seeded_host() -> MemoryHost {
        let host = MemoryHost::new();
        host.set_snapshot(json!({
            "sharedLibraries": [{"ownerSteamId": "76561198000000001", "ownerName": "Alice", "appIds": [10, 20]}]
        }));
        host
    }

    #[tokio::test]
    async fn test_unforced_triggers_are_throttled() {
        let clock = ManualClock::default();
        let host = seeded_host();
        let orch = orchestrator(&host, &clock);

        assert!(orch.trigger(Trigger::Activation).await.is_completed());

        clock.advance(chrono::Duration::seconds(5));
        assert!(matches!(
            orch.trigger(Trigger::Tick).await,
            RunOutcome::Skipped(SkipReason::Throttled { .. })
        ));
        assert!(orch.trigger(Trigger::Manual).await.is_completed());

        clock.advance(chrono::Duration::seconds(16));
        assert!(orch.trigger(Trigger::Navigation).await.is_completed());
        assert_eq!(orch.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_irrelevant_paths_do_not_trigger() {
        let clock = ManualClock::default();
        let host = seeded_host();
        let orch = orchestrator(&host, &clock);

        assert!(matches!(
            orch.on_navigation("/store/app/10").await,
            RunOutcome::Skipped(SkipReason::IrrelevantPath(_))
        ));
        assert!(matches!(orch.on_tick(None).await, RunOutcome::Skipped(SkipReason::IrrelevantPath(_))));
        assert!(orch.on_navigation("/library/home").await.is_completed());
        assert!(orch.last_success().is_some());
    }

    #[tokio::test]
    async fn test_failed_run_releases_lock_without_recording_success() {
        struct BrokenSnapshot;

        #[async_trait::async_trait]
        impl crate::host::SharingSnapshotSource for BrokenSnapshot {
            async fn snapshot(&self) -> std::result::Result<Option<serde_json::Value>, HostError> {
                Err(HostError::Remote("boom".into()))
            }
        }

        let clock = ManualClock::default();
        let host = seeded_host();
        let mut bindings = HostBindings::from_memory(&host);
        bindings.snapshot = Arc::new(BrokenSnapshot);
        let orch = SyncOrchestrator::new(config(), bindings, Arc::new(MemoryStore::new()))
            .with_clock(Arc::new(clock.clone()));

        assert!(matches!(orch.trigger(Trigger::Tick).await, RunOutcome::Failed(_)));
        assert_eq!(orch.state(), RunState::Idle);
        assert_eq!(orch.last_success(), None);
        // not throttled: there was no success to measure from
        assert!(matches!(orch.trigger(Trigger::Tick).await, RunOutcome::Failed(_)));
        assert_eq!(orch.activity().latest().unwrap().level, "error");
    }

    #[tokio::test]
    async fn test_legacy_collection_removed_once() {
        let clock = ManualClock::default();
        let host = seeded_host();
        let legacy = host.seed_collection("Family Shared", &[10]);
        let orch = orchestrator(&host, &clock);

        let RunOutcome::Completed(first) = orch.trigger(Trigger::Manual).await else {
            panic!("first run did not complete");
        };
        assert_eq!(first.legacy_cleanup, Some(StepResult::Done(true)));
        assert!(host.journal().contains(&Mutation::Delete { id: legacy }));

        let RunOutcome::Completed(second) = orch.trigger(Trigger::Manual).await else {
            panic!("second run did not complete");
        };
        assert_eq!(second.legacy_cleanup, Some(StepResult::Done(false)));
    }

    #[tokio::test]
    async fn test_remote_name_failure_is_reported_and_hint_used() {
        let clock = ManualClock::default();
        let host = seeded_host();
        host.fail_names();
        let orch = orchestrator(&host, &clock);

        let RunOutcome::Completed(report) = orch.trigger(Trigger::Manual).await else {
            panic!("run did not complete");
        };
        assert!(matches!(report.remote_names, Some(StepResult::Failed(_))));
        assert!(host.collection_named("Alice's Library").is_some());
        assert_eq!(orch.last_display_names()["76561198000000001"], "Alice");
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_mutating() {
        let clock = ManualClock::default();
        let host = seeded_host();
        let orch = orchestrator(&host, &clock);

        let plans = orch.dry_run().await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].desired_name, "Alice's Library");
        assert_eq!(plans[0].diff.to_add, vec![10, 20]);
        assert!(host.journal().is_empty());
    }
}
