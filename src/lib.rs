pub mod clock;
pub mod config;
pub mod error;
pub mod error_codes;
pub mod host;
pub mod input_validation;
pub mod logging;
pub mod orchestrator;
pub mod profile_names;
pub mod settings;
pub mod store;
pub mod sync_engine;
pub mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use error::{HostError, StoreError, SyncError};
pub use host::{HostBindings, HostCapabilities, MemoryHost};
pub use orchestrator::{RunOutcome, RunState, SkipReason, SyncOrchestrator, Trigger};
pub use profile_names::ProfileNameService;
pub use settings::{SettingsService, StatusMessage};
pub use store::{FallbackStore, JsonFileStore, KeyValueStore, MemoryStore, StateStore};
pub use sync_engine::types::{OwnerPlan, RunReport, StepResult};
pub use trigger::{NavigationEvent, TriggerHandle};

/// Crate version, as reported in the settings view footer.
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
