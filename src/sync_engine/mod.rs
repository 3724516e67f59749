pub mod engine;
pub mod naming;
pub mod ownership;
pub mod types;

pub use engine::CollectionReconciler;
pub use naming::{
    desired_collection_name, disambiguate_collection_names, fallback_name, merge_name_sources, resolve_display_name,
};
pub use ownership::{pick_lender, OwnershipResolver};
pub use types::{
    Collection, CollectionAction, CollectionId, ItemId, LenderCacheEntry, LenderCandidate, MembershipDiff, OwnerId,
    OwnerOutcome, OwnerPlan, RenameMethod, RunReport, SharedEntry, StepResult,
};
