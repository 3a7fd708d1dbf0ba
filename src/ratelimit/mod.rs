//! Rate limiting logic and state management.

mod audit;
mod backend;
mod counter;
mod decision;
mod limiter;
mod lists;
mod pattern;
mod registry;
mod rules;

pub use audit::{AuditLog, RequestRecord};
pub use backend::{MemoryRuleRepository, RuleRepository};
pub use counter::{BucketState, SlidingWindow};
pub use decision::{
    metadata_keys, AdmissionRequest, Decision, DecisionReason, Metadata, UNLIMITED_REMAINING,
};
pub use limiter::AdmissionController;
pub use lists::{IdentifierList, ListEntry, ListKind};
pub use pattern::Pattern;
pub use registry::{BucketKey, BucketRegistry};
pub use rules::{Rule, RuleDefaults, RuleDraft, RuleId, RulePatch, RuleSet, RuleStore, Scope};
