//! The consolidation engine.
//!
//! A run scans each level for active fragments, groups similar ones into
//! candidate sets, asks the oracle what to do with each set, and promotes
//! merged content one level up. Inputs of a merge are never deleted; they
//! are marked with the id of the fragment that replaced them.

mod classifier;
mod config;
mod coordinator;
mod decision;
mod grouper;
mod json;
mod merger;
mod prompts;
mod report;
mod scanner;

pub use classifier::{ClassificationOutcome, ClassifierGateway};
pub use config::{ClassifierConfig, ConsolidationConfig, GroupingConfig, MergeConfig};
pub use coordinator::{ConsolidationCoordinator, RunLease, RunRegistry};
pub use decision::{
    decision_schema, decode_decision, ClassificationDecision, Subgroup, DECISION_SCHEMA_NAME,
};
pub use grouper::{CandidateGrouper, CandidateSet, GroupingOutcome, SearchFailure};
pub use json::extract_json;
pub use merger::{plan_merge, promoted_id, ApplyOutcome, Merger};
pub use prompts::{build_classification_messages, consolidation_prompt};
pub use report::{
    LevelReport, PlannedMerge, RunError, RunErrorKind, RunMode, RunReport, RunState, RunStatus,
};
pub use scanner::{level_filter, LevelScan, LevelScanner, ScanPage, SkippedPoint};
