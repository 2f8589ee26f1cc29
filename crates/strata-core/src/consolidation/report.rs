//! Run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a run writes to the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunMode {
    /// Classify and plan, but write nothing and embed nothing.
    DryRun,
    #[default]
    Execute,
}

/// Where a run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "state", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Idle,
    Scanning { level: u32 },
    Grouping { level: u32 },
    Evaluating { level: u32 },
    Reporting,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    /// Stopped early by cancellation. Finished units are kept.
    Cancelled,
    /// Aborted by an unrecoverable store failure.
    Failed,
}

/// Category of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunErrorKind {
    /// The oracle failed; the set was kept separate.
    Classification,
    /// A neighbor search failed; the fragment was not grouped this run.
    Search,
    /// Writing a promoted fragment failed; nothing was changed.
    Write,
    /// The promoted fragment exists but some inputs were not marked.
    PartialPromotion,
    Scan,
    /// A unit was skipped because the run was cancelled.
    Cancelled,
    Internal,
}

/// One recorded error. Errors never stop other sets from being processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_id: Option<String>,
    /// Fragments the error concerns. For partial promotions, the inputs left
    /// unmarked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragment_ids: Vec<String>,
    pub message: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            level: None,
            set_id: None,
            fragment_ids: Vec::new(),
            message: message.into(),
        }
    }

    pub fn at_level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    pub fn for_set(mut self, set_id: impl Into<String>) -> Self {
        self.set_id = Some(set_id.into());
        self
    }

    pub fn with_fragments(mut self, fragment_ids: Vec<String>) -> Self {
        self.fragment_ids = fragment_ids;
        self
    }
}

/// A merge a dry run would have performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedMerge {
    pub set_id: String,
    pub promoted_id: String,
    pub member_ids: Vec<String>,
    pub target_level: u32,
    pub source_ids: Vec<String>,
    pub content: String,
}

/// Counters for one level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelReport {
    pub level: u32,
    pub pages: usize,
    pub fragments_scanned: usize,
    /// Points dropped by the scanner as undecodable or out of level.
    pub skipped: usize,
    pub candidate_sets: usize,
    /// Sets whose classification finished.
    pub candidates_evaluated: usize,
    /// Promoted fragments written (or found already written).
    pub merged: usize,
    /// Inputs marked superseded.
    pub superseded: usize,
    pub kept_separate: usize,
    /// Fragments left for a later run.
    pub deferred: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<PlannedMerge>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RunError>,
}

impl LevelReport {
    pub fn new(level: u32) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }
}

/// Outcome of one consolidation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub collection: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub levels: Vec<LevelReport>,
    /// States the run passed through, in order.
    pub transitions: Vec<RunState>,
    /// Why the run failed, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl RunReport {
    pub fn new(collection: impl Into<String>, mode: RunMode) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            collection: collection.into(),
            mode,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            levels: Vec::new(),
            transitions: vec![RunState::Idle],
            failure: None,
        }
    }

    /// Record a state change. Repeats of the current state are ignored.
    pub fn transition(&mut self, state: RunState) {
        if self.transitions.last() != Some(&state) {
            tracing::info!(run_id = %self.run_id, state = %state, "Run state changed");
            self.transitions.push(state);
        }
    }

    pub fn state(&self) -> RunState {
        self.transitions.last().copied().unwrap_or(RunState::Idle)
    }

    /// Close the report.
    pub fn finish(&mut self, status: RunStatus) {
        self.transition(RunState::Reporting);
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode == RunMode::DryRun
    }

    pub fn total_merged(&self) -> usize {
        self.levels.iter().map(|l| l.merged).sum()
    }

    pub fn total_superseded(&self) -> usize {
        self.levels.iter().map(|l| l.superseded).sum()
    }

    pub fn total_evaluated(&self) -> usize {
        self.levels.iter().map(|l| l.candidates_evaluated).sum()
    }

    pub fn total_kept_separate(&self) -> usize {
        self.levels.iter().map(|l| l.kept_separate).sum()
    }

    pub fn total_deferred(&self) -> usize {
        self.levels.iter().map(|l| l.deferred.len()).sum()
    }

    /// Merges a dry run would have performed.
    pub fn planned(&self) -> impl Iterator<Item = &PlannedMerge> {
        self.levels.iter().flat_map(|l| l.planned.iter())
    }

    pub fn errors(&self) -> impl Iterator<Item = &RunError> {
        self.levels.iter().flat_map(|l| l.errors.iter())
    }

    pub fn error_count(&self) -> usize {
        self.levels.iter().map(|l| l.errors.len()).sum()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let merges = if self.is_dry_run() {
            format!("{} potential merges", self.planned().count())
        } else {
            format!(
                "{} merged, {} superseded",
                self.total_merged(),
                self.total_superseded()
            )
        };
        format!(
            "{} run {} on '{}': {}; {} evaluated, {} kept separate, {} deferred, {} errors",
            self.status,
            self.mode,
            self.collection,
            merges,
            self.total_evaluated(),
            self.total_kept_separate(),
            self.total_deferred(),
            self.error_count()
        )
    }
}
