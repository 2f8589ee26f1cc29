//! Applying classification decisions to the store.
//!
//! A merge writes in two steps. The promoted fragment is created first, under
//! an id derived from its inputs, and only then are the inputs marked as
//! superseded. A crash between the steps leaves a promoted fragment whose
//! inputs are still active; the next run regroups the same inputs, derives
//! the same id, finds the fragment, and finishes the marking.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::config::MergeConfig;
use super::decision::ClassificationDecision;
use super::grouper::CandidateSet;
use super::report::{PlannedMerge, RunError, RunErrorKind, RunMode};
use crate::error::StrataResult;
use crate::retry::{retry_transient, RetryPolicy};
use crate::similarity::normalized_centroid;
use crate::traits::{Embedder, VectorStore};
use crate::types::{keys, merge_lineage, Fragment, FragmentPayload};

/// Deterministic id of the fragment promoted from `member_ids`.
///
/// Independent of member order.
pub fn promoted_id<S: AsRef<str>>(member_ids: &[S]) -> String {
    let mut ids: Vec<&str> = member_ids.iter().map(AsRef::as_ref).collect();
    ids.sort_unstable();
    ids.dedup();
    let name = format!("strata:promoted:{}", ids.join("\n"));
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Plan the promotion of `members` into one fragment with `content`.
pub fn plan_merge(
    set_id: &str,
    members: &[Fragment],
    content: &str,
    max_source_ids: usize,
) -> PlannedMerge {
    let member_ids: Vec<String> = members.iter().map(|f| f.id.clone()).collect();
    let lineage = merge_lineage(members, max_source_ids);
    PlannedMerge {
        set_id: set_id.to_string(),
        promoted_id: promoted_id(&member_ids),
        target_level: members.iter().map(Fragment::level).max().unwrap_or(0) + 1,
        member_ids,
        source_ids: lineage.source_ids,
        content: content.to_string(),
    }
}

/// What applying one decision did.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Ids of promoted fragments that now exist.
    pub promoted: Vec<String>,
    /// Inputs marked superseded.
    pub superseded: usize,
    pub kept_separate: bool,
    pub planned: Vec<PlannedMerge>,
    pub errors: Vec<RunError>,
}

/// Writes merge results.
#[derive(Clone)]
pub struct Merger {
    store: Arc<dyn VectorStore>,
    embedder: Option<Arc<dyn Embedder>>,
    config: MergeConfig,
    retry: RetryPolicy,
}

impl Merger {
    pub fn new(store: Arc<dyn VectorStore>, config: MergeConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            embedder: None,
            config,
            retry,
        }
    }

    /// Embed merged content instead of averaging the inputs' vectors.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Apply `decision` to `set`. Failures are recorded in the outcome.
    pub async fn apply(
        &self,
        set: &CandidateSet,
        decision: &ClassificationDecision,
        mode: RunMode,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        match decision {
            ClassificationDecision::KeepSeparate => outcome.kept_separate = true,
            ClassificationDecision::Merge { merged_content } => {
                self.merge_group(set, &set.members, merged_content, mode, &mut outcome)
                    .await;
            }
            // Subgroups are subsets of a set already capped by the grouper.
            ClassificationDecision::PartialMerge { subgroups } => {
                for subgroup in subgroups {
                    let members: Vec<Fragment> = set
                        .members
                        .iter()
                        .filter(|f| subgroup.member_ids.contains(&f.id))
                        .cloned()
                        .collect();
                    self.merge_group(set, &members, &subgroup.merged_content, mode, &mut outcome)
                        .await;
                }
            }
        }

        outcome
    }

    async fn merge_group(
        &self,
        set: &CandidateSet,
        members: &[Fragment],
        content: &str,
        mode: RunMode,
        outcome: &mut ApplyOutcome,
    ) {
        let plan = plan_merge(&set.id, members, content, self.config.max_source_ids);

        if mode == RunMode::DryRun {
            tracing::info!(
                set_id = %set.id,
                promoted_id = %plan.promoted_id,
                members = plan.member_ids.len(),
                "Would merge"
            );
            outcome.planned.push(plan);
            return;
        }

        if let Err(err) = self.ensure_promoted(members, &plan).await {
            tracing::error!(set_id = %set.id, error = %err, "Failed to write promoted fragment");
            outcome.errors.push(
                RunError::new(RunErrorKind::Write, err.to_string())
                    .at_level(set.level)
                    .for_set(&set.id)
                    .with_fragments(plan.member_ids.clone()),
            );
            return;
        }
        outcome.promoted.push(plan.promoted_id.clone());

        let now = Utc::now();
        let mut unmarked = Vec::new();
        let mut last_error = None;
        for member in members {
            match self.mark_superseded(&member.id, &plan.promoted_id, now).await {
                Ok(()) => outcome.superseded += 1,
                Err(err) => {
                    tracing::warn!(
                        fragment_id = %member.id,
                        promoted_id = %plan.promoted_id,
                        error = %err,
                        "Failed to mark fragment superseded"
                    );
                    unmarked.push(member.id.clone());
                    last_error = Some(err);
                }
            }
        }

        if let Some(err) = last_error {
            outcome.errors.push(
                RunError::new(
                    RunErrorKind::PartialPromotion,
                    format!(
                        "promoted fragment {} written but {} of {} inputs left active: {}",
                        plan.promoted_id,
                        unmarked.len(),
                        members.len(),
                        err
                    ),
                )
                .at_level(set.level)
                .for_set(&set.id)
                .with_fragments(unmarked),
            );
        } else {
            tracing::info!(
                set_id = %set.id,
                promoted_id = %plan.promoted_id,
                level = plan.target_level,
                members = members.len(),
                "Merged candidate set"
            );
        }
    }

    /// Write the promoted fragment unless a previous run already did.
    async fn ensure_promoted(&self, members: &[Fragment], plan: &PlannedMerge) -> StrataResult<()> {
        let store = &self.store;
        let ids = vec![plan.promoted_id.clone()];
        let existing = retry_transient(&self.retry, "retrieve", || store.retrieve(&ids)).await?;
        if !existing.is_empty() {
            tracing::debug!(promoted_id = %plan.promoted_id, "Promoted fragment already exists");
            return Ok(());
        }

        let vector = self.vector_for(members, &plan.content).await?;
        let lineage = merge_lineage(members, self.config.max_source_ids);
        let now = Utc::now();
        let mut payload = FragmentPayload::new(plan.content.clone(), plan.target_level)
            .with_source_ids(lineage.source_ids)
            .with_created_at(now);
        payload.last_consolidated_at = Some(now);
        payload.source_ids_truncated = lineage.truncated;

        let record = Fragment::new(plan.promoted_id.clone(), vector, payload).into_record()?;
        retry_transient(&self.retry, "upsert", || store.upsert(vec![record.clone()])).await
    }

    async fn vector_for(&self, members: &[Fragment], content: &str) -> StrataResult<Vec<f32>> {
        if let Some(embedder) = &self.embedder {
            return retry_transient(&self.retry, "embed", || embedder.embed(content)).await;
        }
        normalized_centroid(members.iter().map(|f| f.vector.as_slice())).ok_or_else(|| {
            crate::error::StrataError::validation(
                "Cannot derive a vector for the promoted fragment from its inputs",
            )
        })
    }

    async fn mark_superseded(
        &self,
        id: &str,
        promoted_id: &str,
        at: chrono::DateTime<Utc>,
    ) -> StrataResult<()> {
        let patch: HashMap<String, serde_json::Value> = HashMap::from([
            (keys::SUPERSEDED_BY.to_string(), json!(promoted_id)),
            (keys::LAST_CONSOLIDATED_AT.to_string(), json!(at)),
        ]);
        let store = &self.store;
        retry_transient(&self.retry, "set_payload", || {
            store.set_payload(id, patch.clone())
        })
        .await
    }
}
