//! Run orchestration.
//!
//! A run walks levels `0..max_level` in order. Each level is scanned page by
//! page; every page is grouped, and every candidate set becomes one unit of
//! work (classify, then apply) on the adaptive scheduler. A level finishes
//! only when all of its units have, so fragments promoted at level `L` are
//! visible to the scan of level `L + 1` in the same run.

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::classifier::{ClassificationOutcome, ClassifierGateway};
use super::config::ConsolidationConfig;
use super::grouper::{CandidateGrouper, CandidateSet};
use super::merger::{ApplyOutcome, Merger};
use super::report::{LevelReport, RunError, RunErrorKind, RunMode, RunReport, RunState, RunStatus};
use super::scanner::LevelScanner;
use crate::error::{ErrorCode, StrataError, StrataResult};
use crate::pressure::PressureSampler;
use crate::retry::retry_transient;
use crate::scheduler::{AdaptiveScheduler, TaskHandle};
use crate::traits::{CollectionInfo, DistanceMetric, Embedder, Llm, VectorStore};

/// Collections with a run in progress, shared by every coordinator that
/// should exclude each other.
#[derive(Debug, Default)]
pub struct RunRegistry {
    active: Mutex<HashSet<String>>,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `collection` until the returned lease is dropped.
    pub fn try_acquire(self: &Arc<Self>, collection: &str) -> StrataResult<RunLease> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(collection.to_string()) {
            return Err(StrataError::RunInProgress {
                collection: collection.to_string(),
            });
        }
        Ok(RunLease {
            registry: Arc::clone(self),
            collection: collection.to_string(),
        })
    }

    pub fn is_running(&self, collection: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(collection)
    }
}

/// Exclusive claim on a collection.
#[derive(Debug)]
pub struct RunLease {
    registry: Arc<RunRegistry>,
    collection: String,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.collection);
    }
}

/// Output of one unit of work.
struct UnitResult {
    set: CandidateSet,
    classification: ClassificationOutcome,
    applied: Option<ApplyOutcome>,
}

/// Runs consolidation over one collection.
pub struct ConsolidationCoordinator {
    store: Arc<dyn VectorStore>,
    llm: Arc<dyn Llm>,
    embedder: Option<Arc<dyn Embedder>>,
    config: ConsolidationConfig,
    sampler: Option<PressureSampler>,
    registry: Arc<RunRegistry>,
}

impl ConsolidationCoordinator {
    pub fn new(store: Arc<dyn VectorStore>, llm: Arc<dyn Llm>, config: ConsolidationConfig) -> Self {
        Self {
            store,
            llm,
            embedder: None,
            config,
            sampler: None,
            registry: RunRegistry::new(),
        }
    }

    /// Embed merged content rather than averaging input vectors.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Use this sampler instead of reading host pressure.
    pub fn with_pressure_sampler(mut self, sampler: PressureSampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Share run exclusion with other coordinators.
    pub fn with_run_registry(mut self, registry: Arc<RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Verify the store is reachable and the collection exists.
    ///
    /// Grouping compares search scores against a cosine threshold, so a
    /// collection using any other distance metric is refused.
    pub async fn check(&self) -> StrataResult<CollectionInfo> {
        let store = &self.store;
        let info = retry_transient(&self.config.store_retry, "require_collection", || {
            store.require_collection()
        })
        .await
        .map_err(|err| {
            let code = match err.code() {
                ErrorCode::VecCollectionNotFound => ErrorCode::PreCollectionMissing,
                _ => ErrorCode::PreStoreUnreachable,
            };
            StrataError::Precondition {
                message: format!(
                    "Collection '{}' is not available: {}",
                    store.collection_name(),
                    err
                ),
                code,
                source: Some(Box::new(err)),
            }
        })?;

        if info.distance != DistanceMetric::Cosine {
            return Err(StrataError::precondition(
                format!(
                    "Collection '{}' uses {:?} distance; consolidation requires cosine",
                    info.name, info.distance
                ),
                ErrorCode::PreUnsupportedDistance,
            ));
        }
        Ok(info)
    }

    /// Run consolidation once.
    ///
    /// Fails only on invalid configuration, an unmet precondition, or a run
    /// already in progress on the same collection. Everything else is
    /// recorded in the report; an unrecoverable store failure mid-run yields
    /// a report with [`RunStatus::Failed`].
    pub async fn run(&self, mode: RunMode, cancel: CancellationToken) -> StrataResult<RunReport> {
        self.config.validate()?;
        let collection = self.store.collection_name().to_string();
        let _lease = self.registry.try_acquire(&collection)?;

        let mut report = RunReport::new(&collection, mode);
        tracing::info!(
            run_id = %report.run_id,
            collection = %collection,
            mode = %mode,
            max_level = self.config.max_level,
            "Starting consolidation run"
        );

        let info = self.check().await?;
        tracing::debug!(
            collection = %info.name,
            points = info.vector_count,
            dimension = info.dimension,
            "Collection available"
        );

        let background = cancel.child_token();
        let _stop_background = background.clone().drop_guard();

        let sampler = match &self.sampler {
            Some(sampler) => sampler.clone(),
            None => PressureSampler::host(&self.config.pressure),
        };
        sampler.refresh().await;
        let refresher = sampler.spawn_refresher(
            Duration::from_millis(self.config.pressure.refresh_interval_ms.max(1)),
            background.clone(),
        );

        let scheduler =
            AdaptiveScheduler::new(self.config.scheduler.clone(), sampler, cancel.clone());
        let rebalancer = scheduler.spawn_rebalancer(background.clone());

        let scanner = LevelScanner::new(Arc::clone(&self.store), self.config.store_retry.clone());
        let grouper = CandidateGrouper::new(
            Arc::clone(&self.store),
            self.config.grouping.clone(),
            self.config.store_retry.clone(),
        );
        let classifier = ClassifierGateway::new(Arc::clone(&self.llm), self.config.classifier.clone());
        let mut merger = Merger::new(
            Arc::clone(&self.store),
            self.config.merge.clone(),
            self.config.store_retry.clone(),
        );
        if let Some(embedder) = &self.embedder {
            merger = merger.with_embedder(Arc::clone(embedder));
        }

        let mut status = RunStatus::Completed;
        for level in 0..self.config.max_level {
            if cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }

            let mut level_report = LevelReport::new(level);
            let level_status = self
                .run_level(
                    level,
                    mode,
                    &cancel,
                    &scheduler,
                    &scanner,
                    &grouper,
                    &classifier,
                    &merger,
                    &mut report,
                    &mut level_report,
                )
                .await;

            tracing::info!(
                level,
                pages = level_report.pages,
                sets = level_report.candidate_sets,
                merged = level_report.merged,
                planned = level_report.planned.len(),
                kept_separate = level_report.kept_separate,
                errors = level_report.errors.len(),
                "Level finished"
            );
            report.levels.push(level_report);

            if level_status != RunStatus::Completed {
                status = level_status;
                if status == RunStatus::Failed && report.failure.is_none() {
                    report.failure = Some(format!("level {} aborted", level));
                }
                break;
            }
        }

        background.cancel();
        let _ = refresher.await;
        let _ = rebalancer.await;

        report.finish(status);
        tracing::info!(
            run_id = %report.run_id,
            duration_ms = report.duration_ms(),
            "{}",
            report.summary()
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_level(
        &self,
        level: u32,
        mode: RunMode,
        cancel: &CancellationToken,
        scheduler: &AdaptiveScheduler,
        scanner: &LevelScanner,
        grouper: &CandidateGrouper,
        classifier: &ClassifierGateway,
        merger: &Merger,
        report: &mut RunReport,
        level_report: &mut LevelReport,
    ) -> RunStatus {
        let mut status = RunStatus::Completed;
        let mut claimed: HashSet<String> = HashSet::new();
        let mut pending = FuturesUnordered::new();
        let mut scan = scanner.scan(level, self.config.page_size);

        'pages: loop {
            if cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }
            report.transition(RunState::Scanning { level });
            let page = match scan.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(level, error = %err, "Level scan failed");
                    level_report.errors.push(
                        RunError::new(RunErrorKind::Scan, err.to_string()).at_level(level),
                    );
                    report.failure = Some(format!("scan of level {} failed: {}", level, err));
                    status = RunStatus::Failed;
                    break;
                }
            };
            level_report.pages += 1;
            level_report.fragments_scanned += page.fragments.len();
            level_report.skipped += page.skipped.len();
            for skipped in &page.skipped {
                tracing::debug!(fragment_id = %skipped.id, reason = %skipped.reason, "Skipped point");
            }

            report.transition(RunState::Grouping { level });
            let grouping = grouper.group(&page.fragments, level, &mut claimed).await;
            for failure in grouping.search_failures {
                level_report.errors.push(
                    RunError::new(RunErrorKind::Search, failure.error.to_string())
                        .at_level(level)
                        .with_fragments(vec![failure.fragment_id]),
                );
            }
            level_report.deferred.extend(grouping.deferred);
            level_report.candidate_sets += grouping.sets.len();

            report.transition(RunState::Evaluating { level });
            for set in grouping.sets {
                let set_id = set.id.clone();
                let member_ids = set.member_ids();
                let unit = Self::unit(set, mode, classifier.clone(), merger.clone(), cancel.clone());
                match scheduler.submit(unit).await {
                    Ok(handle) => pending.push(Self::tagged(set_id, member_ids, handle)),
                    Err(err) => {
                        level_report.errors.push(
                            RunError::new(RunErrorKind::Cancelled, err.to_string())
                                .at_level(level)
                                .for_set(set_id)
                                .with_fragments(member_ids),
                        );
                        status = RunStatus::Cancelled;
                        break 'pages;
                    }
                }
            }

            // Fold finished units without waiting.
            while let Some(Some(done)) = pending.next().now_or_never() {
                Self::record(level, done, level_report);
            }
        }

        // In-flight units always run to completion.
        while let Some(done) = pending.next().await {
            Self::record(level, done, level_report);
        }

        if status == RunStatus::Completed && cancel.is_cancelled() {
            status = RunStatus::Cancelled;
        }
        status
    }

    fn unit(
        set: CandidateSet,
        mode: RunMode,
        classifier: ClassifierGateway,
        merger: Merger,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = UnitResult> + Send + 'static {
        async move {
            let classification = classifier.classify(&set).await;
            let applied = if cancel.is_cancelled() {
                None
            } else {
                Some(merger.apply(&set, &classification.decision, mode).await)
            };
            UnitResult {
                set,
                classification,
                applied,
            }
        }
    }

    async fn tagged(
        set_id: String,
        member_ids: Vec<String>,
        handle: TaskHandle<UnitResult>,
    ) -> (String, Vec<String>, StrataResult<UnitResult>) {
        (set_id, member_ids, handle.await)
    }

    fn record(
        level: u32,
        (set_id, member_ids, result): (String, Vec<String>, StrataResult<UnitResult>),
        level_report: &mut LevelReport,
    ) {
        let unit = match result {
            Ok(unit) => unit,
            Err(err) => {
                let kind = match &err {
                    StrataError::Cancelled(_) => RunErrorKind::Cancelled,
                    _ => RunErrorKind::Internal,
                };
                level_report.errors.push(
                    RunError::new(kind, err.to_string())
                        .at_level(level)
                        .for_set(set_id)
                        .with_fragments(member_ids),
                );
                return;
            }
        };

        level_report.candidates_evaluated += 1;
        if let Some(err) = &unit.classification.error {
            level_report.errors.push(
                RunError::new(
                    RunErrorKind::Classification,
                    format!(
                        "{} (after {} attempts)",
                        err, unit.classification.attempts
                    ),
                )
                .at_level(level)
                .for_set(&unit.set.id)
                .with_fragments(unit.set.member_ids()),
            );
        }

        let Some(applied) = unit.applied else {
            level_report.errors.push(
                RunError::new(RunErrorKind::Cancelled, "cancelled before applying decision")
                    .at_level(level)
                    .for_set(&unit.set.id)
                    .with_fragments(unit.set.member_ids()),
            );
            return;
        };
        if applied.kept_separate {
            level_report.kept_separate += 1;
        }
        level_report.merged += applied.promoted.len();
        level_report.superseded += applied.superseded;
        level_report.planned.extend(applied.planned);
        level_report.errors.extend(applied.errors);
    }
}
