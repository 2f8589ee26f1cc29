//! Integration tests for consolidation runs.
//!
//! Runs go through the public coordinator API against the in-memory store,
//! with hand-written oracles standing in for an LLM provider.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_core::consolidation::{RunErrorKind, RunMode, RunRegistry, RunReport, RunStatus};
use strata_core::store::CursorStyle;
use strata_core::traits::{DistanceMetric, Embedder, GenerationOptions, Llm, LlmResponse};
use strata_core::{
    ConsolidationConfig, ConsolidationCoordinator, ErrorCode, Fragment, FragmentPayload,
    InMemoryVectorStore, Message, PressureSampler, RetryPolicy, SchedulerConfig, StrataError, StrataResult,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const MERGE: &str = r#"{"decision": "merge", "merged_content": "merged memory", "subgroups": [], "rationale": "same facts"}"#;

/// Answers every set with a fixed response.
struct FixedOracle {
    response: String,
    calls: AtomicUsize,
}

impl FixedOracle {
    fn merging() -> Arc<Self> {
        Self::answering(MERGE)
    }

    fn answering(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: response.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Llm for FixedOracle {
    async fn generate(
        &self,
        _messages: &[Message],
        _options: Option<GenerationOptions>,
    ) -> StrataResult<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(LlmResponse::text(self.response.clone()))
    }

    fn model_name(&self) -> &str {
        "fixed"
    }
}

/// Never answers within any reasonable deadline.
struct SilentOracle {
    calls: AtomicUsize,
}

#[async_trait]
impl Llm for SilentOracle {
    async fn generate(
        &self,
        _messages: &[Message],
        _options: Option<GenerationOptions>,
    ) -> StrataResult<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        Ok(LlmResponse::text(MERGE))
    }

    fn model_name(&self) -> &str {
        "silent"
    }
}

/// Answers only once a permit is released.
struct GatedOracle {
    gate: Semaphore,
}

#[async_trait]
impl Llm for GatedOracle {
    async fn generate(
        &self,
        _messages: &[Message],
        _options: Option<GenerationOptions>,
    ) -> StrataResult<LlmResponse> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StrataError::llm(e.to_string()))?;
        Ok(LlmResponse::text(MERGE))
    }

    fn model_name(&self) -> &str {
        "gated"
    }
}

/// Cancels the run on its first call, then merges.
struct CancellingOracle {
    cancel: CancellationToken,
}

#[async_trait]
impl Llm for CancellingOracle {
    async fn generate(
        &self,
        _messages: &[Message],
        _options: Option<GenerationOptions>,
    ) -> StrataResult<LlmResponse> {
        self.cancel.cancel();
        Ok(LlmResponse::text(MERGE))
    }

    fn model_name(&self) -> &str {
        "cancelling"
    }
}

/// Embeds all content to the same direction.
struct ConstantEmbedder;

#[async_trait]
impl Embedder for ConstantEmbedder {
    async fn embed(&self, _text: &str) -> StrataResult<Vec<f32>> {
        Ok(vec![0.0, 0.0, 1.0])
    }

    fn dimension(&self) -> usize {
        3
    }

    fn model_name(&self) -> &str {
        "constant"
    }
}

fn fragment(id: &str, level: u32, vector: Vec<f32>) -> Fragment {
    Fragment::new(
        id,
        vector,
        FragmentPayload::new(format!("memory {}", id), level),
    )
}

fn store_with(fragments: Vec<Fragment>) -> Arc<InMemoryVectorStore> {
    let dim = fragments.first().map(|f| f.vector.len()).unwrap_or(3);
    Arc::new(
        InMemoryVectorStore::new("memories", dim)
            .with_records(fragments.into_iter().map(|f| f.into_record().unwrap())),
    )
}

/// f1..f3 are near-duplicates; f4 and f5 point elsewhere.
fn five_fragments() -> Arc<InMemoryVectorStore> {
    store_with(vec![
        fragment("f1", 0, vec![1.0, 0.0, 0.0]),
        fragment("f2", 0, vec![0.99, 0.1, 0.0]),
        fragment("f3", 0, vec![0.98, 0.0, 0.15]),
        fragment("f4", 0, vec![0.0, 1.0, 0.0]),
        fragment("f5", 0, vec![0.0, 0.0, 1.0]),
    ])
}

fn config() -> ConsolidationConfig {
    let mut config = ConsolidationConfig::default();
    config.max_level = 3;
    config.page_size = 16;
    config.store_retry = RetryPolicy::none();
    config.scheduler = SchedulerConfig::fixed(2);
    config.classifier.initial_backoff_ms = 1;
    config.classifier.max_backoff_ms = 10;
    config
}

fn coordinator(
    store: Arc<InMemoryVectorStore>,
    llm: Arc<dyn Llm>,
    config: ConsolidationConfig,
) -> ConsolidationCoordinator {
    ConsolidationCoordinator::new(store, llm, config)
        .with_pressure_sampler(PressureSampler::fixed(0.0, 0.0))
}

async fn run(coordinator: &ConsolidationCoordinator, mode: RunMode) -> RunReport {
    coordinator
        .run(mode, CancellationToken::new())
        .await
        .expect("run should not fail")
}

async fn load(store: &InMemoryVectorStore, id: &str) -> Fragment {
    Fragment::from_record(store.get(id).await.expect("fragment present")).unwrap()
}

async fn active_at(store: &InMemoryVectorStore, level: u32) -> Vec<Fragment> {
    store
        .records()
        .await
        .into_iter()
        .map(|r| Fragment::from_record(r).unwrap())
        .filter(|f| f.level() == level && !f.is_superseded())
        .collect()
}

#[tokio::test]
async fn test_similar_fragments_merge_and_others_stay() {
    let store = five_fragments();
    let oracle = FixedOracle::merging();
    let report = run(&coordinator(store.clone(), oracle.clone(), config()), RunMode::Execute).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.total_merged(), 1);
    assert_eq!(report.total_superseded(), 3);
    assert_eq!(oracle.calls(), 1);

    let promoted = active_at(&store, 1).await;
    assert_eq!(promoted.len(), 1);
    let promoted = &promoted[0];
    assert_eq!(promoted.content(), "merged memory");
    assert_eq!(promoted.payload.source_ids, vec!["f1", "f2", "f3"]);

    for id in ["f1", "f2", "f3"] {
        let input = load(&store, id).await;
        assert_eq!(input.payload.superseded_by.as_deref(), Some(promoted.id.as_str()));
        assert_eq!(input.content(), format!("memory {}", id));
        assert_eq!(input.level(), 0);
    }
    for id in ["f4", "f5"] {
        let untouched = load(&store, id).await;
        assert!(!untouched.is_superseded());
        assert!(untouched.payload.last_consolidated_at.is_none());
    }
    assert_eq!(store.len().await, 6);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let store = five_fragments();
    let oracle = FixedOracle::merging();
    let coordinator = coordinator(store.clone(), oracle.clone(), config());

    run(&coordinator, RunMode::Execute).await;
    let writes = store.calls().writes();
    let before = store.records().await;

    let report = run(&coordinator, RunMode::Execute).await;
    assert_eq!(report.total_merged(), 0);
    assert_eq!(report.total_evaluated(), 0);
    assert_eq!(oracle.calls(), 1);
    assert_eq!(store.calls().writes(), writes);
    assert_eq!(store.records().await, before);
}

#[tokio::test]
async fn test_dry_run_plans_without_writing() {
    let store = five_fragments();
    let before = store.records().await;
    let report = run(
        &coordinator(store.clone(), FixedOracle::merging(), config()),
        RunMode::DryRun,
    )
    .await;

    assert!(report.is_dry_run());
    let planned: Vec<_> = report.planned().collect();
    assert_eq!(planned.len(), 1);
    assert_eq!(planned[0].member_ids, vec!["f1", "f2", "f3"]);
    assert_eq!(planned[0].target_level, 1);
    assert_eq!(report.total_merged(), 0);
    assert_eq!(store.calls().writes(), 0);
    assert_eq!(store.records().await, before);
    assert!(report.summary().contains("1 potential merges"));
}

#[tokio::test(start_paused = true)]
async fn test_oracle_timeouts_keep_fragments_separate() {
    let store = five_fragments();
    let oracle = Arc::new(SilentOracle {
        calls: AtomicUsize::new(0),
    });
    let mut config = config();
    config.classifier.timeout_ms = 1_000;
    config.classifier.max_attempts = 3;

    let report = run(&coordinator(store.clone(), oracle.clone(), config), RunMode::Execute).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.total_kept_separate(), 1);
    assert_eq!(report.total_merged(), 0);
    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, RunErrorKind::Classification);
    assert_eq!(errors[0].fragment_ids, vec!["f1", "f2", "f3"]);
    assert_eq!(store.calls().writes(), 0);
}

#[tokio::test]
async fn test_malformed_oracle_output_never_merges() {
    let store = five_fragments();
    let oracle = FixedOracle::answering("Yes, merge f1 and f2.");
    let report = run(&coordinator(store.clone(), oracle.clone(), config()), RunMode::Execute).await;

    assert_eq!(oracle.calls(), 1);
    assert_eq!(report.total_kept_separate(), 1);
    assert_eq!(report.error_count(), 1);
    assert_eq!(store.calls().writes(), 0);
}

async fn paginated(style: CursorStyle) {
    let ids = [
        ("a1", [1.0, 0.0, 0.0, 0.0]),
        ("a2", [1.0, 0.0, 0.0, 0.0]),
        ("b1", [0.0, 1.0, 0.0, 0.0]),
        ("b2", [0.0, 1.0, 0.0, 0.0]),
        ("c1", [0.0, 0.0, 1.0, 0.0]),
        ("c2", [0.0, 0.0, 1.0, 0.0]),
        ("d1", [0.0, 0.0, 0.0, 1.0]),
    ];
    let store = Arc::new(
        InMemoryVectorStore::new("memories", 4)
            .with_cursor_style(style)
            .with_records(
                ids.iter()
                    .map(|(id, v)| fragment(id, 0, v.to_vec()).into_record().unwrap()),
            ),
    );
    let oracle = FixedOracle::merging();
    let mut config = config();
    config.page_size = 2;
    config.max_level = 1;

    let report = run(&coordinator(store.clone(), oracle.clone(), config), RunMode::Execute).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.levels.len(), 1);
    assert_eq!(report.levels[0].pages, 4);
    assert_eq!(report.levels[0].fragments_scanned, 7);
    assert_eq!(report.total_merged(), 3);
    assert_eq!(oracle.calls(), 3);
    assert_eq!(active_at(&store, 0).await.len(), 1);
    assert_eq!(active_at(&store, 1).await.len(), 3);
}

#[tokio::test]
async fn test_pagination_with_null_cursor() {
    paginated(CursorStyle::Null).await;
}

#[tokio::test]
async fn test_pagination_with_empty_string_cursor() {
    paginated(CursorStyle::EmptyString).await;
}

#[tokio::test]
async fn test_empty_store_completes_cleanly() {
    let store = Arc::new(InMemoryVectorStore::new("memories", 3));
    let oracle = FixedOracle::merging();
    let report = run(&coordinator(store.clone(), oracle.clone(), config()), RunMode::Execute).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.levels.len(), 3);
    assert!(report.levels.iter().all(|l| l.pages == 0));
    assert_eq!(oracle.calls(), 0);
    assert_eq!(store.calls().writes(), 0);
}

#[tokio::test]
async fn test_levels_never_mix() {
    let store = store_with(vec![
        fragment("low", 0, vec![1.0, 0.0, 0.0]),
        fragment("high", 1, vec![1.0, 0.0, 0.0]),
        fragment("top", 2, vec![1.0, 0.0, 0.0]),
    ]);
    let oracle = FixedOracle::merging();
    let report = run(&coordinator(store.clone(), oracle.clone(), config()), RunMode::Execute).await;

    assert_eq!(report.total_evaluated(), 0);
    assert_eq!(oracle.calls(), 0);
    assert_eq!(store.calls().writes(), 0);
}

#[tokio::test]
async fn test_promotions_chain_across_levels_with_full_provenance() {
    let store = store_with(vec![
        fragment("a1", 0, vec![1.0, 0.0, 0.0]),
        fragment("a2", 0, vec![1.0, 0.0, 0.0]),
        fragment("b1", 0, vec![0.0, 1.0, 0.0]),
        fragment("b2", 0, vec![0.0, 1.0, 0.0]),
    ]);
    let coordinator = coordinator(store.clone(), FixedOracle::merging(), config())
        .with_embedder(Arc::new(ConstantEmbedder));

    let report = run(&coordinator, RunMode::Execute).await;
    assert_eq!(report.levels[0].merged, 2);
    assert_eq!(report.levels[1].merged, 1);
    assert_eq!(report.levels[2].merged, 0);

    let top = active_at(&store, 2).await;
    assert_eq!(top.len(), 1);
    let top = &top[0];
    let mut lineage = top.payload.source_ids.clone();
    lineage.sort();
    assert_eq!(lineage, vec!["a1", "a2", "b1", "b2"]);

    // Every leaf reaches the top through its superseded_by chain.
    for leaf in ["a1", "a2", "b1", "b2"] {
        let leaf = load(&store, leaf).await;
        let middle = load(&store, leaf.payload.superseded_by.as_deref().unwrap()).await;
        assert_eq!(middle.level(), 1);
        assert_eq!(middle.payload.superseded_by.as_deref(), Some(top.id.as_str()));
    }

    assert!(active_at(&store, 0).await.is_empty());
    assert!(active_at(&store, 1).await.is_empty());
}

#[tokio::test]
async fn test_every_fragment_lands_in_at_most_one_set() {
    let store = store_with(vec![
        fragment("a", 0, vec![1.0, 0.0, 0.0]),
        fragment("b", 0, vec![0.95, 0.31, 0.0]),
        fragment("c", 0, vec![0.81, 0.59, 0.0]),
        fragment("d", 0, vec![0.59, 0.81, 0.0]),
        fragment("e", 0, vec![0.31, 0.95, 0.0]),
    ]);
    let mut config = config();
    config.max_level = 1;
    let report = run(
        &coordinator(store.clone(), FixedOracle::merging(), config),
        RunMode::DryRun,
    )
    .await;

    let mut seen = HashSet::new();
    for plan in report.planned() {
        for id in &plan.member_ids {
            assert!(seen.insert(id.clone()), "{} planned twice", id);
        }
    }
    assert!(!seen.is_empty());
}

#[tokio::test]
async fn test_failed_marking_is_reported_as_partial_promotion() {
    let store = five_fragments();
    store.fail_set_payload_for("f2");
    let mut config = config();
    config.max_level = 1;
    let report = run(
        &coordinator(store.clone(), FixedOracle::merging(), config),
        RunMode::Execute,
    )
    .await;

    let errors: Vec<_> = report.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, RunErrorKind::PartialPromotion);
    assert_eq!(errors[0].fragment_ids, vec!["f2"]);
    assert_eq!(report.total_merged(), 1);
    assert_eq!(report.total_superseded(), 2);

    assert_eq!(active_at(&store, 1).await.len(), 1);
    assert!(load(&store, "f1").await.is_superseded());
    assert!(!load(&store, "f2").await.is_superseded());
    assert!(load(&store, "f3").await.is_superseded());
}

#[tokio::test]
async fn test_non_cosine_collection_is_refused_before_scanning() {
    let records = [
        fragment("f1", 0, vec![1.0, 0.0, 0.0]),
        fragment("f2", 0, vec![0.99, 0.1, 0.0]),
    ]
    .into_iter()
    .map(|f| f.into_record().unwrap());
    let store = Arc::new(
        InMemoryVectorStore::new("memories", 3)
            .with_distance(DistanceMetric::Euclidean)
            .with_records(records),
    );
    let oracle = FixedOracle::merging();

    let err = coordinator(store.clone(), oracle.clone(), config())
        .run(RunMode::Execute, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_precondition());
    assert_eq!(err.code(), ErrorCode::PreUnsupportedDistance);
    assert_eq!(store.calls().scroll.load(Ordering::SeqCst), 0);
    assert_eq!(store.calls().writes(), 0);
    assert_eq!(oracle.calls(), 0);
}

#[tokio::test]
async fn test_concurrent_run_on_same_collection_is_refused() {
    let store = five_fragments();
    let registry = RunRegistry::new();
    let oracle = Arc::new(GatedOracle {
        gate: Semaphore::new(0),
    });

    let first = Arc::new(
        coordinator(store.clone(), oracle.clone(), config()).with_run_registry(registry.clone()),
    );
    let running = {
        let first = first.clone();
        tokio::spawn(async move { first.run(RunMode::Execute, CancellationToken::new()).await })
    };
    while !registry.is_running("memories") {
        tokio::task::yield_now().await;
    }

    let second = coordinator(store.clone(), FixedOracle::merging(), config())
        .with_run_registry(registry.clone());
    let err = second
        .run(RunMode::Execute, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::RunInProgress { .. }));

    oracle.gate.add_permits(16);
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.total_merged(), 1);
    assert!(!registry.is_running("memories"));
}

#[tokio::test]
async fn test_cancellation_leaves_no_partial_writes() {
    let store = store_with(vec![
        fragment("a1", 0, vec![1.0, 0.0, 0.0]),
        fragment("a2", 0, vec![1.0, 0.0, 0.0]),
        fragment("b1", 0, vec![0.0, 1.0, 0.0]),
        fragment("b2", 0, vec![0.0, 1.0, 0.0]),
    ]);
    let cancel = CancellationToken::new();
    let oracle = Arc::new(CancellingOracle {
        cancel: cancel.clone(),
    });
    let mut config = config();
    config.scheduler = SchedulerConfig::fixed(1);

    let report = coordinator(store.clone(), oracle, config)
        .run(RunMode::Execute, cancel)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(store.calls().writes(), 0);
    assert!(report
        .errors()
        .any(|e| e.kind == RunErrorKind::Cancelled));
    assert_eq!(active_at(&store, 0).await.len(), 4);
}
