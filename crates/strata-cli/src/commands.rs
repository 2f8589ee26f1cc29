//! Subcommand implementations.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use strata_core::consolidation::RunMode;
use strata_core::error::StrataResult;
use strata_core::traits::VectorStore;
use strata_core::{ConsolidationCoordinator, StrataConfig};
use strata_embeddings::EmbedderFactory;
use strata_llm::LlmFactory;
use strata_vector_stores::VectorStoreFactory;

use crate::exit::CliExitCode;
use crate::output::{render_check, render_report, OutputFormat, StoreSize};
use crate::{ConsolidateArgs, TargetArgs};

/// Resolve configuration: file (explicit or `~/.strata/config.*`), then
/// `STRATA_*` environment, then command-line overrides.
pub fn load_config(target: &TargetArgs, max_level: Option<u32>) -> StrataResult<StrataConfig> {
    let mut config = match target.config.clone().or_else(StrataConfig::default_file) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading configuration");
            StrataConfig::from_file(path)?
        }
        None => StrataConfig::default(),
    };
    config.apply_env()?;

    if let Some(collection) = &target.collection {
        config.vector_store.collection_name = collection.clone();
    }
    if let Some(max_level) = max_level {
        config.consolidation.max_level = max_level;
    }

    config.validate()?;
    Ok(config)
}

async fn build(
    config: &StrataConfig,
) -> StrataResult<(Arc<dyn VectorStore>, ConsolidationCoordinator)> {
    let store = VectorStoreFactory::create(config.vector_store.clone()).await?;
    let llm = LlmFactory::create(config.llm.provider, config.llm.config.clone())?;

    let mut coordinator =
        ConsolidationCoordinator::new(store.clone(), llm, config.consolidation.clone());
    if let Some(embedder) = &config.embedder {
        coordinator = coordinator
            .with_embedder(EmbedderFactory::create(embedder.provider, embedder.config.clone())?);
    }
    Ok((store, coordinator))
}

async fn count_points(store: &dyn VectorStore) -> Option<u64> {
    match store.count(None).await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "Could not count store points");
            None
        }
    }
}

pub async fn consolidate(
    args: &ConsolidateArgs,
    format: OutputFormat,
    verbose: bool,
    cancel: CancellationToken,
) -> StrataResult<CliExitCode> {
    let config = load_config(&args.target, args.max_level)?;
    let (store, coordinator) = build(&config).await?;
    let mode = if args.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Execute
    };

    let points_before = count_points(store.as_ref()).await;

    let report = coordinator.run(mode, cancel).await?;

    let store_size = StoreSize {
        points_before,
        points_after: count_points(store.as_ref()).await,
    };
    println!("{}", render_report(&report, store_size, format, verbose)?);

    Ok(CliExitCode::from(&report))
}

pub async fn check(args: &TargetArgs, format: OutputFormat) -> StrataResult<CliExitCode> {
    let config = load_config(args, None)?;
    let (_, coordinator) = build(&config).await?;

    let info = coordinator.check().await?;
    println!("{}", render_check(&info, format)?);
    Ok(CliExitCode::Success)
}
