//! strata - run and inspect memory consolidation.
//!
//! ```text
//! strata consolidate [--dry-run] [--verbose] [--config PATH] [--collection NAME] [--max-level N]
//! strata check [--config PATH] [--collection NAME]
//! ```
//!
//! Exit status is 0 when a run finishes, even one that merged nothing. It is
//! 1 when a precondition fails, another run holds the collection, or the store
//! fails mid-run, and 2 when the configuration is unusable.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod exit;
mod output;

use exit::CliExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Level-based consolidation for semantic memory stores")]
#[command(version)]
struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    json: bool,

    #[clap(long, global = true, help = "Emit logs as JSON lines on stderr")]
    log_json: bool,

    #[clap(long, short, global = true, help = "Show per-level detail and debug logs")]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[clap(about = "Run one consolidation pass over every level")]
    Consolidate(ConsolidateArgs),

    #[clap(about = "Verify the store is reachable and the collection exists")]
    Check(TargetArgs),
}

/// Which collection to work on, and how to find the configuration.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    #[clap(long, short = 'c', help = "Path to config file (.toml, .json, .yaml)")]
    pub config: Option<PathBuf>,

    #[clap(long, help = "Collection to consolidate, overriding the config")]
    pub collection: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConsolidateArgs {
    #[clap(flatten)]
    pub target: TargetArgs,

    #[clap(long, help = "Classify and plan merges without writing anything")]
    pub dry_run: bool,

    #[clap(long, help = "Highest consolidation level, overriding the config")]
    pub max_level: Option<u32>,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_directive = if verbose {
        "info,strata_core=debug,strata_llm=debug,strata_embeddings=debug,strata_vector_stores=debug,strata=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // Logs go to stderr so stdout carries only the report.
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

/// Cancel the run on Ctrl+C. Finished units are kept.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling after in-flight work");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let code = match &cli.command {
        Command::Consolidate(args) => {
            commands::consolidate(args, format, cli.verbose, cancel_on_ctrl_c()).await
        }
        Command::Check(args) => commands::check(args, format).await,
    };

    match code {
        Ok(code) => code.into(),
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(hint) = e.suggestion() {
                eprintln!("Hint: {hint}");
            }
            CliExitCode::from(&e).into()
        }
    }
}
