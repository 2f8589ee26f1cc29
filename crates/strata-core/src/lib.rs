//! strata-core - Core library for strata.
//!
//! This crate provides the traits, types, and consolidation engine for the
//! strata semantic memory store.
//!
//! # Example
//!
//! ```ignore
//! use strata_core::{ConsolidationConfig, ConsolidationCoordinator, RunMode};
//! use tokio_util::sync::CancellationToken;
//!
//! let coordinator = ConsolidationCoordinator::new(store, llm, ConsolidationConfig::default());
//! let report = coordinator.run(RunMode::DryRun, CancellationToken::new()).await?;
//! println!("{}", report.summary());
//! ```

pub mod config;
pub mod consolidation;
pub mod error;
pub mod pressure;
pub mod retry;
pub mod scheduler;
pub mod similarity;
pub mod store;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::StrataConfig;
pub use consolidation::{
    ClassificationDecision, ConsolidationConfig, ConsolidationCoordinator, RunMode, RunRegistry,
    RunReport, RunStatus,
};
pub use error::{ErrorCode, StrataError, StrataResult};
pub use pressure::{PressureSample, PressureSampler};
pub use retry::RetryPolicy;
pub use scheduler::{AdaptiveScheduler, SchedulerConfig};
pub use store::InMemoryVectorStore;
pub use traits::{
    Embedder, EmbedderConfig, Llm, LlmConfig, VectorStore, VectorStoreConfig,
};
pub use types::{Filter, Fragment, FragmentPayload, Message, MessageRole};
