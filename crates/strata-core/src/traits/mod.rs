//! Core traits for strata providers.

mod embedder;
mod llm;
mod vector_store;

pub use embedder::*;
pub use llm::*;
pub use vector_store::*;
