//! strata-embeddings - Embedding providers for strata.
//!
//! Merged fragments are re-embedded from their merged content when an
//! embedder is configured.
//!
//! # Supported Providers
//!
//! - **OpenAI** (feature: `openai`) - text-embedding-3-small, text-embedding-3-large, etc.
//! - **Ollama** (feature: `ollama`) - Local embedding models via Ollama
//!
//! # Example
//!
//! ```ignore
//! use strata_embeddings::EmbedderFactory;
//!
//! let embedder = EmbedderFactory::openai_with_model("text-embedding-3-large", 3072)?;
//! ```

mod factory;
mod ollama;
mod openai;

pub use factory::EmbedderFactory;
pub use ollama::OllamaEmbedder;
pub use openai::OpenAIEmbedder;

// Re-export core types for convenience
pub use strata_core::traits::{Embedder, EmbedderConfig, EmbedderProvider};

use strata_core::error::{StrataError, StrataResult};

/// Reject vectors whose length differs from the configured dimension.
pub(crate) fn check_dimension(vector: Vec<f32>, expected: usize, model: &str) -> StrataResult<Vec<f32>> {
    if vector.len() != expected {
        return Err(StrataError::Validation {
            message: format!(
                "{} returned a {}-dimensional embedding, expected {}",
                model,
                vector.len(),
                expected
            ),
            code: strata_core::ErrorCode::ValInvalidFormat,
            details: Default::default(),
            suggestion: Some("Set embedder.embedding_dims to the model's output size".to_string()),
        });
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_dimension() {
        assert!(check_dimension(vec![0.0; 3], 3, "m").is_ok());
        let err = check_dimension(vec![0.0; 2], 3, "m").unwrap_err();
        assert!(!err.is_transient());
        assert!(err.suggestion().is_some());
    }
}
