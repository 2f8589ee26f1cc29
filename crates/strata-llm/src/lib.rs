//! strata-llm - Classification oracle providers for strata.
//!
//! # Supported Providers
//!
//! - **OpenAI** (feature: `openai`) - chat completions with structured output
//! - **Ollama** (feature: `ollama`) - local models via Ollama
//!
//! # Example
//!
//! ```ignore
//! use strata_llm::LlmFactory;
//!
//! let llm = LlmFactory::openai_with_model("gpt-4.1-mini")?;
//! ```

mod factory;
mod ollama;
mod openai;

pub use factory::LlmFactory;
pub use ollama::OllamaLlm;
pub use openai::OpenAIProvider;

// Re-export core types for convenience
pub use strata_core::traits::{
    GenerationOptions, Llm, LlmConfig, LlmProvider, LlmResponse, ResponseFormat,
};
