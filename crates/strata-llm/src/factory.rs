//! Factory for creating LLM providers.

use std::sync::Arc;

use strata_core::error::StrataResult;
use strata_core::traits::{Llm, LlmConfig, LlmProvider};

use crate::ollama::OllamaLlm;
use crate::openai::OpenAIProvider;

/// Factory for creating LLM providers.
pub struct LlmFactory;

impl LlmFactory {
    /// Create an LLM provider from the given configuration.
    pub fn create(provider: LlmProvider, config: LlmConfig) -> StrataResult<Arc<dyn Llm>> {
        match provider {
            LlmProvider::OpenAI => Ok(Arc::new(OpenAIProvider::new(config)?)),
            LlmProvider::Ollama => Ok(Arc::new(OllamaLlm::new(config)?)),
        }
    }

    /// Create an OpenAI LLM provider with default configuration.
    pub fn openai() -> StrataResult<Arc<dyn Llm>> {
        Self::create(LlmProvider::OpenAI, LlmConfig::default())
    }

    /// Create an OpenAI LLM provider with a specific model.
    pub fn openai_with_model(model: impl Into<String>) -> StrataResult<Arc<dyn Llm>> {
        let config = LlmConfig {
            model: model.into(),
            ..Default::default()
        };
        Self::create(LlmProvider::OpenAI, config)
    }

    /// Create an Ollama LLM provider with a specific model.
    pub fn ollama_with_model(model: impl Into<String>) -> StrataResult<Arc<dyn Llm>> {
        let config = LlmConfig {
            model: model.into(),
            ..Default::default()
        };
        Self::create(LlmProvider::Ollama, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_gets_default_model() {
        let llm = LlmFactory::create(LlmProvider::Ollama, LlmConfig::default()).unwrap();
        assert_eq!(llm.model_name(), "llama3.1:8b");
    }

    #[test]
    fn test_openai_with_explicit_key() {
        let config = LlmConfig {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let llm = LlmFactory::create(LlmProvider::OpenAI, config).unwrap();
        assert_eq!(llm.model_name(), "gpt-4.1-nano-2025-04-14");
        assert!(llm.supports_json_mode());
    }
}
