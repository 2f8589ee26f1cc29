//! Configuration system for strata.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::consolidation::ConsolidationConfig;
use crate::error::{StrataError, StrataResult};
use crate::traits::{
    EmbedderConfig, EmbedderProvider, LlmConfig, LlmProvider, VectorStoreConfig,
    VectorStoreProvider,
};

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    /// Provider type.
    pub provider: LlmProvider,
    /// Provider-specific configuration.
    #[serde(flatten)]
    pub config: LlmConfig,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            config: LlmConfig {
                model: "gpt-4.1-nano-2025-04-14".to_string(),
                ..Default::default()
            },
        }
    }
}

/// Embedder provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderProviderConfig {
    /// Provider type.
    pub provider: EmbedderProvider,
    /// Provider-specific configuration.
    #[serde(flatten)]
    pub config: EmbedderConfig,
}

impl Default for EmbedderProviderConfig {
    fn default() -> Self {
        Self {
            provider: EmbedderProvider::OpenAI,
            config: EmbedderConfig::default(),
        }
    }
}

/// Main strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Vector store configuration.
    pub vector_store: VectorStoreConfig,
    /// Classification oracle configuration.
    pub llm: LlmProviderConfig,
    /// Embedder used to re-embed merged content. Without one, merged
    /// fragments get the normalized centroid of their inputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedder: Option<EmbedderProviderConfig>,
    /// Consolidation engine settings.
    pub consolidation: ConsolidationConfig,
}

impl StrataConfig {
    /// Default directory for strata configuration: `~/.strata`.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".strata"))
            .unwrap_or_else(|| PathBuf::from(".strata"))
    }

    /// Default configuration file, if one exists.
    pub fn default_file() -> Option<PathBuf> {
        let dir = Self::default_dir();
        ["config.toml", "config.yaml", "config.yml", "config.json"]
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Load configuration from a file (TOML, JSON, or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let ext = path.as_ref().extension().and_then(|e| e.to_str());

        match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| StrataError::Configuration(e.to_string()))
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| StrataError::Configuration(e.to_string())),
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| StrataError::Configuration(e.to_string())),
            _ => Err(StrataError::Configuration(
                "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
            )),
        }
    }

    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> StrataResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `STRATA_*` environment variables onto this configuration.
    pub fn apply_env(&mut self) -> StrataResult<()> {
        // Vector store
        if let Some(provider) = env_var("STRATA_VECTOR_STORE_PROVIDER") {
            self.vector_store.provider = VectorStoreProvider::from_str(&provider).map_err(|_| {
                StrataError::Configuration(format!("Unknown vector store provider: {}", provider))
            })?;
        }
        if let Some(collection) = env_var("STRATA_COLLECTION") {
            self.vector_store.collection_name = collection;
        }
        if let Some(url) = env_var("STRATA_QDRANT_URL") {
            set_provider_option(&mut self.vector_store.config, "url", url);
        }
        if let Some(api_key) = env_var("STRATA_QDRANT_API_KEY") {
            set_provider_option(&mut self.vector_store.config, "api_key", api_key);
        }

        // LLM
        if let Some(provider) = env_var("STRATA_LLM_PROVIDER") {
            self.llm.provider = LlmProvider::from_str(&provider).map_err(|_| {
                StrataError::Configuration(format!("Unknown LLM provider: {}", provider))
            })?;
        }
        if let Some(model) = env_var("STRATA_LLM_MODEL") {
            self.llm.config.model = model;
        }
        if let Some(base_url) = env_var("STRATA_LLM_BASE_URL") {
            self.llm.config.base_url = Some(base_url);
        }
        if let Some(api_key) = env_var("OPENAI_API_KEY") {
            if self.llm.config.api_key.is_none() {
                self.llm.config.api_key = Some(api_key.clone());
            }
            if let Some(embedder) = self.embedder.as_mut() {
                if embedder.config.api_key.is_none() {
                    embedder.config.api_key = Some(api_key);
                }
            }
        }

        // Embedder
        if let Some(provider) = env_var("STRATA_EMBEDDER_PROVIDER") {
            let provider = EmbedderProvider::from_str(&provider).map_err(|_| {
                StrataError::Configuration(format!("Unknown embedder provider: {}", provider))
            })?;
            self.embedder.get_or_insert_with(Default::default).provider = provider;
        }
        if let Some(model) = env_var("STRATA_EMBEDDER_MODEL") {
            self.embedder.get_or_insert_with(Default::default).config.model = model;
        }

        // Consolidation
        if let Some(max_level) = env_var("STRATA_MAX_LEVEL") {
            self.consolidation.max_level = parse_env("STRATA_MAX_LEVEL", &max_level)?;
        }
        if let Some(page_size) = env_var("STRATA_PAGE_SIZE") {
            self.consolidation.page_size = parse_env("STRATA_PAGE_SIZE", &page_size)?;
        }

        Ok(())
    }

    /// Check the configuration for values no run can work with.
    pub fn validate(&self) -> StrataResult<()> {
        if self.vector_store.collection_name.trim().is_empty() {
            return Err(StrataError::Configuration(
                "vector_store.collection_name must not be empty".to_string(),
            ));
        }
        self.consolidation.validate()
    }

    /// Build configuration using builder pattern.
    pub fn builder() -> StrataConfigBuilder {
        StrataConfigBuilder::default()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> StrataResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| StrataError::Configuration(format!("Invalid {}: {}", name, e)))
}

fn set_provider_option(config: &mut serde_json::Value, key: &str, value: String) {
    if !config.is_object() {
        *config = serde_json::json!({});
    }
    if let Some(object) = config.as_object_mut() {
        object.insert(key.to_string(), serde_json::Value::String(value));
    }
}

/// Builder for StrataConfig.
#[derive(Default)]
pub struct StrataConfigBuilder {
    config: StrataConfig,
}

impl StrataConfigBuilder {
    /// Set vector store configuration.
    pub fn vector_store(mut self, config: VectorStoreConfig) -> Self {
        self.config.vector_store = config;
        self
    }

    /// Set the collection to consolidate.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.config.vector_store.collection_name = name.into();
        self
    }

    /// Set LLM configuration.
    pub fn llm(mut self, config: LlmProviderConfig) -> Self {
        self.config.llm = config;
        self
    }

    /// Set embedder configuration.
    pub fn embedder(mut self, config: EmbedderProviderConfig) -> Self {
        self.config.embedder = Some(config);
        self
    }

    /// Set consolidation configuration.
    pub fn consolidation(mut self, config: ConsolidationConfig) -> Self {
        self.config.consolidation = config;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> StrataResult<StrataConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
