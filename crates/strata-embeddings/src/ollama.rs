//! Ollama embedding provider implementation.

use async_trait::async_trait;

use strata_core::error::{StrataError, StrataResult};
use strata_core::traits::{Embedder, EmbedderConfig};

#[cfg(feature = "ollama")]
use ollama_rs::{generation::embeddings::request::GenerateEmbeddingsRequest, Ollama};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama embedding provider.
pub struct OllamaEmbedder {
    #[cfg(feature = "ollama")]
    client: Ollama,
    config: EmbedderConfig,
}

impl OllamaEmbedder {
    /// Create a new Ollama embedder.
    pub fn new(config: EmbedderConfig) -> StrataResult<Self> {
        #[cfg(feature = "ollama")]
        let client = {
            let (host, port) = ollama_endpoint(config.base_url.as_deref())?;
            Ollama::new(host, port)
        };
        #[cfg(not(feature = "ollama"))]
        ollama_endpoint(config.base_url.as_deref())?;

        Ok(Self {
            #[cfg(feature = "ollama")]
            client,
            config,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    #[cfg(feature = "ollama")]
    async fn embed(&self, text: &str) -> StrataResult<Vec<f32>> {
        tracing::debug!(model = %self.config.model, "Requesting embedding");
        let request = GenerateEmbeddingsRequest::new(self.config.model.clone(), text.into());

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(|e| StrataError::embedding(format!("Ollama embedding error: {}", e)))?;

        let embedding = response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| StrataError::embedding("No embedding returned"))?;

        crate::check_dimension(embedding, self.config.embedding_dims, &self.config.model)
    }

    #[cfg(not(feature = "ollama"))]
    async fn embed(&self, _text: &str) -> StrataResult<Vec<f32>> {
        Err(StrataError::Configuration(
            "Ollama feature not enabled. Enable the 'ollama' feature.".to_string(),
        ))
    }

    fn dimension(&self) -> usize {
        self.config.embedding_dims
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Split an Ollama base URL into the scheme-qualified host and port the
/// client expects.
fn ollama_endpoint(base_url: Option<&str>) -> StrataResult<(String, u16)> {
    let url = url::Url::parse(base_url.unwrap_or(DEFAULT_BASE_URL))
        .map_err(|e| StrataError::Configuration(format!("Invalid Ollama URL: {}", e)))?;
    let host = url.host_str().unwrap_or("localhost");
    Ok((format!("{}://{}", url.scheme(), host), url.port().unwrap_or(11434)))
}
