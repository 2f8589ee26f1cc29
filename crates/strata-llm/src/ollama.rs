//! Ollama LLM provider implementation.

use async_trait::async_trait;

use strata_core::error::{StrataError, StrataResult};
use strata_core::traits::{GenerationOptions, Llm, LlmConfig, LlmResponse, ResponseFormat};
use strata_core::types::Message;

#[cfg(feature = "ollama")]
use strata_core::types::MessageRole;

#[cfg(feature = "ollama")]
use ollama_rs::{
    generation::chat::{ChatMessage, ChatMessageRequest, MessageRole as OllamaRole},
    Ollama,
};

const DEFAULT_MODEL: &str = "llama3.1:8b";
const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama LLM provider.
pub struct OllamaLlm {
    #[cfg(feature = "ollama")]
    client: Ollama,
    config: LlmConfig,
}

impl OllamaLlm {
    /// Create a new Ollama LLM provider.
    pub fn new(config: LlmConfig) -> StrataResult<Self> {
        #[cfg(feature = "ollama")]
        let client = {
            let (host, port) = ollama_endpoint(config.base_url.as_deref())?;
            Ollama::new(host, port)
        };
        #[cfg(not(feature = "ollama"))]
        ollama_endpoint(config.base_url.as_deref())?;

        let mut config = config;
        if config.model.is_empty() {
            config.model = DEFAULT_MODEL.to_string();
        }

        Ok(Self {
            #[cfg(feature = "ollama")]
            client,
            config,
        })
    }

    #[cfg(feature = "ollama")]
    fn message_to_ollama(msg: &Message) -> ChatMessage {
        ChatMessage {
            role: match msg.role {
                MessageRole::System => OllamaRole::System,
                MessageRole::User => OllamaRole::User,
                MessageRole::Assistant => OllamaRole::Assistant,
            },
            content: msg.content.clone(),
            images: None,
        }
    }
}

/// Instruction appended to the last message when structured output is
/// requested, since Ollama models are only prompted into JSON.
pub(crate) fn json_instruction(format: &ResponseFormat) -> Option<String> {
    match format {
        ResponseFormat::Text => None,
        ResponseFormat::Json => Some("\n\nPlease respond with valid JSON only.".to_string()),
        ResponseFormat::JsonSchema { schema, .. } => Some(format!(
            "\n\nPlease respond with valid JSON only, matching this JSON schema:\n{}",
            schema
        )),
    }
}

#[async_trait]
impl Llm for OllamaLlm {
    #[cfg(feature = "ollama")]
    async fn generate(
        &self,
        messages: &[Message],
        options: Option<GenerationOptions>,
    ) -> StrataResult<LlmResponse> {
        let options = options.unwrap_or_default();

        let mut ollama_messages: Vec<ChatMessage> =
            messages.iter().map(Self::message_to_ollama).collect();

        if let Some(instruction) = options.response_format.as_ref().and_then(json_instruction) {
            if let Some(last) = ollama_messages.last_mut() {
                last.content.push_str(&instruction);
            }
        }

        let request = ChatMessageRequest::new(self.config.model.clone(), ollama_messages);

        tracing::debug!(model = %self.config.model, "Ollama chat request");
        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| StrataError::llm(format!("Ollama API error: {}", e)))?;

        Ok(LlmResponse {
            content: response.message.map(|m| m.content),
            usage: None,
        })
    }

    #[cfg(not(feature = "ollama"))]
    async fn generate(
        &self,
        _messages: &[Message],
        _options: Option<GenerationOptions>,
    ) -> StrataResult<LlmResponse> {
        Err(StrataError::Configuration(
            "Ollama feature not enabled. Enable the 'ollama' feature.".to_string(),
        ))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn supports_json_mode(&self) -> bool {
        true // Ollama can be prompted to output JSON
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
