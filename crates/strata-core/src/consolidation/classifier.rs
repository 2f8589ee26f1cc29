//! Gateway to the classification oracle.
//!
//! Each call is bounded by a deadline. Timeouts and transient provider
//! errors are retried with exponential backoff; a response that arrives but
//! cannot be decoded is not. Whatever goes wrong, the gateway answers
//! [`ClassificationDecision::KeepSeparate`] and reports the cause, so a bad
//! oracle can never cause a merge.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::config::ClassifierConfig;
use super::decision::{decision_schema, decode_decision, ClassificationDecision, DECISION_SCHEMA_NAME};
use super::grouper::CandidateSet;
use super::prompts::build_classification_messages;
use crate::error::{ErrorCode, StrataError, StrataResult};
use crate::retry::retry_transient;
use crate::traits::{GenerationOptions, Llm, ResponseFormat};
use crate::types::Message;

/// Decision for one candidate set, with how it was reached.
#[derive(Debug)]
pub struct ClassificationOutcome {
    pub decision: ClassificationDecision,
    /// Oracle calls made, including the first.
    pub attempts: u32,
    /// Why the decision fell back to keep-separate, if it did.
    pub error: Option<StrataError>,
}

impl ClassificationOutcome {
    pub fn is_fallback(&self) -> bool {
        self.error.is_some()
    }
}

/// Asks the oracle whether candidate sets should be merged.
#[derive(Clone)]
pub struct ClassifierGateway {
    llm: Arc<dyn Llm>,
    config: ClassifierConfig,
}

impl ClassifierGateway {
    pub fn new(llm: Arc<dyn Llm>, config: ClassifierConfig) -> Self {
        Self { llm, config }
    }

    /// Classify one set. Never fails; see the module docs.
    pub async fn classify(&self, set: &CandidateSet) -> ClassificationOutcome {
        let messages = build_classification_messages(set);
        let member_ids = set.member_ids();
        let options = GenerationOptions {
            temperature: Some(0.0),
            response_format: Some(ResponseFormat::JsonSchema {
                name: DECISION_SCHEMA_NAME.to_string(),
                schema: decision_schema(),
            }),
            ..Default::default()
        };

        let attempts = AtomicU32::new(0);
        let result = retry_transient(&self.config.retry_policy(), "classify", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            self.call_once(&messages, options.clone())
        })
        .await
        .and_then(|response| decode_decision(&response, &member_ids));
        let attempts = attempts.load(Ordering::SeqCst);

        match result {
            Ok(decision) => {
                tracing::debug!(
                    set_id = %set.id,
                    decision = decision.label(),
                    attempts,
                    "Classified candidate set"
                );
                ClassificationOutcome {
                    decision,
                    attempts,
                    error: None,
                }
            }
            Err(error) => {
                tracing::warn!(
                    set_id = %set.id,
                    attempts,
                    error = %error,
                    "Classification failed, keeping fragments separate"
                );
                ClassificationOutcome {
                    decision: ClassificationDecision::KeepSeparate,
                    attempts,
                    error: Some(error),
                }
            }
        }
    }

    async fn call_once(
        &self,
        messages: &[Message],
        options: GenerationOptions,
    ) -> StrataResult<String> {
        let deadline = self.config.timeout();
        let response = tokio::time::timeout(deadline, self.llm.generate(messages, Some(options)))
            .await
            .map_err(|_| StrataError::timeout("classify", deadline))??;

        match response.content {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(StrataError::Llm {
                message: "Oracle returned an empty response".to_string(),
                code: ErrorCode::LlmInvalidResponse,
                source: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{LlmResponse, MockLlm};
    use crate::types::{Fragment, FragmentPayload};
    use async_trait::async_trait;
    use std::time::Duration;

    fn set() -> CandidateSet {
        CandidateSet::new(
            0,
            vec![
                Fragment::new("a", vec![1.0], FragmentPayload::new("likes pizza", 0)),
                Fragment::new("b", vec![1.0], FragmentPayload::new("enjoys pizza", 0)),
            ],
        )
    }

    fn config() -> ClassifierConfig {
        ClassifierConfig {
            max_attempts: 3,
            timeout_ms: 1_000,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    fn gateway(llm: MockLlm) -> ClassifierGateway {
        ClassifierGateway::new(Arc::new(llm), config())
    }

    #[tokio::test]
    async fn test_merge_decision_is_returned() {
        let mut llm = MockLlm::new();
        llm.expect_generate()
            .withf(|_, options| {
                matches!(
                    options.as_ref().and_then(|o| o.response_format.as_ref()),
                    Some(ResponseFormat::JsonSchema { name, .. }) if name == DECISION_SCHEMA_NAME
                )
            })
            .times(1)
            .returning(|_, _| {
                Ok(LlmResponse::text(
                    r#"{"decision": "merge", "merged_content": "User likes pizza", "subgroups": [], "rationale": "same"}"#,
                ))
            });

        let outcome = gateway(llm).classify(&set()).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.decision,
            ClassificationDecision::Merge {
                merged_content: "User likes pizza".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_output_falls_back_without_retry() {
        let mut llm = MockLlm::new();
        llm.expect_generate()
            .times(1)
            .returning(|_, _| Ok(LlmResponse::text("they are the same, merge them")));

        let outcome = gateway(llm).classify(&set()).await;
        assert_eq!(outcome.decision, ClassificationDecision::KeepSeparate);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.is_fallback());
    }

    #[tokio::test]
    async fn test_foreign_ids_fall_back() {
        let mut llm = MockLlm::new();
        llm.expect_generate().returning(|_, _| {
            Ok(LlmResponse::text(
                r#"{"decision": "partial_merge", "subgroups": [{"member_ids": ["a", "zzz"], "merged_content": "x"}]}"#,
            ))
        });

        let outcome = gateway(llm).classify(&set()).await;
        assert_eq!(outcome.decision, ClassificationDecision::KeepSeparate);
        assert_eq!(
            outcome.error.as_ref().map(StrataError::code),
            Some(ErrorCode::ValInvalidFormat)
        );
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let mut llm = MockLlm::new();
        let mut seq = mockall::Sequence::new();
        llm.expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(StrataError::llm("rate limited")));
        llm.expect_generate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(LlmResponse::text(r#"{"decision": "keep_separate"}"#)));

        let outcome = gateway(llm).classify(&set()).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.decision, ClassificationDecision::KeepSeparate);
    }

    #[tokio::test]
    async fn test_empty_response_is_not_retried() {
        let mut llm = MockLlm::new();
        llm.expect_generate()
            .times(1)
            .returning(|_, _| Ok(LlmResponse::default()));

        let outcome = gateway(llm).classify(&set()).await;
        assert_eq!(
            outcome.error.as_ref().map(StrataError::code),
            Some(ErrorCode::LlmInvalidResponse)
        );
    }

    struct SlowLlm {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Llm for SlowLlm {
        async fn generate(
            &self,
            _messages: &[Message],
            _options: Option<GenerationOptions>,
        ) -> StrataResult<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(LlmResponse::text(r#"{"decision": "merge", "merged_content": "late"}"#))
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_attempts_and_keep_separate() {
        let llm = Arc::new(SlowLlm {
            calls: AtomicU32::new(0),
        });
        let gateway = ClassifierGateway::new(llm.clone(), config());

        let outcome = gateway.classify(&set()).await;
        assert_eq!(outcome.decision, ClassificationDecision::KeepSeparate);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(outcome.error, Some(StrataError::Timeout { .. })));
    }
}
