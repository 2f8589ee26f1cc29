//! Error types for strata operations.
//!
//! This module provides the error hierarchy shared by every strata crate, with
//! structured error codes, resolution suggestions, and a transient/permanent
//! split that the retry layer relies on.

use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

/// Main error type for all strata operations.
#[derive(Error, Debug)]
pub enum StrataError {
    /// A run precondition failed (missing collection, unreachable store).
    #[error("Precondition failed: {message}")]
    Precondition {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Another consolidation run holds the lease for this collection.
    #[error("Consolidation already running for collection '{collection}'")]
    RunInProgress { collection: String },

    /// Input validation failed.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        code: ErrorCode,
        details: HashMap<String, String>,
        suggestion: Option<String>,
    },

    /// Fragment not found.
    #[error("Fragment not found: {message}")]
    NotFound {
        message: String,
        code: ErrorCode,
        fragment_id: Option<String>,
    },

    /// Vector store operation failed.
    #[error("Vector store error: {message}")]
    VectorStore {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// LLM operation failed.
    #[error("LLM error: {message}")]
    Llm {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Embedding generation failed.
    #[error("Embedding error: {message}")]
    Embedding {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An operation exceeded its deadline.
    #[error("Timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// The run was cancelled before the operation started.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Provider not supported.
    #[error("Provider not supported: {provider}")]
    UnsupportedProvider { provider: String },

    /// Parse error.
    #[error("Parse error: {message}")]
    Parse { message: String, code: ErrorCode },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Precondition (PRE_xxx)
    PreCollectionMissing,
    PreStoreUnreachable,
    PreUnsupportedDistance,

    // Validation (VAL_xxx)
    ValInvalidInput,
    ValMissingField,
    ValInvalidFormat,

    // Fragment (FRG_xxx)
    FrgNotFound,
    FrgCorrupted,

    // Vector Store (VEC_xxx)
    VecConnectionFailed,
    VecOperationFailed,
    VecCollectionNotFound,
    VecCursorStalled,

    // LLM (LLM_xxx)
    LlmConnectionFailed,
    LlmGenerationFailed,
    LlmInvalidResponse,

    // Embedding (EMB_xxx)
    EmbConnectionFailed,
    EmbGenerationFailed,

    // Parse (PARSE_xxx)
    ParseInvalidJson,
    ParseMissingField,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PreCollectionMissing => "PRE_001",
            ErrorCode::PreStoreUnreachable => "PRE_002",
            ErrorCode::PreUnsupportedDistance => "PRE_003",
            ErrorCode::ValInvalidInput => "VAL_001",
            ErrorCode::ValMissingField => "VAL_002",
            ErrorCode::ValInvalidFormat => "VAL_003",
            ErrorCode::FrgNotFound => "FRG_001",
            ErrorCode::FrgCorrupted => "FRG_002",
            ErrorCode::VecConnectionFailed => "VEC_001",
            ErrorCode::VecOperationFailed => "VEC_002",
            ErrorCode::VecCollectionNotFound => "VEC_003",
            ErrorCode::VecCursorStalled => "VEC_004",
            ErrorCode::LlmConnectionFailed => "LLM_001",
            ErrorCode::LlmGenerationFailed => "LLM_002",
            ErrorCode::LlmInvalidResponse => "LLM_003",
            ErrorCode::EmbConnectionFailed => "EMB_001",
            ErrorCode::EmbGenerationFailed => "EMB_002",
            ErrorCode::ParseInvalidJson => "PARSE_001",
            ErrorCode::ParseMissingField => "PARSE_002",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl StrataError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code: ErrorCode::ValInvalidInput,
            details: HashMap::new(),
            suggestion: None,
        }
    }

    /// Create a validation error with suggestion.
    pub fn validation_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            code: ErrorCode::ValInvalidInput,
            details: HashMap::new(),
            suggestion: Some(suggestion.into()),
        }
    }

    /// Create a not found error.
    pub fn not_found(fragment_id: impl Into<String>) -> Self {
        let id = fragment_id.into();
        Self::NotFound {
            message: format!("Fragment with id '{}' not found", id),
            code: ErrorCode::FrgNotFound,
            fragment_id: Some(id),
        }
    }

    /// Create a precondition error.
    pub fn precondition(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::Precondition {
            message: message.into(),
            code,
            source: None,
        }
    }

    /// Create an LLM error.
    pub fn llm(message: impl Into<String>) -> Self {
        Self::Llm {
            message: message.into(),
            code: ErrorCode::LlmGenerationFailed,
            source: None,
        }
    }

    /// Create a vector store error.
    pub fn vector_store(message: impl Into<String>) -> Self {
        Self::VectorStore {
            message: message.into(),
            code: ErrorCode::VecOperationFailed,
            source: None,
        }
    }

    /// Create a vector store error for a store that cannot be reached at all.
    pub fn store_unreachable(message: impl Into<String>) -> Self {
        Self::VectorStore {
            message: message.into(),
            code: ErrorCode::VecConnectionFailed,
            source: None,
        }
    }

    /// Create an embedding error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
            code: ErrorCode::EmbGenerationFailed,
            source: None,
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            code: ErrorCode::ParseInvalidJson,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Precondition { code, .. } => *code,
            Self::Validation { code, .. } => *code,
            Self::NotFound { code, .. } => *code,
            Self::VectorStore { code, .. } => *code,
            Self::Llm { code, .. } => *code,
            Self::Embedding { code, .. } => *code,
            Self::Parse { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Transport-level failures and timeouts are transient. Validation, parse,
    /// precondition, and configuration errors never are, and neither is a
    /// stalled scan cursor.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::VectorStore { code, .. } => *code != ErrorCode::VecCursorStalled
                && *code != ErrorCode::VecCollectionNotFound,
            Self::Llm { code, .. } => *code != ErrorCode::LlmInvalidResponse,
            Self::Embedding { .. } | Self::Timeout { .. } | Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this error must abort a run before any work starts.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. } | Self::RunInProgress { .. })
    }

    /// Get a user-friendly suggestion for resolving this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Precondition { code, .. } if *code == ErrorCode::PreCollectionMissing => {
                Some("Create the collection or point --collection at an existing one")
            }
            Self::Precondition { code, .. } if *code == ErrorCode::PreUnsupportedDistance => {
                Some("Consolidate a collection that uses cosine distance")
            }
            Self::Precondition { .. } => Some("Please check that the vector store is reachable"),
            Self::RunInProgress { .. } => Some("Wait for the running consolidation to finish"),
            Self::NotFound { .. } => Some("Please check the fragment ID and ensure it exists"),
            Self::Validation { suggestion, .. } => suggestion.as_deref(),
            Self::VectorStore { .. } => Some("Please check your vector store connection settings"),
            Self::Llm { .. } => Some("Please check your LLM provider configuration"),
            Self::Embedding { .. } => Some("Please check your embedding provider configuration"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = StrataError::validation("Invalid input");
        assert_eq!(err.code(), ErrorCode::ValInvalidInput);
        assert!(err.to_string().contains("Invalid input"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_found_error() {
        let err = StrataError::not_found("test-id");
        assert_eq!(err.code(), ErrorCode::FrgNotFound);
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_error_code_as_str() {
        assert_eq!(ErrorCode::PreCollectionMissing.as_str(), "PRE_001");
        assert_eq!(ErrorCode::PreUnsupportedDistance.as_str(), "PRE_003");
        assert_eq!(ErrorCode::VecCursorStalled.as_str(), "VEC_004");
    }

    #[test]
    fn test_transient_classification() {
        assert!(StrataError::vector_store("connection reset").is_transient());
        assert!(StrataError::llm("503").is_transient());
        assert!(StrataError::timeout("classify", std::time::Duration::from_secs(1)).is_transient());

        let stalled = StrataError::VectorStore {
            message: "cursor repeated".to_string(),
            code: ErrorCode::VecCursorStalled,
            source: None,
        };
        assert!(!stalled.is_transient());
        assert!(!StrataError::parse("bad json").is_transient());
        assert!(!StrataError::Configuration("x".to_string()).is_transient());
    }

    #[test]
    fn test_precondition_errors() {
        let err = StrataError::precondition("missing", ErrorCode::PreCollectionMissing);
        assert!(err.is_precondition());
        assert!(!err.is_transient());

        let busy = StrataError::RunInProgress {
            collection: "memories".to_string(),
        };
        assert!(busy.is_precondition());
        assert!(busy.to_string().contains("memories"));
    }
}
