//! Vector store trait and related types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::StrataResult;
use crate::types::Filter;

/// Distance metric for vector similarity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
}

/// A vector record with payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Unique identifier.
    pub id: String,
    /// Vector embedding.
    pub vector: Vec<f32>,
    /// Metadata payload.
    pub payload: HashMap<String, serde_json::Value>,
    /// Similarity score (from search).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl VectorRecord {
    /// Create a new vector record.
    pub fn new(
        id: impl Into<String>,
        vector: Vec<f32>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            vector,
            payload,
            score: None,
        }
    }

    /// Get a payload value as a string.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// One page of a scroll.
#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    /// Points on this page.
    pub points: Vec<VectorRecord>,
    /// Cursor for the next page. `None` means the scroll is exhausted.
    pub next_offset: Option<String>,
}

/// Collection information.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    /// Collection name.
    pub name: String,
    /// Number of vectors.
    pub vector_count: u64,
    /// Vector dimension.
    pub dimension: usize,
    /// Distance metric.
    pub distance: DistanceMetric,
}

/// Core VectorStore trait - all storage backends implement this.
///
/// Every method operates on the collection the store was built for.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Fail unless the collection exists and the store is reachable.
    async fn require_collection(&self) -> StrataResult<CollectionInfo>;

    /// Fetch one page of points matching `filter`, starting at `offset`.
    async fn scroll(
        &self,
        filter: Option<Filter>,
        offset: Option<String>,
        limit: usize,
    ) -> StrataResult<ScrollPage>;

    /// Search for similar vectors. Results carry their score and vector.
    async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        filter: Option<Filter>,
    ) -> StrataResult<Vec<VectorRecord>>;

    /// Fetch points by id. Missing ids are absent from the result.
    async fn retrieve(&self, ids: &[String]) -> StrataResult<Vec<VectorRecord>>;

    /// Insert or overwrite points.
    async fn upsert(&self, records: Vec<VectorRecord>) -> StrataResult<()>;

    /// Patch payload keys of one point, leaving other keys untouched.
    async fn set_payload(
        &self,
        id: &str,
        payload: HashMap<String, serde_json::Value>,
    ) -> StrataResult<()>;

    /// Count points matching `filter`.
    async fn count(&self, filter: Option<Filter>) -> StrataResult<u64>;

    /// Get the collection name.
    fn collection_name(&self) -> &str;
}

/// Vector store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// Provider type.
    pub provider: VectorStoreProvider,
    /// Collection name.
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    /// Embedding dimensions.
    #[serde(default = "default_embedding_dims")]
    pub embedding_model_dims: usize,
    /// Provider-specific configuration.
    #[serde(flatten)]
    pub config: serde_json::Value,
}

fn default_collection_name() -> String {
    "strata".to_string()
}

fn default_embedding_dims() -> usize {
    1536
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: VectorStoreProvider::Qdrant,
            collection_name: default_collection_name(),
            embedding_model_dims: default_embedding_dims(),
            config: serde_json::json!({}),
        }
    }
}

/// Vector store provider type.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Default,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum VectorStoreProvider {
    #[default]
    Qdrant,
    /// Process-local store, for dry runs and tests.
    Memory,
}
