//! Factory for creating vector store providers.

use std::sync::Arc;

use strata_core::error::{StrataError, StrataResult};
use strata_core::store::InMemoryVectorStore;
use strata_core::traits::{VectorRecord, VectorStore, VectorStoreConfig, VectorStoreProvider};

/// Factory for creating vector store providers.
pub struct VectorStoreFactory;

impl VectorStoreFactory {
    /// Create a vector store from the given configuration.
    pub async fn create(config: VectorStoreConfig) -> StrataResult<Arc<dyn VectorStore>> {
        match config.provider {
            #[cfg(feature = "qdrant")]
            VectorStoreProvider::Qdrant => {
                let store = crate::qdrant::QdrantVectorStore::new(config).await?;
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "qdrant"))]
            VectorStoreProvider::Qdrant => Err(StrataError::Configuration(
                "Qdrant feature not enabled. Enable the 'qdrant' feature.".to_string(),
            )),

            VectorStoreProvider::Memory => Ok(Arc::new(Self::memory(&config).await?)),
        }
    }

    /// Build an in-memory store, seeded from `seed_file` when one is configured.
    ///
    /// The seed file is a JSON array of records:
    ///
    /// ```json
    /// [{"id": "a", "vector": [0.1, 0.9], "payload": {"content": "...", "consolidation_level": 0}}]
    /// ```
    async fn memory(config: &VectorStoreConfig) -> StrataResult<InMemoryVectorStore> {
        let store =
            InMemoryVectorStore::new(config.collection_name.clone(), config.embedding_model_dims);

        let Some(path) = config.config.get("seed_file").and_then(|v| v.as_str()) else {
            return Ok(store);
        };

        let raw = tokio::fs::read_to_string(path).await?;
        let records: Vec<VectorRecord> = serde_json::from_str(&raw).map_err(|e| {
            StrataError::Configuration(format!("Invalid seed file '{}': {}", path, e))
        })?;

        if let Some(bad) = records
            .iter()
            .find(|r| r.vector.len() != config.embedding_model_dims)
        {
            return Err(StrataError::Configuration(format!(
                "Seed record '{}' has {} dimensions, collection expects {}",
                bad.id,
                bad.vector.len(),
                config.embedding_model_dims
            )));
        }

        tracing::info!(
            path,
            records = records.len(),
            collection = %config.collection_name,
            "Seeded in-memory store"
        );
        Ok(store.with_records(records))
    }
}
