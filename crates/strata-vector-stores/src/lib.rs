//! strata-vector-stores - Vector store implementations for strata.
//!
//! # Supported Backends
//!
//! - **Qdrant** (feature: `qdrant`) - Qdrant over gRPC
//! - **Memory** (always available) - process-local store for local dry runs,
//!   optionally seeded from a JSON file

mod factory;

#[cfg(feature = "qdrant")]
mod qdrant;

// Public exports
pub use factory::VectorStoreFactory;

#[cfg(feature = "qdrant")]
pub use qdrant::QdrantVectorStore;

pub use strata_core::store::InMemoryVectorStore;

// Re-export core types for convenience
pub use strata_core::traits::{
    CollectionInfo, DistanceMetric, ScrollPage, VectorRecord, VectorStore, VectorStoreConfig,
    VectorStoreProvider,
};
