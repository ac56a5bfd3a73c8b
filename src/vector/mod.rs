//! Vector layer: embeddings, distance metrics and the forest ANN structure.
//!
//! # Architecture
//! Each facet index is a random projection forest built once from a full set
//! of items and never mutated afterwards. Snapshots are persisted in a
//! checksummed binary format and loaded through memory-mapped files.

mod embedding;
mod forest;
mod metric;
mod storage;
mod types;

// Re-export core types for public API
#[cfg(test)]
pub use embedding::MockEmbeddingGenerator;
pub use embedding::{
    EmbeddingGenerator, FastEmbedGenerator, default_model_cache_dir, embed_facet_texts,
    parse_embedding_model,
};
pub use forest::{DEFAULT_LEAF_SIZE, DEFAULT_SEED, Forest, ForestBuilder};
pub use metric::{Metric, cosine_similarity};
pub use storage::{VectorStorageError, decode_forest, encode_forest, load_forest};
pub use types::{VECTOR_DIMENSION_384, VectorDimension, VectorError};
