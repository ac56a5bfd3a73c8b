/// Multi-facet similarity search over historical defect reports
pub mod config;
pub mod defect;
pub mod display;
pub mod error;
pub mod index;
pub mod knowledge;
pub mod search;
pub mod storage;
pub mod types;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use defect::{DefectRecord, DiffSummary, preprocess_diffs};
pub use error::{KbError, KbResult};
pub use index::{FacetHealth, FacetOutcome, StagingWriter, WriteReport};
pub use knowledge::{ConsistencyReport, FacetStats, KbStats, KnowledgeBase};
pub use search::{
    GroupWeights, ProfileName, SearchHit, SearchResponse, TextQuery, WeightOverride,
};
pub use types::{Facet, FacetGroup, FacetMap, FacetVectors, FacetWeights, RowId};
pub use vector::{EmbeddingGenerator, FastEmbedGenerator, Metric, VectorDimension};
