//! Query classification and multi-facet fusion.

pub mod classifier;
pub mod fusion;
pub mod query;

pub use classifier::{
    GroupWeights, ProfileName, QueryClassifier, ResolvedWeights, WeightOverride, distribute,
};
pub use fusion::{
    FacetDistance, FacetReport, FacetStatus, FusedCandidate, SearchFusionEngine, SearchHit,
    SearchResponse, SkipReason, fuse,
};
pub use query::TextQuery;
