//! Per-facet indices and the rebuild-on-write lifecycle.

pub mod facet;
pub mod lifecycle;
pub mod staging;

pub use facet::{FacetHealth, FacetIndex, FacetQueryOutcome, IndexState};
pub use lifecycle::{
    FacetOutcome, IndexLifecycleManager, LifecycleConfig, WriteReport,
};
pub use staging::StagingWriter;
