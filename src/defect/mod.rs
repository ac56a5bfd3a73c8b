//! Defect report model and text preparation for embedding.

mod diff;
mod record;

pub use diff::{DiffSummary, preprocess_diffs};
pub use record::DefectRecord;
