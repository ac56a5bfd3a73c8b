//! Read-only handle over one facet's current snapshot.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::KbError;
use crate::types::{Facet, RowId};
use crate::vector::{Forest, Metric, VectorDimension, VectorError, load_forest};

/// What a facet index can currently serve.
#[derive(Debug, Clone)]
pub enum IndexState {
    Ready(Forest),
    /// No snapshot has been written yet.
    Empty,
    /// The snapshot exists but could not be loaded.
    Unavailable(String),
}

/// Summary of [`IndexState`] for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FacetHealth {
    Ready { items: usize },
    Empty,
    Unavailable { reason: String },
}

/// Typed result of querying one facet.
#[derive(Debug, Clone, PartialEq)]
pub enum FacetQueryOutcome {
    Hits(Vec<(RowId, f32)>),
    Empty,
    Unavailable(String),
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone)]
pub struct FacetIndex {
    facet: Facet,
    path: PathBuf,
    state: IndexState,
}

impl FacetIndex {
    /// Loads the snapshot at `path`. Never fails: a missing file gives an
    /// empty index and a broken one an unavailable index.
    pub fn open(facet: Facet, path: &Path, dimension: VectorDimension, metric: Metric) -> Self {
        let state = if !path.exists() {
            debug!(facet = %facet, path = %path.display(), "no snapshot yet");
            IndexState::Empty
        } else {
            match load_forest(path, dimension, metric) {
                Ok(forest) => {
                    debug!(facet = %facet, items = forest.len(), "loaded snapshot");
                    IndexState::Ready(forest)
                }
                Err(e) => {
                    let err = KbError::IndexLoad {
                        facet,
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    };
                    warn!(facet = %facet, error = %err, "facet index unavailable");
                    IndexState::Unavailable(e.to_string())
                }
            }
        };

        Self {
            facet,
            path: path.to_path_buf(),
            state,
        }
    }

    pub fn from_forest(facet: Facet, path: &Path, forest: Forest) -> Self {
        Self {
            facet,
            path: path.to_path_buf(),
            state: IndexState::Ready(forest),
        }
    }

    pub fn facet(&self) -> Facet {
        self.facet
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &IndexState {
        &self.state
    }

    pub fn forest(&self) -> Option<&Forest> {
        match &self.state {
            IndexState::Ready(forest) => Some(forest),
            _ => None,
        }
    }

    /// Number of items, zero unless ready.
    pub fn len(&self) -> usize {
        self.forest().map(Forest::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn health(&self) -> FacetHealth {
        match &self.state {
            IndexState::Ready(forest) => FacetHealth::Ready {
                items: forest.len(),
            },
            IndexState::Empty => FacetHealth::Empty,
            IndexState::Unavailable(reason) => FacetHealth::Unavailable {
                reason: reason.clone(),
            },
        }
    }

    pub fn query(&self, vector: &[f32], k: usize) -> FacetQueryOutcome {
        let forest = match &self.state {
            IndexState::Ready(forest) if !forest.is_empty() => forest,
            IndexState::Ready(_) | IndexState::Empty => return FacetQueryOutcome::Empty,
            IndexState::Unavailable(reason) => {
                return FacetQueryOutcome::Unavailable(reason.clone());
            }
        };

        match forest.get_nearest(vector, k) {
            Ok(hits) => FacetQueryOutcome::Hits(hits),
            Err(VectorError::DimensionMismatch { expected, actual }) => {
                FacetQueryOutcome::DimensionMismatch { expected, actual }
            }
            Err(e) => FacetQueryOutcome::Unavailable(e.to_string()),
        }
    }
}
