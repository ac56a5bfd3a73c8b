//! Rebuild-on-write protocol for the facet indices.
//!
//! A built forest cannot accept new items, so every mutation of a facet runs
//! the same sequence under that facet's write lock:
//!
//! 1. create an empty builder
//! 2. copy every item of the persisted snapshot (ids `0..known slots`)
//! 3. add the new vectors
//! 4. build the forest
//! 5. stage the snapshot in the scratch directory and rename it over the
//!    canonical file
//! 6. reload the canonical file and publish it as the current handle
//!
//! Facets are independent: a failure in one leaves its previous snapshot
//! canonical and does not affect the others.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::facet::FacetIndex;
use crate::config::Settings;
use crate::error::{KbError, KbResult};
use crate::storage::{RetryPolicy, commit_staged, stage_bytes};
use crate::types::{Facet, FacetMap, FacetVectors, RowId};
use crate::vector::{ForestBuilder, Metric, VectorDimension, load_forest};

/// Result of one facet's part in a write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FacetOutcome {
    /// A new snapshot is canonical. `rejected` lists rows whose vector was
    /// refused.
    Rebuilt { items: usize, rejected: Vec<RowId> },
    /// No new vector for this facet, the snapshot was left alone.
    Unchanged,
    Failed { kind: String, message: String },
}

impl FacetOutcome {
    pub fn from_error(err: &KbError) -> Self {
        Self::Failed {
            kind: err.status_code(),
            message: err.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Per-facet outcome of a record write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteReport {
    pub row_ids: Vec<RowId>,
    pub facets: BTreeMap<Facet, FacetOutcome>,
}

impl WriteReport {
    pub fn failed_facets(&self) -> Vec<Facet> {
        self.facets
            .iter()
            .filter(|(_, outcome)| outcome.is_failed())
            .map(|(facet, _)| *facet)
            .collect()
    }

    /// True when no facet failed.
    pub fn is_complete(&self) -> bool {
        self.failed_facets().is_empty()
    }
}

/// Everything the manager needs to build and place snapshots.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub data_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub dimension: VectorDimension,
    pub metric: Metric,
    pub n_trees: usize,
    pub leaf_size: usize,
    pub seed: u64,
    pub retry: RetryPolicy,
}

impl LifecycleConfig {
    pub fn from_settings(settings: &Settings) -> KbResult<Self> {
        Ok(Self {
            data_dir: settings.data_path(),
            scratch_dir: settings.scratch_path(),
            dimension: settings.dimension()?,
            metric: settings.metric()?,
            n_trees: settings.vector.n_trees,
            leaf_size: settings.vector.leaf_size,
            seed: settings.vector.seed,
            retry: settings.retry_policy(),
        })
    }

    pub fn index_path(&self, facet: Facet) -> PathBuf {
        self.data_dir.join(facet.index_file_name())
    }
}

struct FacetSlot {
    write: Mutex<()>,
    current: RwLock<Arc<FacetIndex>>,
}

pub struct IndexLifecycleManager {
    config: LifecycleConfig,
    slots: Vec<FacetSlot>,
}

impl IndexLifecycleManager {
    /// Opens every facet from its canonical file.
    pub fn open(config: LifecycleConfig) -> Self {
        let slots = Facet::ALL
            .iter()
            .map(|facet| FacetSlot {
                write: Mutex::new(()),
                current: RwLock::new(Arc::new(Self::load_handle(&config, *facet))),
            })
            .collect();
        Self { config, slots }
    }

    fn load_handle(config: &LifecycleConfig, facet: Facet) -> FacetIndex {
        FacetIndex::open(
            facet,
            &config.index_path(facet),
            config.dimension,
            config.metric,
        )
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn index_path(&self, facet: Facet) -> PathBuf {
        self.config.index_path(facet)
    }

    /// Current read-only handle. Readers keep it for the whole query; a
    /// concurrent write publishes a new handle without touching this one.
    pub fn current(&self, facet: Facet) -> Arc<FacetIndex> {
        Arc::clone(&self.slots[facet.index()].current.read())
    }

    pub fn handles(&self) -> FacetMap<Arc<FacetIndex>> {
        Facet::ALL
            .into_iter()
            .map(|facet| (facet, self.current(facet)))
            .collect()
    }

    /// Reloads every handle from disk.
    pub fn refresh(&self) {
        for facet in Facet::ALL {
            let slot = &self.slots[facet.index()];
            let _guard = slot.write.lock();
            *slot.current.write() = Arc::new(Self::load_handle(&self.config, facet));
        }
        debug!("reloaded all facet handles");
    }

    /// Adds a batch of rows to every facet they carry a vector for, with one
    /// rebuild per touched facet.
    ///
    /// `known_slots` is the metadata id counter; step 2 copies ids below it.
    pub fn apply_batch(
        &self,
        rows: &[(RowId, FacetVectors)],
        known_slots: usize,
    ) -> BTreeMap<Facet, FacetOutcome> {
        Facet::ALL
            .par_iter()
            .map(|facet| (*facet, self.apply_facet(*facet, rows, known_slots)))
            .collect()
    }

    fn apply_facet(
        &self,
        facet: Facet,
        rows: &[(RowId, FacetVectors)],
        known_slots: usize,
    ) -> FacetOutcome {
        let mut accepted: Vec<(RowId, &[f32])> = Vec::new();
        let mut rejected = Vec::new();
        let mut first_rejection = None;

        for (row_id, vectors) in rows {
            let Some(vector) = vectors.get(facet) else {
                continue;
            };
            match self.config.dimension.validate_finite(vector) {
                Ok(()) => accepted.push((*row_id, vector.as_slice())),
                Err(e) => {
                    warn!(facet = %facet, row_id = %row_id, error = %e, "rejected facet vector");
                    rejected.push(*row_id);
                    first_rejection.get_or_insert(KbError::from(e));
                }
            }
        }

        if accepted.is_empty() {
            return match first_rejection {
                Some(err) => {
                    error!(facet = %facet, error = %err, "every new vector was rejected");
                    FacetOutcome::from_error(&err)
                }
                None => FacetOutcome::Unchanged,
            };
        }

        match self.rebuild(facet, true, &accepted, known_slots) {
            Ok(items) => FacetOutcome::Rebuilt { items, rejected },
            Err(err) => {
                error!(facet = %facet, error = %err, "facet rebuild failed");
                FacetOutcome::from_error(&err)
            }
        }
    }

    /// Runs the rebuild protocol with no new items.
    pub fn rebuild_facet(&self, facet: Facet, known_slots: usize) -> FacetOutcome {
        match self.rebuild(facet, true, &[], known_slots) {
            Ok(items) => FacetOutcome::Rebuilt {
                items,
                rejected: Vec::new(),
            },
            Err(err) => {
                error!(facet = %facet, error = %err, "facet rebuild failed");
                FacetOutcome::from_error(&err)
            }
        }
    }

    pub fn rebuild_all(&self, known_slots: usize) -> BTreeMap<Facet, FacetOutcome> {
        Facet::ALL
            .par_iter()
            .map(|facet| (*facet, self.rebuild_facet(*facet, known_slots)))
            .collect()
    }

    /// Replaces a facet with exactly `items`, ignoring the current snapshot.
    pub fn build_from_scratch(&self, facet: Facet, items: &[(RowId, Vec<f32>)]) -> FacetOutcome {
        let mut accepted = Vec::with_capacity(items.len());
        let mut rejected = Vec::new();
        for (row_id, vector) in items {
            match self.config.dimension.validate_finite(vector) {
                Ok(()) => accepted.push((*row_id, vector.as_slice())),
                Err(e) => {
                    warn!(facet = %facet, row_id = %row_id, error = %e, "rejected facet vector");
                    rejected.push(*row_id);
                }
            }
        }

        match self.rebuild(facet, false, &accepted, 0) {
            Ok(items) => FacetOutcome::Rebuilt { items, rejected },
            Err(err) => {
                error!(facet = %facet, error = %err, "facet rebuild failed");
                FacetOutcome::from_error(&err)
            }
        }
    }

    fn rebuild(
        &self,
        facet: Facet,
        copy_existing: bool,
        new_items: &[(RowId, &[f32])],
        known_slots: usize,
    ) -> KbResult<usize> {
        let slot = &self.slots[facet.index()];
        let _guard = slot.write.lock();
        let build_err = |reason: String| KbError::IndexBuild { facet, reason };

        // 1
        let mut builder = ForestBuilder::new(self.config.dimension, self.config.metric)
            .with_leaf_size(self.config.leaf_size)
            .with_seed(self.config.seed);

        // 2
        if copy_existing {
            self.copy_current(facet, &slot.current, &mut builder, known_slots)?;
        }

        // 3
        for (row_id, vector) in new_items {
            builder
                .add_item(*row_id, vector)
                .map_err(|e| build_err(format!("row {row_id}: {e}")))?;
        }

        // 4
        let items = builder.len();
        let forest = builder
            .build(self.config.n_trees)
            .map_err(|e| build_err(e.to_string()))?;

        // 5
        let path = self.config.index_path(facet);
        let staged = stage_bytes(&self.config.scratch_dir, &forest.to_bytes())?;
        commit_staged(staged, &path, &self.config.retry)?;

        // 6
        let handle = match load_forest(&path, self.config.dimension, self.config.metric) {
            Ok(reloaded) => FacetIndex::from_forest(facet, &path, reloaded),
            Err(e) => {
                warn!(
                    facet = %facet,
                    error = %e,
                    "reload after swap failed, serving the in-memory build"
                );
                FacetIndex::from_forest(facet, &path, forest)
            }
        };
        *slot.current.write() = Arc::new(handle);

        info!(facet = %facet, items, added = new_items.len(), "facet snapshot swapped");
        Ok(items)
    }

    fn copy_current(
        &self,
        facet: Facet,
        current: &RwLock<Arc<FacetIndex>>,
        builder: &mut ForestBuilder,
        known_slots: usize,
    ) -> KbResult<()> {
        let path = self.config.index_path(facet);
        let source = self.copy_source(facet, &path, current);
        let Some(source) = source.as_ref().and_then(|s| s.forest()) else {
            return Ok(());
        };

        let upper = known_slots.max(source.n_slots());
        let mut missing = 0usize;
        for raw in 0..upper {
            let row_id = RowId::new(raw as u32);
            match source.get_item(row_id) {
                Some(vector) => builder.add_item(row_id, vector).map_err(|e| {
                    KbError::IndexBuild {
                        facet,
                        reason: format!("copying row {row_id}: {e}"),
                    }
                })?,
                None => {
                    trace!(facet = %facet, row_id = %row_id, "no vector for row");
                    missing += 1;
                }
            }
        }
        debug!(facet = %facet, copied = builder.len(), missing, "copied existing snapshot");
        Ok(())
    }

    /// The persisted snapshot, or the in-memory handle when the file cannot be
    /// loaded. `None` means the facet starts empty.
    fn copy_source(
        &self,
        facet: Facet,
        path: &Path,
        current: &RwLock<Arc<FacetIndex>>,
    ) -> Option<Arc<FacetIndex>> {
        if !path.exists() {
            return None;
        }
        match load_forest(path, self.config.dimension, self.config.metric) {
            Ok(forest) => Some(Arc::new(FacetIndex::from_forest(facet, path, forest))),
            Err(e) => {
                let handle = Arc::clone(&current.read());
                if handle.forest().is_some() {
                    warn!(
                        facet = %facet,
                        error = %e,
                        "snapshot unreadable, copying from the in-memory handle"
                    );
                    Some(handle)
                } else {
                    warn!(
                        facet = %facet,
                        error = %e,
                        "snapshot unreadable and no healthy handle, starting empty"
                    );
                    None
                }
            }
        }
    }
}

impl std::fmt::Debug for IndexLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexLifecycleManager")
            .field("data_dir", &self.config.data_dir)
            .finish()
    }
}
