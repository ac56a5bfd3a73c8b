//! The knowledge base handle.
//!
//! [`KnowledgeBase`] owns the metadata store, the seven facet indices, the
//! classifier and the fusion engine. It is constructed once from [`Settings`]
//! and shared by reference (or `Arc`) with every caller.
//!
//! Writes are serialized by one global writer lock. Searches never take it:
//! they read the current facet handles and a metadata snapshot, so a write that
//! lands mid-search is simply not visible to that search.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::defect::DefectRecord;
use crate::error::{KbError, KbResult};
use crate::index::{
    FacetHealth, FacetIndex, FacetOutcome, IndexLifecycleManager, LifecycleConfig, WriteReport,
};
use crate::search::{
    QueryClassifier, SearchFusionEngine, SearchHit, SearchResponse, TextQuery, WeightOverride,
};
use crate::storage::{METADATA_FILE_NAME, MetadataStore};
use crate::types::{Facet, FacetVectors, RowId};
use crate::vector::{EmbeddingGenerator, embed_facet_texts};

/// Per-facet part of [`KbStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetStats {
    pub facet: Facet,
    pub path: PathBuf,
    pub health: FacetHealth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KbStats {
    pub records: usize,
    pub active_records: usize,
    pub next_id: RowId,
    pub facets: Vec<FacetStats>,
}

/// Result of [`KnowledgeBase::verify`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsistencyReport {
    /// Indexed rows with no metadata entry.
    pub orphans: BTreeMap<Facet, Vec<RowId>>,
    /// Facets whose snapshot could not be loaded, with the reason.
    pub unavailable: BTreeMap<Facet, String>,
    pub checked_rows: usize,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.orphans.values().all(Vec::is_empty) && self.unavailable.is_empty()
    }
}

pub struct KnowledgeBase {
    settings: Arc<Settings>,
    metadata: RwLock<MetadataStore>,
    indices: IndexLifecycleManager,
    writer: Mutex<()>,
    classifier: QueryClassifier,
    fusion: SearchFusionEngine,
    embedder: Option<Arc<dyn EmbeddingGenerator>>,
}

impl KnowledgeBase {
    /// Opens (or creates) the knowledge base under `settings.data_path()`.
    ///
    /// Broken facet files do not fail the open; a corrupt metadata file does
    /// unless `storage.recover_corrupt_metadata` is set.
    pub fn open(settings: Settings) -> KbResult<Self> {
        settings.validate()?;

        let data_dir = settings.data_path();
        std::fs::create_dir_all(&data_dir).map_err(|e| KbError::FileWrite {
            path: data_dir.clone(),
            source: e,
        })?;

        let metadata = MetadataStore::open(
            &data_dir.join(METADATA_FILE_NAME),
            &settings.scratch_path(),
            settings.retry_policy(),
            settings.storage.recover_corrupt_metadata,
        )?;
        let indices = IndexLifecycleManager::open(LifecycleConfig::from_settings(&settings)?);

        info!(
            data_dir = %data_dir.display(),
            records = metadata.len(),
            "opened knowledge base"
        );

        Ok(Self {
            classifier: QueryClassifier::new(settings.search.mixed_weights),
            fusion: SearchFusionEngine::new(
                settings.search.min_candidates,
                settings.search.oversample,
            ),
            settings: Arc::new(settings),
            metadata: RwLock::new(metadata),
            indices,
            writer: Mutex::new(()),
            embedder: None,
        })
    }

    /// Attaches the embedder used by the text entry points.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingGenerator>) -> KbResult<Self> {
        let expected = self.settings.vector.dimension;
        let actual = embedder.dimension().get();
        if expected != actual {
            return Err(KbError::DimensionMismatch { expected, actual });
        }
        self.embedder = Some(embedder);
        Ok(self)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    fn embedder(&self) -> KbResult<&dyn EmbeddingGenerator> {
        self.embedder.as_deref().ok_or(KbError::NoEmbedder)
    }

    /// Current read-only handle of one facet.
    pub fn index(&self, facet: Facet) -> Arc<FacetIndex> {
        self.indices.current(facet)
    }

    pub fn index_path(&self, facet: Facet) -> PathBuf {
        self.indices.index_path(facet)
    }

    /// Adds one pre-embedded record.
    pub fn add_record(&self, record: DefectRecord, vectors: FacetVectors) -> KbResult<WriteReport> {
        self.add_batch(vec![(record, vectors)])
    }

    /// Adds pre-embedded records with one rebuild per touched facet.
    ///
    /// Row ids are allocated first, then every facet is rebuilt, then the
    /// records are written to metadata. A facet failure is reported in the
    /// returned map; the record is still stored. If storing the records fails
    /// the error is [`KbError::MetadataWrite`], which still carries the map.
    pub fn add_batch(&self, items: Vec<(DefectRecord, FacetVectors)>) -> KbResult<WriteReport> {
        if items.is_empty() {
            return Ok(WriteReport::default());
        }
        let _writer = self.writer.lock();

        let (records, vectors): (Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|(mut record, vectors)| {
                record.normalize();
                (record, vectors)
            })
            .unzip();

        let (row_ids, known_slots) = {
            let mut metadata = self.metadata.write();
            let ids = metadata.allocate_ids(records.len())?;
            (ids, metadata.next_id().as_index())
        };

        let rows: Vec<(RowId, FacetVectors)> = row_ids.iter().copied().zip(vectors).collect();
        let facets = self.indices.apply_batch(&rows, known_slots);

        let entries: Vec<(RowId, DefectRecord)> = row_ids.iter().copied().zip(records).collect();
        let stored = {
            let mut metadata = self.metadata.write();
            let stored = metadata.put_many(entries);
            metadata.settle_in_flight();
            stored
        };
        finish_write(WriteReport { row_ids, facets }, stored)
    }

    /// Embeds every populated facet of `record`.
    pub fn embed_record(&self, record: &DefectRecord) -> KbResult<FacetVectors> {
        let mut record = record.clone();
        record.normalize();
        Ok(embed_facet_texts(self.embedder()?, &record.facet_texts())?)
    }

    /// Embeds and adds raw records.
    pub fn add_records_text(&self, records: Vec<DefectRecord>) -> KbResult<WriteReport> {
        let items = records
            .into_iter()
            .map(|record| {
                let vectors = self.embed_record(&record)?;
                Ok((record, vectors))
            })
            .collect::<KbResult<Vec<_>>>()?;
        self.add_batch(items)
    }

    /// Fused search over pre-embedded query vectors.
    ///
    /// An empty query returns an empty response. Facets that cannot be
    /// queried are listed in the response's facet reports.
    pub fn search(
        &self,
        queries: &FacetVectors,
        weights: &WeightOverride,
        n_results: usize,
    ) -> KbResult<SearchResponse> {
        let supplied: Vec<Facet> = queries.facets().collect();
        let Some(resolved) = self.classifier.resolve(&supplied, weights)? else {
            debug!("empty query, nothing to search");
            return Ok(SearchResponse::empty());
        };

        // Handles first: any row they hold was allocated before this read
        let handles = self.indices.handles();
        let (metadata, in_flight) = {
            let store = self.metadata.read();
            (store.snapshot(), store.in_flight())
        };
        let mut response = self.fusion.search(
            &handles,
            &metadata,
            &in_flight,
            queries,
            &resolved.weights,
            n_results,
        );
        response.profile = Some(resolved.profile);
        debug!(
            profile = %resolved.profile,
            hits = response.hits.len(),
            "search finished"
        );
        Ok(response)
    }

    /// Embeds each non-blank field of `query` and searches with it.
    pub fn search_text(
        &self,
        query: &TextQuery,
        weights: &WeightOverride,
        n_results: usize,
    ) -> KbResult<SearchResponse> {
        if query.is_empty() {
            return Ok(SearchResponse::empty());
        }
        let vectors = embed_facet_texts(self.embedder()?, &query.to_facet_texts())?;
        self.search(&vectors, weights, n_results)
    }

    /// Stored records similar enough to `record` to count as duplicates.
    pub fn find_duplicates(&self, record: &DefectRecord) -> KbResult<Vec<SearchHit>> {
        let vectors = self.embed_record(record)?;
        let threshold = self.settings.search.similarity_threshold;
        let response = self.search(
            &vectors,
            &WeightOverride::Auto,
            self.settings.search.default_results,
        )?;
        Ok(response
            .hits
            .into_iter()
            .filter(|hit| hit.is_duplicate(threshold))
            .collect())
    }

    pub fn rebuild_facet(&self, facet: Facet) -> FacetOutcome {
        let _writer = self.writer.lock();
        let known_slots = self.metadata.read().next_id().as_index();
        self.indices.rebuild_facet(facet, known_slots)
    }

    pub fn rebuild_all(&self) -> BTreeMap<Facet, FacetOutcome> {
        let _writer = self.writer.lock();
        let known_slots = self.metadata.read().next_id().as_index();
        self.indices.rebuild_all(known_slots)
    }

    /// Re-embeds every active record and rebuilds every facet from scratch.
    ///
    /// All embedding happens before any index is touched, so an embedder
    /// failure leaves the current snapshots in place.
    pub fn reindex_from_metadata(&self) -> KbResult<WriteReport> {
        let embedder = self.embedder()?;
        let _writer = self.writer.lock();
        let snapshot = self.metadata.read().snapshot();

        let mut row_ids = Vec::new();
        let mut per_facet: BTreeMap<Facet, Vec<(RowId, Vec<f32>)>> = BTreeMap::new();
        for (row_id, stored) in snapshot.iter().filter(|(_, s)| !s.retired) {
            let vectors = embed_facet_texts(embedder, &stored.record.facet_texts())?;
            for (facet, vector) in vectors.iter() {
                per_facet
                    .entry(facet)
                    .or_default()
                    .push((*row_id, vector.clone()));
            }
            row_ids.push(*row_id);
        }
        info!(records = row_ids.len(), "re-embedded active records");

        let facets = Facet::ALL
            .into_iter()
            .map(|facet| {
                let items = per_facet.remove(&facet).unwrap_or_default();
                (facet, self.indices.build_from_scratch(facet, &items))
            })
            .collect();

        let report = WriteReport { row_ids, facets };
        log_report(&report);
        Ok(report)
    }

    pub fn get(&self, id: RowId) -> Option<DefectRecord> {
        self.metadata.read().get(id).cloned()
    }

    pub fn find_by_identifier(&self, identifier: &str) -> Option<(RowId, DefectRecord)> {
        self.metadata
            .read()
            .find_by_identifier(identifier)
            .map(|(id, stored)| (id, stored.record.clone()))
    }

    /// Logically deletes a record. Its vectors stay indexed but it is
    /// dropped from every search result.
    pub fn retire(&self, id: RowId) -> KbResult<bool> {
        let _writer = self.writer.lock();
        self.metadata.write().retire(id)
    }

    /// Reloads every facet handle from disk.
    pub fn refresh(&self) {
        self.indices.refresh();
    }

    pub fn stats(&self) -> KbStats {
        let metadata = self.metadata.read();
        KbStats {
            records: metadata.len(),
            active_records: metadata.active_len(),
            next_id: metadata.next_id(),
            facets: Facet::ALL
                .into_iter()
                .map(|facet| {
                    let index = self.indices.current(facet);
                    FacetStats {
                        facet,
                        path: index.path().to_path_buf(),
                        health: index.health(),
                    }
                })
                .collect(),
        }
    }

    /// Checks that every indexed row has a metadata entry.
    pub fn verify(&self) -> ConsistencyReport {
        let snapshot = self.metadata.read().snapshot();
        let mut report = ConsistencyReport::default();

        for facet in Facet::ALL {
            let index = self.indices.current(facet);
            if let FacetHealth::Unavailable { reason } = index.health() {
                warn!(facet = %facet, reason = %reason, "facet index unavailable");
                report.unavailable.insert(facet, reason);
                continue;
            }
            let Some(forest) = index.forest() else {
                continue;
            };

            let orphans: Vec<RowId> = forest
                .ids()
                .inspect(|_| report.checked_rows += 1)
                .filter(|id| !snapshot.contains_key(id))
                .collect();
            if !orphans.is_empty() {
                error!(
                    facet = %facet,
                    count = orphans.len(),
                    "indexed rows missing from metadata"
                );
                report.orphans.insert(facet, orphans);
            }
        }

        info!(
            checked = report.checked_rows,
            consistent = report.is_consistent(),
            "consistency check finished"
        );
        report
    }
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("data_dir", &self.settings.data_path())
            .field("embedder", &self.embedder.is_some())
            .finish()
    }
}

fn finish_write(report: WriteReport, stored: KbResult<()>) -> KbResult<WriteReport> {
    match stored {
        Ok(()) => {
            log_report(&report);
            Ok(report)
        }
        Err(e) => {
            error!(
                rows = report.row_ids.len(),
                error = %e,
                "metadata write failed after index rebuild"
            );
            Err(KbError::MetadataWrite {
                report: Box::new(report),
                source: Box::new(e),
            })
        }
    }
}

fn log_report(report: &WriteReport) {
    for (facet, outcome) in &report.facets {
        match outcome {
            FacetOutcome::Rebuilt { items, rejected } => {
                debug!(facet = %facet, items, rejected = rejected.len(), "facet rebuilt");
            }
            FacetOutcome::Unchanged => {}
            FacetOutcome::Failed { kind, message } => {
                warn!(facet = %facet, kind = %kind, message = %message, "facet write failed");
            }
        }
    }
    info!(
        rows = report.row_ids.len(),
        failed = report.failed_facets().len(),
        "write finished"
    );
}
