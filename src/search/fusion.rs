//! Weighted fusion of per-facet candidate lists.
//!
//! Every weighted facet with a query vector is asked for its nearest
//! neighbours. Each returned `(row, distance)` adds `distance * weight` to the
//! row's weighted sum and `weight` to its weight sum; the fused distance is the
//! ratio of the two. A row missing from a facet's list gets no contribution
//! from that facet rather than a penalty.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use super::classifier::ProfileName;
use crate::defect::DefectRecord;
use crate::index::{FacetIndex, FacetQueryOutcome};
use crate::storage::MetadataSnapshot;
use crate::types::{Facet, FacetMap, FacetVectors, FacetWeights, RowId};

/// Raw distance a hit scored on one facet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FacetDistance {
    pub facet: Facet,
    pub distance: f32,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub row_id: RowId,
    pub record: DefectRecord,
    /// Fused distance. Smaller is more similar.
    pub distance: f32,
    pub facet_distances: Vec<FacetDistance>,
}

impl SearchHit {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }

    pub fn is_duplicate(&self, threshold: f32) -> bool {
        self.similarity() >= threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    NoQuery,
    ZeroWeight,
    EmptyIndex,
    Unavailable { detail: String },
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FacetStatus {
    Queried { candidates: usize },
    Skipped(SkipReason),
}

/// What one facet contributed to a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetReport {
    pub facet: Facet,
    pub weight: f32,
    pub status: FacetStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    pub profile: Option<ProfileName>,
    pub hits: Vec<SearchHit>,
    pub facets: Vec<FacetReport>,
}

impl SearchResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// A fused row before it is joined with its record.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub row_id: RowId,
    pub distance: f32,
    pub facet_distances: Vec<FacetDistance>,
}

#[derive(Default)]
struct Accumulator {
    weighted_sum: f32,
    weight_sum: f32,
    facet_distances: Vec<FacetDistance>,
}

/// Merges per-facet `(row, distance)` lists into one list sorted by fused
/// distance, ties broken by ascending row id.
///
/// A row listed twice by the same facet only counts its first occurrence.
pub fn fuse(per_facet: &[(Facet, f32, Vec<(RowId, f32)>)]) -> Vec<FusedCandidate> {
    let mut scores: HashMap<RowId, Accumulator> = HashMap::new();

    for (facet, weight, hits) in per_facet {
        if *weight <= 0.0 {
            continue;
        }
        let mut seen = HashSet::with_capacity(hits.len());
        for (row_id, distance) in hits {
            if !seen.insert(*row_id) {
                continue;
            }
            let entry = scores.entry(*row_id).or_default();
            entry.weighted_sum += distance * weight;
            entry.weight_sum += weight;
            entry.facet_distances.push(FacetDistance {
                facet: *facet,
                distance: *distance,
                weight: *weight,
            });
        }
    }

    let mut fused: Vec<FusedCandidate> = scores
        .into_iter()
        .filter(|(_, acc)| acc.weight_sum > 0.0)
        .map(|(row_id, acc)| FusedCandidate {
            row_id,
            distance: acc.weighted_sum / acc.weight_sum,
            facet_distances: acc.facet_distances,
        })
        .collect();

    fused.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.row_id.cmp(&b.row_id))
    });
    fused
}

#[derive(Debug, Clone, Copy)]
pub struct SearchFusionEngine {
    min_candidates: usize,
    oversample: usize,
}

impl Default for SearchFusionEngine {
    fn default() -> Self {
        Self::new(50, 10)
    }
}

impl SearchFusionEngine {
    pub fn new(min_candidates: usize, oversample: usize) -> Self {
        Self {
            min_candidates,
            oversample: oversample.max(1),
        }
    }

    /// Neighbours to fetch per facet: `max(min_candidates, n * oversample)`
    /// capped at the index size.
    pub fn candidate_count(&self, n_results: usize, index_len: usize) -> usize {
        self.min_candidates
            .max(n_results.saturating_mul(self.oversample))
            .min(index_len)
    }

    /// Queries, fuses and joins.
    ///
    /// Rows in `in_flight` are being written: an index may hold them before
    /// their records are stored, so their absence from `metadata` is expected.
    pub fn search(
        &self,
        handles: &FacetMap<Arc<FacetIndex>>,
        metadata: &MetadataSnapshot,
        in_flight: &Range<RowId>,
        queries: &FacetVectors,
        weights: &FacetWeights,
        n_results: usize,
    ) -> SearchResponse {
        if queries.is_empty() || n_results == 0 {
            return SearchResponse::empty();
        }

        let per_facet: Vec<(FacetReport, Option<Vec<(RowId, f32)>>)> = Facet::ALL
            .par_iter()
            .map(|facet| self.query_facet(*facet, handles, queries, weights, n_results))
            .collect();

        let mut reports = Vec::with_capacity(per_facet.len());
        let mut lists = Vec::new();
        for (report, hits) in per_facet {
            if let Some(hits) = hits {
                lists.push((report.facet, report.weight, hits));
            }
            reports.push(report);
        }

        let fused = fuse(&lists);
        debug!(
            facets = lists.len(),
            candidates = fused.len(),
            "fused facet candidates"
        );

        SearchResponse {
            profile: None,
            hits: join(fused, metadata, in_flight, n_results),
            facets: reports,
        }
    }

    fn query_facet(
        &self,
        facet: Facet,
        handles: &FacetMap<Arc<FacetIndex>>,
        queries: &FacetVectors,
        weights: &FacetWeights,
        n_results: usize,
    ) -> (FacetReport, Option<Vec<(RowId, f32)>>) {
        let weight = weights.weight(facet);
        let report = |status| FacetReport {
            facet,
            weight,
            status,
        };
        let skipped = |reason| (report(FacetStatus::Skipped(reason)), None);

        let Some(query) = queries.get(facet) else {
            return skipped(SkipReason::NoQuery);
        };
        if weight.is_nan() || weight <= 0.0 {
            return skipped(SkipReason::ZeroWeight);
        }
        let Some(index) = handles.get(facet) else {
            return skipped(SkipReason::EmptyIndex);
        };

        let k = self.candidate_count(n_results, index.len());
        match index.query(query, k) {
            FacetQueryOutcome::Hits(hits) => {
                debug!(facet = %facet, k, candidates = hits.len(), "queried facet");
                (
                    report(FacetStatus::Queried {
                        candidates: hits.len(),
                    }),
                    Some(hits),
                )
            }
            FacetQueryOutcome::Empty => skipped(SkipReason::EmptyIndex),
            FacetQueryOutcome::Unavailable(detail) => {
                warn!(facet = %facet, reason = %detail, "skipping unavailable facet");
                skipped(SkipReason::Unavailable { detail })
            }
            FacetQueryOutcome::DimensionMismatch { expected, actual } => {
                warn!(facet = %facet, expected, actual, "skipping facet, query has wrong dimension");
                skipped(SkipReason::DimensionMismatch { expected, actual })
            }
        }
    }
}

fn join(
    fused: Vec<FusedCandidate>,
    metadata: &MetadataSnapshot,
    in_flight: &Range<RowId>,
    n_results: usize,
) -> Vec<SearchHit> {
    let mut hits = Vec::with_capacity(n_results.min(fused.len()));

    for candidate in fused {
        if hits.len() >= n_results {
            break;
        }
        match metadata.get(&candidate.row_id) {
            Some(stored) if stored.retired => {
                debug!(row_id = %candidate.row_id, "dropping retired record");
            }
            Some(stored) => hits.push(SearchHit {
                row_id: candidate.row_id,
                record: stored.record.clone(),
                distance: candidate.distance,
                facet_distances: candidate.facet_distances,
            }),
            None if in_flight.contains(&candidate.row_id) => {
                debug!(row_id = %candidate.row_id, "skipping row still being written");
            }
            None => {
                warn!(
                    row_id = %candidate.row_id,
                    "indexed row has no metadata entry, dropping"
                );
            }
        }
    }
    hits
}
