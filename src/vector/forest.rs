//! Random projection forest for approximate nearest neighbor queries.
//!
//! A [`ForestBuilder`] accepts items until [`ForestBuilder::build`] consumes it;
//! the resulting [`Forest`] is immutable. Adding a record means building a new
//! forest from the old items plus the new ones.
//!
//! Each tree recursively splits its items with a hyperplane drawn between two
//! sampled items until a node holds at most `leaf_size` items. Queries walk all
//! trees at once from a priority queue ordered by hyperplane margin, gather
//! `k * n_trees` candidates and re-rank them exactly.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::metric::{Metric, dot, norm, normalized};
use super::types::{VectorDimension, VectorError};
use crate::types::RowId;

/// Default maximum number of items per leaf.
pub const DEFAULT_LEAF_SIZE: usize = 32;

/// Default seed used when the caller does not configure one.
pub const DEFAULT_SEED: u64 = 0x0B5C_0A7D_2024;

/// Hyperplane attempts before falling back to an even split.
const SPLIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Split {
        normal: Vec<f32>,
        offset: f32,
        left: u32,
        right: u32,
    },
    Leaf {
        items: Vec<u32>,
    },
}

/// One tree, stored as a flat node arena rooted at index 0.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Tree {
    pub(crate) nodes: Vec<Node>,
}

/// Accumulates items for a forest that has not been built yet.
#[derive(Debug, Clone)]
pub struct ForestBuilder {
    dimension: VectorDimension,
    metric: Metric,
    leaf_size: usize,
    seed: u64,
    items: BTreeMap<u32, Vec<f32>>,
}

impl ForestBuilder {
    pub fn new(dimension: VectorDimension, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            leaf_size: DEFAULT_LEAF_SIZE,
            seed: DEFAULT_SEED,
            items: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_leaf_size(mut self, leaf_size: usize) -> Self {
        self.leaf_size = leaf_size.max(1);
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Adds or replaces the vector stored for `id`.
    pub fn add_item(&mut self, id: RowId, vector: &[f32]) -> Result<(), VectorError> {
        self.dimension.validate_finite(vector)?;
        self.items.insert(id.value(), vector.to_vec());
        Ok(())
    }

    pub fn contains(&self, id: RowId) -> bool {
        self.items.contains_key(&id.value())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    /// Builds `n_trees` trees in parallel. This is the only way to obtain a
    /// queryable structure.
    pub fn build(self, n_trees: usize) -> Result<Forest, VectorError> {
        if n_trees == 0 {
            return Err(VectorError::InvalidTreeCount(0));
        }

        let dim = self.dimension.get();
        let n_slots = self
            .items
            .keys()
            .next_back()
            .map(|id| *id as usize + 1)
            .unwrap_or(0);

        let mut data = vec![0.0; n_slots * dim];
        let mut present = vec![false; n_slots];
        for (id, vector) in &self.items {
            let start = *id as usize * dim;
            data[start..start + dim].copy_from_slice(vector);
            present[*id as usize] = true;
        }

        let mut forest = Forest::from_parts(self.dimension, self.metric, data, present, Vec::new());
        let leaf_size = self.leaf_size;
        let seed = self.seed;
        let trees: Vec<Tree> = (0..n_trees)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = StdRng::seed_from_u64(tree_seed(seed, tree_idx));
                forest.build_tree(leaf_size, &mut rng)
            })
            .collect();
        forest.trees = trees;
        Ok(forest)
    }
}

fn tree_seed(seed: u64, tree_idx: usize) -> u64 {
    seed ^ (tree_idx as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// An immutable, queryable forest over `(RowId, vector)` items.
#[derive(Debug, Clone, PartialEq)]
pub struct Forest {
    dimension: VectorDimension,
    metric: Metric,
    /// Row-major vectors, one slot per id up to the largest id.
    data: Vec<f32>,
    present: Vec<bool>,
    ids: Vec<u32>,
    pub(crate) trees: Vec<Tree>,
}

/// Queue entry for the margin-ordered traversal.
struct Pending {
    priority: f32,
    tree: usize,
    node: u32,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.tree.cmp(&self.tree))
            .then_with(|| other.node.cmp(&self.node))
    }
}

struct SplitResult {
    normal: Vec<f32>,
    offset: f32,
    left: Vec<u32>,
    right: Vec<u32>,
}

impl Forest {
    pub(crate) fn from_parts(
        dimension: VectorDimension,
        metric: Metric,
        data: Vec<f32>,
        present: Vec<bool>,
        trees: Vec<Tree>,
    ) -> Self {
        let ids = present
            .iter()
            .enumerate()
            .filter(|(_, p)| **p)
            .map(|(i, _)| i as u32)
            .collect();
        Self {
            dimension,
            metric,
            data,
            present,
            ids,
            trees,
        }
    }

    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Number of id slots, i.e. the largest stored id plus one.
    pub fn n_slots(&self) -> usize {
        self.present.len()
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = RowId> + '_ {
        self.ids.iter().map(|id| RowId::new(*id))
    }

    pub fn contains(&self, id: RowId) -> bool {
        self.present.get(id.as_index()).copied().unwrap_or(false)
    }

    /// Stored vector for `id`, if the forest holds one.
    pub fn get_item(&self, id: RowId) -> Option<&[f32]> {
        if !self.contains(id) {
            return None;
        }
        Some(self.slot(id.value()))
    }

    pub(crate) fn raw_data(&self) -> &[f32] {
        &self.data
    }

    fn slot(&self, id: u32) -> &[f32] {
        let dim = self.dimension.get();
        let start = id as usize * dim;
        &self.data[start..start + dim]
    }

    /// Returns up to `k` `(id, distance)` pairs ordered by ascending distance.
    ///
    /// Ties are broken by ascending id. When `k` covers every item the result
    /// is exact.
    pub fn get_nearest(&self, query: &[f32], k: usize) -> Result<Vec<(RowId, f32)>, VectorError> {
        self.dimension.validate_vector(query)?;
        if k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = if k >= self.ids.len() {
            self.ids.clone()
        } else {
            let search_k = k.saturating_mul(self.trees.len().max(1));
            self.collect_candidates(query, search_k)
        };

        let mut scored: Vec<(RowId, f32)> = candidates
            .into_iter()
            .map(|id| (RowId::new(id), self.metric.distance(query, self.slot(id))))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    fn collect_candidates(&self, query: &[f32], search_k: usize) -> Vec<u32> {
        let mut heap = BinaryHeap::with_capacity(self.trees.len() * 2);
        for tree in 0..self.trees.len() {
            heap.push(Pending {
                priority: f32::INFINITY,
                tree,
                node: 0,
            });
        }

        let mut seen = vec![false; self.present.len()];
        let mut candidates = Vec::with_capacity(search_k);

        while candidates.len() < search_k {
            let Some(Pending {
                priority,
                tree,
                node,
            }) = heap.pop()
            else {
                break;
            };
            match &self.trees[tree].nodes[node as usize] {
                Node::Leaf { items } => {
                    for &id in items {
                        if !seen[id as usize] {
                            seen[id as usize] = true;
                            candidates.push(id);
                        }
                    }
                }
                Node::Split {
                    normal,
                    offset,
                    left,
                    right,
                } => {
                    let margin = dot(normal, query) + offset;
                    heap.push(Pending {
                        priority: priority.min(margin),
                        tree,
                        node: *right,
                    });
                    heap.push(Pending {
                        priority: priority.min(-margin),
                        tree,
                        node: *left,
                    });
                }
            }
        }

        candidates
    }

    fn build_tree(&self, leaf_size: usize, rng: &mut StdRng) -> Tree {
        let mut nodes = vec![Node::Leaf { items: Vec::new() }];
        let mut work = vec![(0usize, self.ids.clone())];

        while let Some((slot, items)) = work.pop() {
            if items.len() <= leaf_size {
                nodes[slot] = Node::Leaf { items };
                continue;
            }

            let split = self.split(items, rng);
            let left = nodes.len();
            nodes.push(Node::Leaf { items: Vec::new() });
            nodes.push(Node::Leaf { items: Vec::new() });
            let right = left + 1;
            nodes[slot] = Node::Split {
                normal: split.normal,
                offset: split.offset,
                left: left as u32,
                right: right as u32,
            };
            work.push((left, split.left));
            work.push((right, split.right));
        }

        Tree { nodes }
    }

    fn split(&self, mut items: Vec<u32>, rng: &mut StdRng) -> SplitResult {
        for _ in 0..SPLIT_ATTEMPTS {
            let i = rng.random_range(0..items.len());
            let mut j = rng.random_range(0..items.len() - 1);
            if j >= i {
                j += 1;
            }

            let (normal, offset) = self.hyperplane(self.slot(items[i]), self.slot(items[j]));
            if norm(&normal) <= f32::EPSILON {
                continue;
            }

            let (right, left): (Vec<u32>, Vec<u32>) = items
                .iter()
                .partition(|id| dot(&normal, self.slot(**id)) + offset > 0.0);
            if !left.is_empty() && !right.is_empty() {
                return SplitResult {
                    normal,
                    offset,
                    left,
                    right,
                };
            }
        }

        // Degenerate data: a zero hyperplane sends queries down both halves
        items.shuffle(rng);
        let right = items.split_off(items.len() / 2);
        SplitResult {
            normal: vec![0.0; self.dimension.get()],
            offset: 0.0,
            left: items,
            right,
        }
    }

    fn hyperplane(&self, a: &[f32], b: &[f32]) -> (Vec<f32>, f32) {
        match self.metric {
            Metric::Angular => {
                let (na, nb) = (normalized(a), normalized(b));
                let normal = na.iter().zip(&nb).map(|(x, y)| x - y).collect();
                (normal, 0.0)
            }
            Metric::Euclidean | Metric::Manhattan => {
                let normal: Vec<f32> = a.iter().zip(b).map(|(x, y)| x - y).collect();
                let midpoint: Vec<f32> = a.iter().zip(b).map(|(x, y)| (x + y) / 2.0).collect();
                let offset = -dot(&normal, &midpoint);
                (normal, offset)
            }
        }
    }
}
