use std::cmp::Ordering;
use std::collections::BinaryHeap;

use faer::MatRef;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustc_hash::FxHashSet;

use crate::core::graph::knn::DistanceMetric;
use crate::error::{Result, ScrubletError};

/// Maximum number of items in a leaf
const LEAF_SIZE: usize = 10;

//////////////////
// Annoy search //
//////////////////

/// Tree node representation for binary space partitioning
///
/// Each node is either a split (with hyperplane and child pointers) or leaf
/// (with vector indices)
#[derive(Clone, Debug)]
enum AnnoyNode {
    /// Internal node that splits space using a hyperplane
    Split {
        /// Random hyperplane normal vector for splitting
        hyperplane: Vec<f32>,
        /// Threshold for hyperplane decision (median of projections)
        threshold: f32,
        left: usize,
        right: usize,
    },
    /// Terminal node containing the vector indices of this partition
    Leaf { items: Vec<usize> },
}

/// Entry of the best-first search queue across all trees
#[derive(Debug)]
struct QueueItem {
    priority: f32,
    tree: usize,
    node: usize,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    // max-heap on priority, ties resolved towards lower tree/node ids
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.tree.cmp(&self.tree))
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// Approximate Nearest Neighbors index using random binary trees
///
/// Partitions vector space using multiple random hyperplanes to enable fast
/// approximate neighbour search. Trade-off between accuracy and speed
/// controlled by number of trees and the search budget.
///
/// ### Fields
///
/// * `trees` - Collection of binary trees, each with different random
///   partitioning.
/// * `vectors_flat` - Vector data for distance calculations. Flattened for
///   better cache locality. For the cosine metric the rows are stored L2
///   normalised.
/// * `dim` - Number of dimensions in the vector
/// * `n_vectors` - Number of indexed vectors
/// * `metric` - Distance metric used at query time
pub struct AnnoyIndex {
    trees: Vec<Vec<AnnoyNode>>,
    vectors_flat: Vec<f32>,
    dim: usize,
    n_vectors: usize,
    metric: DistanceMetric,
}

impl AnnoyIndex {
    /// Creates a new Annoy index from an embedding-type matrix
    ///
    /// ### Params
    ///
    /// * `mat` - Matrix with rows = samples and columns = features.
    /// * `n_trees` - Number of random trees to build.
    /// * `seed` - Random seed for reproducible results.
    /// * `metric` - The distance metric. Chebyshev is not supported.
    ///
    /// ### Returns
    ///
    /// Initialised AnnoyIndex ready for querying
    ///
    /// ### Algorithm Details
    ///
    /// 1. Draw one seed per tree up front, so the parallel build is
    ///    deterministic.
    /// 2. For each node, generate a random hyperplane (uniform values in
    ///    [-1,1]) and project all vectors of the node onto it.
    /// 3. Split at the median projection: vectors ≤ median go left, others
    ///    go right.
    /// 4. Recurse until ≤10 vectors remain (leaf nodes).
    pub fn new(mat: MatRef<f32>, n_trees: usize, seed: u64, metric: DistanceMetric) -> Result<Self> {
        if !metric.supported_by_annoy() {
            return Err(ScrubletError::UnsupportedMetric {
                metric: metric.name().to_string(),
                backend: "annoy",
            });
        }
        if n_trees == 0 {
            return Err(ScrubletError::param("n_trees must be at least 1"));
        }

        let n_vectors = mat.nrows();
        let dim = mat.ncols();

        let mut vectors_flat = Vec::with_capacity(n_vectors * dim);
        for i in 0..n_vectors {
            let start = vectors_flat.len();
            vectors_flat.extend(mat.row(i).iter().copied());
            if metric == DistanceMetric::Cosine {
                l2_normalise(&mut vectors_flat[start..]);
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let seeds: Vec<u64> = (0..n_trees).map(|_| rng.random()).collect();

        let trees: Vec<Vec<AnnoyNode>> = seeds
            .into_par_iter()
            .map(|tree_seed| {
                let mut tree_rng = StdRng::seed_from_u64(tree_seed);
                Self::build_tree(&vectors_flat, dim, (0..n_vectors).collect(), &mut tree_rng)
            })
            .collect();

        Ok(AnnoyIndex {
            trees,
            vectors_flat,
            dim,
            n_vectors,
            metric,
        })
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.n_vectors
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.n_vectors == 0
    }

    /// Number of trees in the forest
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Builds a single random tree from the given items
    ///
    /// ### Returns
    ///
    /// Vector of AnnoyNodes representing the tree structure (index 0 = root)
    fn build_tree(
        vectors_flat: &[f32],
        dim: usize,
        items: Vec<usize>,
        rng: &mut StdRng,
    ) -> Vec<AnnoyNode> {
        let mut nodes = Vec::with_capacity(items.len() / LEAF_SIZE * 2 + 1);
        Self::build_node(vectors_flat, dim, items, &mut nodes, rng);
        nodes
    }

    /// Recursively builds tree nodes using random hyperplanes
    ///
    /// ### Params
    ///
    /// * `vectors_flat` - All vectors in the dataset
    /// * `dim` - Dimensionality of the vectors
    /// * `items` - Items to split at this node
    /// * `nodes` - Growing list of tree nodes
    /// * `rng` - Random number generator
    ///
    /// ### Returns
    ///
    /// Index of the created node in the nodes vector. Falls back to a leaf
    /// when the split leaves one side empty (e.g. duplicated vectors).
    fn build_node(
        vectors_flat: &[f32],
        dim: usize,
        items: Vec<usize>,
        nodes: &mut Vec<AnnoyNode>,
        rng: &mut StdRng,
    ) -> usize {
        if items.len() <= LEAF_SIZE {
            let node_idx = nodes.len();
            nodes.push(AnnoyNode::Leaf { items });
            return node_idx;
        }

        let hyperplane: Vec<f32> = (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect();

        let mut item_dots: Vec<(usize, f32)> = items
            .iter()
            .map(|&item| {
                let v = &vectors_flat[item * dim..(item + 1) * dim];
                (item, dot(v, &hyperplane))
            })
            .collect();

        item_dots.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        let threshold = item_dots[item_dots.len() / 2].1;

        let (left_items, right_items): (Vec<(usize, f32)>, Vec<(usize, f32)>) =
            item_dots.into_iter().partition(|&(_, d)| d <= threshold);

        if left_items.is_empty() || right_items.is_empty() {
            let node_idx = nodes.len();
            nodes.push(AnnoyNode::Leaf { items });
            return node_idx;
        }

        let node_idx = nodes.len();
        nodes.push(AnnoyNode::Split {
            hyperplane,
            threshold,
            left: 0,
            right: 0,
        });

        let left_idx = Self::build_node(
            vectors_flat,
            dim,
            left_items.into_iter().map(|(i, _)| i).collect(),
            nodes,
            rng,
        );
        let right_idx = Self::build_node(
            vectors_flat,
            dim,
            right_items.into_iter().map(|(i, _)| i).collect(),
            nodes,
            rng,
        );

        if let AnnoyNode::Split {
            ref mut left,
            ref mut right,
            ..
        } = nodes[node_idx]
        {
            *left = left_idx;
            *right = right_idx;
        }

        node_idx
    }

    /// Queries the index for the k nearest neighbours of a vector
    ///
    /// All trees are searched jointly best-first: the node whose path has
    /// the largest minimum margin to the splitting hyperplanes is expanded
    /// next. The search stops once `max(search_k, k)` distinct candidates
    /// were collected or every tree is exhausted, so fewer than `k` results
    /// are only returned if the index holds fewer than `k` vectors.
    ///
    /// ### Params
    ///
    /// * `query_vec` - Vector to find neighbours for.
    /// * `k` - Number of neighbours to return.
    /// * `search_k` - Search budget (None = k * n_trees, higher = better
    ///   recall)
    ///
    /// ### Returns
    ///
    /// Tuple of `(nearest neighbour indices, distances)` sorted by distance
    /// and then index.
    pub fn query(
        &self,
        query_vec: &[f32],
        k: usize,
        search_k: Option<usize>,
    ) -> (Vec<usize>, Vec<f32>) {
        if self.metric == DistanceMetric::Cosine {
            let mut normalised = query_vec.to_vec();
            l2_normalise(&mut normalised);
            return self.query_prepared(&normalised, k, search_k, None);
        }
        self.query_prepared(query_vec, k, search_k, None)
    }

    /// Queries the neighbours of an indexed vector, excluding the vector
    /// itself
    ///
    /// ### Params
    ///
    /// * `item` - Index of the vector in the index.
    /// * `k` - Number of neighbours to return.
    /// * `search_k` - Search budget (None = k * n_trees).
    ///
    /// ### Returns
    ///
    /// Tuple of `(nearest neighbour indices, distances)`
    pub fn query_item(
        &self,
        item: usize,
        k: usize,
        search_k: Option<usize>,
    ) -> (Vec<usize>, Vec<f32>) {
        let v = &self.vectors_flat[item * self.dim..(item + 1) * self.dim];
        self.query_prepared(v, k, search_k, Some(item))
    }

    fn query_prepared(
        &self,
        query_vec: &[f32],
        k: usize,
        search_k: Option<usize>,
        exclude: Option<usize>,
    ) -> (Vec<usize>, Vec<f32>) {
        let target = search_k.unwrap_or(k * self.trees.len()).max(k) + usize::from(exclude.is_some());
        let candidates = self.collect_candidates(query_vec, target);

        let mut scored: Vec<(usize, f32)> = candidates
            .into_iter()
            .filter(|&idx| Some(idx) != exclude)
            .map(|idx| {
                let v = &self.vectors_flat[idx * self.dim..(idx + 1) * self.dim];
                (idx, self.distance(query_vec, v))
            })
            .collect();

        scored.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        scored.into_iter().unzip()
    }

    /// Best-first traversal across all trees
    fn collect_candidates(&self, query_vec: &[f32], target: usize) -> Vec<usize> {
        let mut queue: BinaryHeap<QueueItem> = (0..self.trees.len())
            .map(|tree| QueueItem {
                priority: f32::INFINITY,
                tree,
                node: 0,
            })
            .collect();

        let mut seen = FxHashSet::default();
        let mut candidates = Vec::with_capacity(target);

        while candidates.len() < target {
            let Some(QueueItem {
                priority,
                tree,
                node,
            }) = queue.pop()
            else {
                break;
            };

            match &self.trees[tree][node] {
                AnnoyNode::Leaf { items } => {
                    for &item in items {
                        if seen.insert(item) {
                            candidates.push(item);
                        }
                    }
                }
                AnnoyNode::Split {
                    hyperplane,
                    threshold,
                    left,
                    right,
                } => {
                    let margin = dot(query_vec, hyperplane) - threshold;
                    queue.push(QueueItem {
                        priority: priority.min(margin),
                        tree,
                        node: *right,
                    });
                    queue.push(QueueItem {
                        priority: priority.min(-margin),
                        tree,
                        node: *left,
                    });
                }
            }
        }

        candidates
    }

    /// Distance between a (prepared) query and an indexed vector
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            // both sides are unit length already
            DistanceMetric::Cosine => 1.0 - dot(a, b),
            DistanceMetric::Dot => -dot(a, b),
            other => other.distance(a, b),
        }
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0, |acc, (x, y)| acc + x * y)
}

/// L2 normalise in place; zero vectors stay zero
fn l2_normalise(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

///////////
// Tests //
///////////
