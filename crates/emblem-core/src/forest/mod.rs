//! Randomized-projection forest
//!
//! The index structure behind approximate search: `tree_count` independent
//! space-partitioning trees over the same vector set. Each split draws two
//! random vectors and separates the rest by the perpendicular-bisector
//! hyperplane between them; each tree therefore partitions the space
//! differently, and a query gathers candidates from all of them.
//!
//! Trees are immutable once built. Adding vectors means rebuilding the
//! forest from a fresh snapshot, the standard trade-off for a compact,
//! read-only structure with sub-linear query traversal.
//!
//! Nodes live in a flat arena per tree and reference each other by `u32`
//! index, which keeps serialization trivial and avoids pointer-chasing
//! recursion on the query path.
//!
//! # Accuracy contract
//!
//! Search is approximate: the candidate set is whatever the trees yield
//! within the caller's budget, so the true k nearest are not guaranteed.
//! More trees at build time and a larger budget at query time both raise
//! recall at the cost of time and space.

pub mod serialize;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::simd::dot_product;

/// Split recursion stops at this many items per leaf.
pub const DEFAULT_LEAF_SIZE: usize = 16;

/// Hard cap on tree depth for degenerate (highly duplicated) data.
const MAX_DEPTH: usize = 64;

/// Attempts to find a separating hyperplane before giving up on a split.
const SPLIT_ATTEMPTS: usize = 3;

/// Build-time parameters for one forest
#[derive(Debug, Clone, Copy)]
pub struct ForestParams {
    /// Number of randomized trees; governs accuracy/size/speed.
    pub tree_count: usize,
    /// Maximum items per leaf.
    pub leaf_size: usize,
    /// RNG seed; a fixed seed makes builds reproducible.
    pub seed: u64,
}

impl ForestParams {
    pub fn new(tree_count: usize, seed: u64) -> Self {
        Self {
            tree_count,
            leaf_size: DEFAULT_LEAF_SIZE,
            seed,
        }
    }
}

/// One arena node: an internal hyperplane split or a leaf of items
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Split {
        left: u32,
        right: u32,
        bias: f32,
        normal: Vec<f32>,
    },
    Leaf {
        items: Vec<u32>,
    },
}

/// One randomized partitioning tree as a flat node arena
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: u32,
}

/// A built forest: the tree structure only; item vectors are supplied by
/// the caller at both build and scoring time.
#[derive(Debug)]
pub struct RpForest {
    dim: usize,
    count: usize,
    seed: u64,
    trees: Vec<Tree>,
}

impl RpForest {
    /// Build a forest over `count` vectors stored densely in position order.
    ///
    /// `dense.len()` must equal `count * dim`. Trees build in parallel;
    /// each derives its RNG from `params.seed` and its tree number, so a
    /// fixed seed yields an identical forest. Returns `None` when `cancel`
    /// is raised before completion.
    pub fn build(
        dim: usize,
        dense: &[f32],
        params: ForestParams,
        cancel: &AtomicBool,
    ) -> Option<Self> {
        debug_assert_eq!(dense.len() % dim.max(1), 0);
        let count = dense.len() / dim.max(1);

        let trees: Option<Vec<Tree>> = (0..params.tree_count)
            .into_par_iter()
            .map(|tree_no| {
                if cancel.load(AtomicOrdering::Relaxed) {
                    return None;
                }
                let mut rng =
                    StdRng::seed_from_u64(params.seed ^ (tree_no as u64).wrapping_mul(0x9E37_79B9));
                Some(build_tree(dim, dense, count, params.leaf_size, &mut rng))
            })
            .collect();

        trees.map(|trees| Self {
            dim,
            count,
            seed: params.seed,
            trees,
        })
    }

    /// Reassemble a forest from deserialized parts
    pub(crate) fn from_parts(dim: usize, count: usize, seed: u64, trees: Vec<Tree>) -> Self {
        Self {
            dim,
            count,
            seed,
            trees,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of indexed items
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub(crate) fn trees(&self) -> &[Tree] {
        &self.trees
    }

    /// Gather up to `budget` distinct candidate positions for a query.
    ///
    /// All trees are traversed through one shared priority queue ordered by
    /// hyperplane margin, so the most promising branches across the whole
    /// forest are expanded first. Traversal is deterministic for a fixed
    /// forest and query.
    pub fn candidates(&self, query: &[f32], budget: usize) -> Vec<u32> {
        debug_assert_eq!(query.len(), self.dim);

        let mut heap = std::collections::BinaryHeap::with_capacity(self.trees.len() * 2);
        for (tree_no, tree) in self.trees.iter().enumerate() {
            heap.push(Frontier {
                priority: f32::INFINITY,
                tree: tree_no as u32,
                node: tree.root,
            });
        }

        let mut visited = vec![false; self.count];
        let mut out = Vec::with_capacity(budget);

        while out.len() < budget {
            let Some(entry) = heap.pop() else { break };
            let tree = &self.trees[entry.tree as usize];

            match &tree.nodes[entry.node as usize] {
                Node::Leaf { items } => {
                    for &item in items {
                        if !visited[item as usize] {
                            visited[item as usize] = true;
                            out.push(item);
                        }
                    }
                }
                Node::Split {
                    left,
                    right,
                    bias,
                    normal,
                } => {
                    let margin = dot_product(normal, query) - bias;
                    heap.push(Frontier {
                        priority: entry.priority.min(margin),
                        tree: entry.tree,
                        node: *right,
                    });
                    heap.push(Frontier {
                        priority: entry.priority.min(-margin),
                        tree: entry.tree,
                        node: *left,
                    });
                }
            }
        }

        out
    }
}

/// Frontier entry for the shared traversal queue (max-heap on margin)
#[derive(Clone, Copy)]
struct Frontier {
    priority: f32,
    tree: u32,
    node: u32,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .partial_cmp(&other.priority)
            .unwrap_or(Ordering::Equal)
            // Total order keeps traversal deterministic under ties.
            .then_with(|| other.tree.cmp(&self.tree))
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn build_tree(
    dim: usize,
    dense: &[f32],
    count: usize,
    leaf_size: usize,
    rng: &mut StdRng,
) -> Tree {
    let mut nodes = Vec::new();
    let indices: Vec<u32> = (0..count as u32).collect();
    let root = build_node(dim, dense, &indices, leaf_size, 0, rng, &mut nodes);
    Tree { nodes, root }
}

fn build_node(
    dim: usize,
    dense: &[f32],
    indices: &[u32],
    leaf_size: usize,
    depth: usize,
    rng: &mut StdRng,
    nodes: &mut Vec<Node>,
) -> u32 {
    if indices.len() <= leaf_size || depth >= MAX_DEPTH {
        nodes.push(Node::Leaf {
            items: indices.to_vec(),
        });
        return (nodes.len() - 1) as u32;
    }

    for _ in 0..SPLIT_ATTEMPTS {
        let Some((normal, bias)) = draw_hyperplane(dim, dense, indices, rng) else {
            continue;
        };

        let mut left_items = Vec::new();
        let mut right_items = Vec::new();
        for &idx in indices {
            let v = row(dense, dim, idx);
            let margin = dot_product(&normal, v) - bias;
            if margin < 0.0 {
                left_items.push(idx);
            } else if margin > 0.0 {
                right_items.push(idx);
            } else if rng.gen::<bool>() {
                right_items.push(idx);
            } else {
                left_items.push(idx);
            }
        }

        if left_items.is_empty() || right_items.is_empty() {
            continue;
        }

        let left = build_node(dim, dense, &left_items, leaf_size, depth + 1, rng, nodes);
        let right = build_node(dim, dense, &right_items, leaf_size, depth + 1, rng, nodes);
        nodes.push(Node::Split {
            left,
            right,
            bias,
            normal,
        });
        return (nodes.len() - 1) as u32;
    }

    // No separating hyperplane found (duplicated or near-identical data).
    nodes.push(Node::Leaf {
        items: indices.to_vec(),
    });
    (nodes.len() - 1) as u32
}

/// Draw the perpendicular-bisector hyperplane between two random items.
///
/// Returns `None` when the sampled pair coincides and defines no plane.
fn draw_hyperplane(
    dim: usize,
    dense: &[f32],
    indices: &[u32],
    rng: &mut StdRng,
) -> Option<(Vec<f32>, f32)> {
    let a = indices[rng.gen_range(0..indices.len())];
    let b = indices[rng.gen_range(0..indices.len())];
    if a == b {
        return None;
    }

    let va = row(dense, dim, a);
    let vb = row(dense, dim, b);

    let mut normal: Vec<f32> = va.iter().zip(vb.iter()).map(|(x, y)| x - y).collect();
    let norm = dot_product(&normal, &normal).sqrt();
    if norm < 1e-12 {
        return None;
    }
    for c in normal.iter_mut() {
        *c /= norm;
    }

    let midpoint: Vec<f32> = va.iter().zip(vb.iter()).map(|(x, y)| (x + y) * 0.5).collect();
    let bias = dot_product(&normal, &midpoint);
    Some((normal, bias))
}

#[inline]
fn row(dense: &[f32], dim: usize, idx: u32) -> &[f32] {
    let start = idx as usize * dim;
    &dense[start..start + dim]
}
