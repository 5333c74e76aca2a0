//! The query engine: candidate discovery over per-dimension permutations,
//! intersection, filter application, distance refinement, and top-k selection.
//!
//! For a query `q` and radius `epsilon`, each dimension contributes the set
//! of positions whose value lies in `[q[d] - epsilon, q[d] + epsilon]`, found
//! by two binary searches on that dimension's sorted permutation. A node is a
//! candidate only when every dimension contributed it. Candidates then pass
//! the optional filter, the true-distance bound `epsilon * sqrt(D) * (1 - threshold)`,
//! and a total `(distance, position)` sort before truncation to `top_k`.
//!
//! Dimension scans fan out across a rayon fork-join: the dimension range is
//! split into contiguous blocks, each worker counts hits into a local map,
//! and the locals merge additively into a shared accumulator under a mutex.
//! Results are identical between the parallel and sequential paths because
//! intersection needs every dimension's contribution and the final sort is
//! total.

mod filter;

pub use filter::SearchFilter;

use parking_lot::Mutex;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;
use tracing::trace;

use crate::distance::{admissible_distance, euclidean_distance};
use crate::storage::StorageError;
use crate::types::{Node, Pos, VectorSource};

/// Errors from query validation and execution.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("query dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Parameters for one search.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Per-dimension half-width of the candidate bounding box. Non-negative.
    pub epsilon: f32,
    /// Fraction in `[0, 1]` tightening the final distance bound; 1 admits
    /// exact hits only.
    pub threshold: f32,
    /// Maximum number of results. At least 1.
    pub top_k: usize,
    /// Run the dimension scan on the rayon pool. The sequential path returns
    /// identical results and exists for verification and tiny collections.
    pub parallel: bool,
}

impl SearchParams {
    pub fn new(epsilon: f32, threshold: f32, top_k: usize) -> Self {
        Self {
            epsilon,
            threshold,
            top_k,
            parallel: true,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn validate(&self) -> Result<(), QueryError> {
        if !(self.epsilon >= 0.0) {
            return Err(QueryError::InvalidArgument(format!(
                "epsilon must be non-negative, got {}",
                self.epsilon
            )));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(QueryError::InvalidArgument(format!(
                "threshold must be in [0, 1], got {}",
                self.threshold
            )));
        }
        if self.top_k < 1 {
            return Err(QueryError::InvalidArgument(
                "top_k must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::new(0.3, 0.5, 5)
    }
}

/// One admitted search result.
#[derive(Debug, Clone)]
pub struct SearchMatch {
    /// The node's position in the collection.
    pub position: Pos,
    /// The full node.
    pub node: Node,
    /// True Euclidean distance to the query.
    pub distance: f32,
}

/// Run a search over any vector source. Permutations must be current.
pub fn execute<S: VectorSource + ?Sized>(
    source: &S,
    query: &[f32],
    params: &SearchParams,
    filter: Option<&SearchFilter>,
) -> Result<Vec<SearchMatch>, QueryError> {
    params.validate()?;

    let dims = source.dimensions();
    if query.len() != dims {
        return Err(QueryError::DimensionMismatch {
            expected: dims,
            got: query.len(),
        });
    }

    let count = source.node_count();
    if count == 0 {
        return Ok(Vec::new());
    }

    let hits = if params.parallel && dims > 1 {
        scan_parallel(source, query, params.epsilon)
    } else {
        scan_sequential(source, query, params.epsilon)
    };

    // intersection: a candidate was seen in the interval of every dimension
    let mut candidates: Vec<Pos> = hits
        .into_iter()
        .filter(|&(_, n)| n as usize == dims)
        .map(|(pos, _)| pos)
        .collect();
    candidates.sort_unstable();
    trace!(candidates = candidates.len(), "candidate discovery complete");

    let limit = admissible_distance(params.epsilon, dims, params.threshold);
    let mut matches = Vec::new();
    for pos in candidates {
        let node = source.load_node(pos)?;
        if let Some(f) = filter {
            if !f.matches(&node) {
                continue;
            }
        }
        let distance = euclidean_distance(query, &node.key);
        if distance <= limit {
            matches.push(SearchMatch {
                position: pos,
                node,
                distance,
            });
        }
    }

    matches.sort_by(|a, b| {
        match a.distance.partial_cmp(&b.distance) {
            Some(Ordering::Equal) | None => a.position.cmp(&b.position),
            Some(ord) => ord,
        }
    });
    matches.truncate(params.top_k);
    Ok(matches)
}

/// Count, for one dimension, every position inside the epsilon interval.
fn scan_dimension<S: VectorSource + ?Sized>(
    source: &S,
    query_d: f32,
    dim: usize,
    epsilon: f32,
    hits: &mut HashMap<Pos, u32>,
) {
    let lo = query_d - epsilon;
    let hi = query_d + epsilon;

    let perm = source.dim_permutation(dim);
    let start = perm.partition_point(|&p| source.dim_value(p, dim) < lo);
    let end = perm.partition_point(|&p| source.dim_value(p, dim) <= hi);

    for &pos in &perm[start..end] {
        *hits.entry(pos).or_insert(0) += 1;
    }
}

fn scan_sequential<S: VectorSource + ?Sized>(
    source: &S,
    query: &[f32],
    epsilon: f32,
) -> HashMap<Pos, u32> {
    let mut hits = HashMap::new();
    for (dim, &q) in query.iter().enumerate() {
        scan_dimension(source, q, dim, epsilon, &mut hits);
    }
    hits
}

fn scan_parallel<S: VectorSource + ?Sized>(
    source: &S,
    query: &[f32],
    epsilon: f32,
) -> HashMap<Pos, u32> {
    let dims = query.len();
    let workers = rayon::current_num_threads().clamp(1, dims);
    let block = dims.div_ceil(workers);
    let blocks: Vec<Range<usize>> = (0..workers)
        .map(|w| w * block..((w + 1) * block).min(dims))
        .filter(|r| !r.is_empty())
        .collect();

    let accumulator = Mutex::new(HashMap::new());
    blocks.into_par_iter().for_each(|range| {
        let mut local = HashMap::new();
        for dim in range {
            scan_dimension(source, query[dim], dim, epsilon, &mut local);
        }
        let mut shared = accumulator.lock();
        for (pos, n) in local {
            *shared.entry(pos).or_insert(0) += n;
        }
    });

    accumulator.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Tree;

    fn sample_tree() -> Tree {
        let mut tree = Tree::new(3).unwrap();
        tree.insert(vec![0.1, 0.2, 0.3], "a").unwrap();
        tree.insert(vec![0.1, 0.3, 0.2], "b").unwrap();
        tree.insert(vec![0.9, 0.1, 0.05], "c").unwrap();
        tree
    }

    #[test]
    fn test_search_orders_by_distance() {
        let tree = sample_tree();
        let params = SearchParams::new(0.2, 0.5, 2);
        let results = execute(&tree, &[0.1, 0.25, 0.25], &params, None).unwrap();

        let values: Vec<&str> = results.iter().map(|m| m.node.value.as_str()).collect();
        assert_eq!(values, vec!["a", "b"]);
        assert!(results[0].distance <= results[1].distance);
    }

    #[test]
    fn test_zero_epsilon_matches_exact_only() {
        let tree = sample_tree();
        let params = SearchParams::new(0.0, 0.0, 5);
        let results = execute(&tree, &[0.1, 0.2, 0.3], &params, None).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node.value, "a");
        assert_eq!(results[0].distance, 0.0);
    }

    #[test]
    fn test_empty_source_returns_empty() {
        let tree = Tree::new(3).unwrap();
        let params = SearchParams::default();
        let results = execute(&tree, &[0.1, 0.2, 0.3], &params, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_top_k_larger_than_admitted() {
        let tree = sample_tree();
        let params = SearchParams::new(0.2, 0.5, 100);
        let results = execute(&tree, &[0.1, 0.25, 0.25], &params, None).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_threshold_one_admits_exact_hits_only() {
        let tree = sample_tree();
        let params = SearchParams::new(0.2, 1.0, 5);

        assert!(execute(&tree, &[0.1, 0.25, 0.25], &params, None)
            .unwrap()
            .is_empty());
        let exact = execute(&tree, &[0.1, 0.2, 0.3], &params, None).unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].node.value, "a");
    }

    #[test]
    fn test_dimension_mismatch() {
        let tree = sample_tree();
        let params = SearchParams::default();
        assert!(matches!(
            execute(&tree, &[0.1, 0.2], &params, None),
            Err(QueryError::DimensionMismatch {
                expected: 3,
                got: 2
            })
        ));
    }

    #[test]
    fn test_invalid_arguments() {
        let tree = sample_tree();
        let q = [0.1, 0.2, 0.3];

        let negative_eps = SearchParams::new(-0.1, 0.5, 5);
        assert!(matches!(
            execute(&tree, &q, &negative_eps, None),
            Err(QueryError::InvalidArgument(_))
        ));

        let bad_threshold = SearchParams::new(0.1, 1.5, 5);
        assert!(matches!(
            execute(&tree, &q, &bad_threshold, None),
            Err(QueryError::InvalidArgument(_))
        ));

        let zero_k = SearchParams::new(0.1, 0.5, 0);
        assert!(matches!(
            execute(&tree, &q, &zero_k, None),
            Err(QueryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_filter_rejects_before_distance() {
        let mut tree = Tree::new(2).unwrap();
        tree.insert_with_metadata(
            vec![0.0, 0.0],
            "x",
            Some(crate::types::Metadata::from([(
                "cat".to_string(),
                serde_json::json!("a"),
            )])),
        )
        .unwrap();
        tree.insert_with_metadata(
            vec![0.0, 0.0],
            "y",
            Some(crate::types::Metadata::from([(
                "cat".to_string(),
                serde_json::json!("b"),
            )])),
        )
        .unwrap();

        let params = SearchParams::new(0.1, 0.0, 5);
        let filter = SearchFilter::new().eq("cat", "a");
        let results = execute(&tree, &[0.0, 0.0], &params, Some(&filter)).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node.value, "x");
    }

    #[test]
    fn test_all_candidates_filtered_returns_empty() {
        let tree = sample_tree();
        let params = SearchParams::new(0.2, 0.5, 5);
        let filter = SearchFilter::new().eq("missing", "value");
        let results = execute(&tree, &[0.1, 0.25, 0.25], &params, Some(&filter)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_parallel_equals_sequential() {
        let mut tree = Tree::new(8).unwrap();
        for i in 0..200 {
            let key: Vec<f32> = (0..8).map(|d| ((i * 31 + d * 7) % 100) as f32 / 100.0).collect();
            tree.insert(key, format!("node-{i}")).unwrap();
        }

        let query: Vec<f32> = (0..8).map(|d| 0.4 + d as f32 * 0.01).collect();
        let par = SearchParams::new(0.35, 0.3, 20);
        let seq = par.clone().with_parallel(false);

        let a = execute(&tree, &query, &par, None).unwrap();
        let b = execute(&tree, &query, &seq, None).unwrap();

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.position, y.position);
            assert_eq!(x.distance, y.distance);
        }
    }

    #[test]
    fn test_candidate_requires_every_dimension() {
        let mut tree = Tree::new(2).unwrap();
        // close in dimension 0, far in dimension 1
        tree.insert(vec![0.5, 0.9], "partial").unwrap();
        tree.insert(vec![0.5, 0.5], "full").unwrap();

        let params = SearchParams::new(0.1, 0.0, 5);
        let results = execute(&tree, &[0.5, 0.5], &params, None).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node.value, "full");
    }
}
