//! Hierarchical clustering of variables, with results cached per metric and input.
//!
//! The linkage step sits behind [`LinkageEngine`]; [`AgglomerativeLinkage`] implements the
//! Lance-Williams recurrences for single, complete, average and Ward linkage on a full distance
//! matrix. Merge records use the usual identifiers: items are `0..n`, the cluster formed at step
//! `s` is `n + s`.

use crate::error::{AnalysisError, Result};
use crate::stats::{distance_correlation, pearson};
use log::{debug, info};
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Cluster-distance update rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Linkage {
    /// Minimum distance between members.
    Single,
    /// Maximum distance between members.
    Complete,
    /// Size-weighted mean distance between members (UPGMA).
    Average,
    /// Minimum increase of within-cluster variance. Applied to squared input distances.
    Ward,
}

/// How a dendrogram is cut into flat labels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClusterCut {
    /// Exactly this many clusters (clamped to `1..=n`).
    Clusters(usize),
    /// Apply every merge at or below this height.
    Height(f64),
    /// Apply every merge at or below this fraction of the highest merge.
    RelativeHeight(f64),
}

pub type DistanceFn = dyn Fn(ArrayView1<f64>, ArrayView1<f64>) -> f64 + Send + Sync;

/// Pairwise distance between two item vectors.
#[derive(Clone)]
pub enum DistanceMetric {
    Euclidean,
    /// `1 - r`
    Correlation,
    /// `1 - |r|`
    AbsCorrelation,
    /// `1 - dCor`
    DistanceCorrelation,
    Custom { name: String, function: Arc<DistanceFn> },
}

impl DistanceMetric {
    pub fn custom<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(ArrayView1<f64>, ArrayView1<f64>) -> f64 + Send + Sync + 'static,
    {
        DistanceMetric::Custom {
            name: name.into(),
            function: Arc::new(function),
        }
    }

    /// Identifier used in cache keys.
    pub fn name(&self) -> &str {
        match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::Correlation => "correlation",
            DistanceMetric::AbsCorrelation => "abscorrelation",
            DistanceMetric::DistanceCorrelation => "distcorr",
            DistanceMetric::Custom { name, .. } => name,
        }
    }

    pub fn distance(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        match self {
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y).powi(2))
                .sum::<f64>()
                .sqrt(),
            DistanceMetric::Correlation => 1.0 - pearson(a, b),
            DistanceMetric::AbsCorrelation => 1.0 - pearson(a, b).abs(),
            DistanceMetric::DistanceCorrelation => 1.0 - distance_correlation(a, b),
            DistanceMetric::Custom { function, .. } => (function.as_ref())(a, b),
        }
    }

    /// Symmetric distance matrix between the rows of `items`, with a zero diagonal.
    pub fn pairwise(&self, items: ArrayView2<f64>) -> Result<Array2<f64>> {
        let n = items.nrows();
        let mut distances = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in (i + 1)..n {
                let d = self.distance(items.row(i), items.row(j));
                if !d.is_finite() || d < 0.0 {
                    return Err(AnalysisError::invalid(format!(
                        "metric {} returned {} for items {} and {}",
                        self.name(),
                        d,
                        i,
                        j
                    )));
                }
                distances[[i, j]] = d;
                distances[[j, i]] = d;
            }
        }
        Ok(distances)
    }
}

impl fmt::Debug for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DistanceMetric({})", self.name())
    }
}

/// What was clustered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClusterInput {
    /// The variables of the raw dataset, compared across observations.
    Data,
    /// The variables of a factor solution, compared by their loadings.
    Loadings(usize),
}

/// Cache key of a clustering result.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub metric: String,
    pub input: ClusterInput,
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.input {
            ClusterInput::Data => write!(f, "clustering_metric-{}_input-data", self.metric),
            ClusterInput::Loadings(c) => write!(f, "clustering_metric-{}_input-EFA{}", self.metric, c),
        }
    }
}

/// One agglomeration step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub height: f64,
    /// Number of items in the new cluster.
    pub size: usize,
}

/// Output of a linkage engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dendrogram {
    /// `n - 1` merges in agglomeration order.
    pub merges: Vec<Merge>,
    /// Items in dendrogram order.
    pub leaf_order: Vec<usize>,
    /// Flat cluster label per item, numbered by first appearance.
    pub labels: Vec<usize>,
}

impl Dendrogram {
    pub fn n_clusters(&self) -> usize {
        self.labels.iter().max().map_or(0, |&m| m + 1)
    }
}

/// A cached clustering of labelled items.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusteringResult {
    pub items: Vec<String>,
    pub distances: Array2<f64>,
    pub dendrogram: Dendrogram,
}

impl ClusteringResult {
    /// Flat label per item name.
    pub fn assignments(&self) -> BTreeMap<String, usize> {
        self.items
            .iter()
            .cloned()
            .zip(self.dendrogram.labels.iter().copied())
            .collect()
    }
}

/// Turns a distance matrix into a dendrogram.
pub trait LinkageEngine: Send + Sync {
    fn linkage(&self, distances: &Array2<f64>) -> Result<Dendrogram>;
}

/// Naive `O(n^3)` agglomerative clustering.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AgglomerativeLinkage {
    pub linkage: Linkage,
    pub cut: ClusterCut,
}

impl Default for AgglomerativeLinkage {
    fn default() -> Self {
        Self {
            linkage: Linkage::Average,
            cut: ClusterCut::RelativeHeight(0.7),
        }
    }
}

fn lance_williams(linkage: Linkage, d_ik: f64, d_jk: f64, d_ij: f64, si: usize, sj: usize, sk: usize) -> f64 {
    match linkage {
        Linkage::Single => d_ik.min(d_jk),
        Linkage::Complete => d_ik.max(d_jk),
        Linkage::Average => {
            let (ni, nj) = (si as f64, sj as f64);
            (ni * d_ik + nj * d_jk) / (ni + nj)
        }
        Linkage::Ward => {
            let (ni, nj, nk) = (si as f64, sj as f64, sk as f64);
            ((ni + nk) * d_ik + (nj + nk) * d_jk - nk * d_ij) / (ni + nj + nk)
        }
    }
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Flat labels after applying the merges selected by `apply`.
fn flat_labels(merges: &[Merge], n: usize, apply: impl Fn(usize, &Merge) -> bool) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..(2 * n).max(1)).collect();
    for (step, merge) in merges.iter().enumerate() {
        if !apply(step, merge) {
            continue;
        }
        let id = n + step;
        let a = find(&mut parent, merge.left);
        let b = find(&mut parent, merge.right);
        parent[a] = id;
        parent[b] = id;
    }
    let mut seen = HashMap::new();
    (0..n)
        .map(|i| {
            let root = find(&mut parent, i);
            let next = seen.len();
            *seen.entry(root).or_insert(next)
        })
        .collect()
}

fn leaf_order(merges: &[Merge], n: usize) -> Vec<usize> {
    if merges.is_empty() {
        return (0..n).collect();
    }
    let mut order = Vec::with_capacity(n);
    let mut stack = vec![n + merges.len() - 1];
    while let Some(node) = stack.pop() {
        if node < n {
            order.push(node);
        } else {
            let merge = &merges[node - n];
            stack.push(merge.right);
            stack.push(merge.left);
        }
    }
    order
}

impl AgglomerativeLinkage {
    pub fn new(linkage: Linkage, cut: ClusterCut) -> Self {
        Self { linkage, cut }
    }

    /// Flat labels of a dendrogram's merges under this engine's cut.
    pub fn cut_labels(&self, merges: &[Merge], n: usize) -> Vec<usize> {
        match self.cut {
            ClusterCut::Clusters(k) => {
                let applied = n.saturating_sub(k.clamp(1, n.max(1)));
                flat_labels(merges, n, |step, _| step < applied)
            }
            ClusterCut::Height(h) => flat_labels(merges, n, |_, m| m.height <= h),
            ClusterCut::RelativeHeight(fraction) => {
                let top = merges.iter().map(|m| m.height).fold(0.0_f64, f64::max);
                let h = fraction * top;
                flat_labels(merges, n, |_, m| m.height <= h)
            }
        }
    }
}

impl LinkageEngine for AgglomerativeLinkage {
    fn linkage(&self, distances: &Array2<f64>) -> Result<Dendrogram> {
        let n = distances.nrows();
        if n == 0 || distances.ncols() != n {
            return Err(AnalysisError::invalid(format!(
                "linkage needs a non-empty square distance matrix, got {:?}",
                distances.dim()
            )));
        }
        if distances.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(AnalysisError::invalid(
                "distance matrix must hold finite, non-negative values",
            ));
        }

        let squared = self.linkage == Linkage::Ward;
        let mut dist = if squared {
            distances.mapv(|d| d * d)
        } else {
            distances.clone()
        };
        let mut active = vec![true; n];
        let mut sizes = vec![1_usize; n];
        let mut ids: Vec<usize> = (0..n).collect();
        let mut merges = Vec::with_capacity(n.saturating_sub(1));

        for step in 0..n.saturating_sub(1) {
            let mut best = (0, 0, f64::INFINITY);
            for i in (0..n).filter(|&i| active[i]) {
                for j in ((i + 1)..n).filter(|&j| active[j]) {
                    if dist[[i, j]] < best.2 {
                        best = (i, j, dist[[i, j]]);
                    }
                }
            }
            let (i, j, d_ij) = best;
            merges.push(Merge {
                left: ids[i].min(ids[j]),
                right: ids[i].max(ids[j]),
                height: if squared { d_ij.max(0.0).sqrt() } else { d_ij },
                size: sizes[i] + sizes[j],
            });
            for k in (0..n).filter(|&k| active[k] && k != i && k != j) {
                let updated = lance_williams(self.linkage, dist[[i, k]], dist[[j, k]], d_ij, sizes[i], sizes[j], sizes[k]);
                dist[[i, k]] = updated;
                dist[[k, i]] = updated;
            }
            active[j] = false;
            sizes[i] += sizes[j];
            ids[i] = n + step;
        }

        let labels = self.cut_labels(&merges, n);
        Ok(Dendrogram {
            leaf_order: leaf_order(&merges, n),
            labels,
            merges,
        })
    }
}

/// Clusters variables under one metric and caches results by [`ClusterKey`].
#[derive(Clone)]
pub struct HierarchicalClusterer {
    metric: DistanceMetric,
    engine: Arc<dyn LinkageEngine>,
    results: BTreeMap<ClusterKey, ClusteringResult>,
}

impl fmt::Debug for HierarchicalClusterer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchicalClusterer")
            .field("metric", &self.metric)
            .field("cached", &self.results.keys().map(|k| k.to_string()).collect::<Vec<_>>())
            .finish()
    }
}

impl HierarchicalClusterer {
    pub fn new(metric: DistanceMetric, engine: Arc<dyn LinkageEngine>) -> Self {
        Self {
            metric,
            engine,
            results: BTreeMap::new(),
        }
    }

    pub fn metric(&self) -> &DistanceMetric {
        &self.metric
    }

    pub fn key(&self, input: ClusterInput) -> ClusterKey {
        ClusterKey {
            metric: self.metric.name().to_string(),
            input,
        }
    }

    /// Clusters the rows of `items` (one row per labelled item) unless a result for the same key
    /// is cached and `rerun` is false.
    pub fn cluster(
        &mut self,
        input: ClusterInput,
        labels: &[String],
        items: ArrayView2<f64>,
        rerun: bool,
    ) -> Result<&ClusteringResult> {
        let key = self.key(input);
        if !rerun && self.results.contains_key(&key) {
            debug!("Clustering cache hit for {}", key);
            return self.result(&key);
        }
        if labels.len() != items.nrows() {
            return Err(AnalysisError::invalid(format!(
                "{} labels supplied for {} items",
                labels.len(),
                items.nrows()
            )));
        }
        let start = Instant::now();
        let distances = self.metric.pairwise(items)?;
        let dendrogram = self.engine.linkage(&distances)?;
        info!(
            "Computed {} ({} items, {} clusters) in {:?}",
            key,
            labels.len(),
            dendrogram.n_clusters(),
            start.elapsed()
        );
        self.results.insert(
            key.clone(),
            ClusteringResult {
                items: labels.to_vec(),
                distances,
                dendrogram,
            },
        );
        self.result(&key)
    }

    fn result(&self, key: &ClusterKey) -> Result<&ClusteringResult> {
        self.results
            .get(key)
            .ok_or_else(|| AnalysisError::invalid(format!("no clustering result for {}", key)))
    }

    pub fn get(&self, input: ClusterInput) -> Option<&ClusteringResult> {
        self.results.get(&self.key(input))
    }

    pub fn results(&self) -> &BTreeMap<ClusterKey, ClusteringResult> {
        &self.results
    }

    /// Replaces the cache, for sessions restored from storage.
    pub fn restore(&mut self, results: BTreeMap<ClusterKey, ClusteringResult>) {
        self.results = results;
    }

    /// Drops every cached result computed from factor loadings.
    pub fn clear_loadings(&mut self) {
        self.results.retain(|key, _| key.input == ClusterInput::Data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn two_groups() -> Array2<f64> {
        array![[0.0, 0.0], [0.5, 0.5], [0.2, 0.3], [10.0, 10.0], [10.5, 10.5], [10.2, 10.3]]
    }

    #[test]
    fn every_linkage_separates_two_groups() {
        let distances = DistanceMetric::Euclidean.pairwise(two_groups().view()).unwrap();
        for linkage in [Linkage::Single, Linkage::Complete, Linkage::Average, Linkage::Ward] {
            let engine = AgglomerativeLinkage::new(linkage, ClusterCut::Clusters(2));
            let dendrogram = engine.linkage(&distances).unwrap();
            assert_eq!(dendrogram.merges.len(), 5);
            assert_eq!(dendrogram.labels, vec![0, 0, 0, 1, 1, 1], "{:?}", linkage);
            let mut order = dendrogram.leaf_order.clone();
            order.sort_unstable();
            assert_eq!(order, (0..6).collect::<Vec<_>>());
            let heights: Vec<f64> = dendrogram.merges.iter().map(|m| m.height).collect();
            assert!(heights.windows(2).all(|w| w[0] <= w[1] + 1e-12), "{:?}", heights);
            let last = dendrogram.merges.last().unwrap();
            assert_eq!(last.size, 6);
            assert_eq!(last.right, 9);
        }
    }

    #[test]
    fn height_cuts() {
        let distances = DistanceMetric::Euclidean.pairwise(two_groups().view()).unwrap();
        let all_apart = AgglomerativeLinkage::new(Linkage::Average, ClusterCut::Height(0.0))
            .linkage(&distances)
            .unwrap();
        assert_eq!(all_apart.n_clusters(), 6);
        let relative = AgglomerativeLinkage::new(Linkage::Average, ClusterCut::RelativeHeight(0.5))
            .linkage(&distances)
            .unwrap();
        assert_eq!(relative.n_clusters(), 2);
        let single = AgglomerativeLinkage::new(Linkage::Average, ClusterCut::RelativeHeight(1.0))
            .linkage(&distances)
            .unwrap();
        assert_eq!(single.n_clusters(), 1);
    }

    #[test]
    fn key_renders_like_result_names() {
        let key = ClusterKey {
            metric: "distcorr".to_string(),
            input: ClusterInput::Loadings(4),
        };
        assert_eq!(key.to_string(), "clustering_metric-distcorr_input-EFA4");
        let key = ClusterKey {
            metric: "euclidean".to_string(),
            input: ClusterInput::Data,
        };
        assert_eq!(key.to_string(), "clustering_metric-euclidean_input-data");
    }

    #[test]
    fn cached_results_are_reused_until_rerun() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let metric = DistanceMetric::custom("counting", move |a, b| {
            counter.fetch_add(1, Ordering::SeqCst);
            DistanceMetric::Euclidean.distance(a, b)
        });
        let mut clusterer = HierarchicalClusterer::new(metric, Arc::new(AgglomerativeLinkage::default()));
        let labels: Vec<String> = (0..6).map(|i| format!("v{}", i)).collect();
        let data = two_groups();

        clusterer.cluster(ClusterInput::Data, &labels, data.view(), false).unwrap();
        let after_first = calls.load(Ordering::SeqCst);
        assert_eq!(after_first, 15);
        clusterer.cluster(ClusterInput::Data, &labels, data.view(), false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), after_first);
        clusterer.cluster(ClusterInput::Data, &labels, data.view(), true).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2 * after_first);

        let result = clusterer.get(ClusterInput::Data).unwrap();
        assert_eq!(result.assignments()["v0"], result.assignments()["v1"]);
        assert!(clusterer.get(ClusterInput::Loadings(2)).is_none());
    }

    #[test]
    fn invalid_custom_distances_are_rejected() {
        let metric = DistanceMetric::custom("negative", |_, _| -1.0);
        assert!(metric.pairwise(two_groups().view()).is_err());
    }

    #[test]
    fn single_item_has_no_merges() {
        let dendrogram = AgglomerativeLinkage::default().linkage(&array![[0.0]]).unwrap();
        assert!(dendrogram.merges.is_empty());
        assert_eq!(dendrogram.labels, vec![0]);
        assert_eq!(dendrogram.leaf_order, vec![0]);
    }
}
