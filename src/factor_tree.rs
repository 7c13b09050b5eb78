//! The factor tree: one factor solution per count `1..=max_c`, built and extended incrementally.

use crate::dataset::Dataset;
use crate::error::{AnalysisError, Result};
use crate::extraction::{FactorExtractor, FactorSolution};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Solutions keyed by factor count.
///
/// Keys always form the contiguous range `1..=coverage()`. Solutions are shared through `Arc` so
/// extensions keep the previously computed entries as the very same objects. The version counter
/// changes on every committed modification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorTree {
    entries: BTreeMap<usize, Arc<FactorSolution>>,
    version: u64,
}

impl FactorTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest factor count present, 0 for an empty tree.
    pub fn coverage(&self) -> usize {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, n_factors: usize) -> Option<&Arc<FactorSolution>> {
        self.entries.get(&n_factors)
    }

    /// The solution for `n_factors`, or an `InvalidInput` error naming the missing count.
    pub fn solution(&self, n_factors: usize) -> Result<&Arc<FactorSolution>> {
        self.get(n_factors).ok_or_else(|| {
            AnalysisError::invalid(format!(
                "the factor tree covers 1..={} and has no {}-factor solution",
                self.coverage(),
                n_factors
            ))
        })
    }

    pub fn counts(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<FactorSolution>)> + '_ {
        self.entries.iter().map(|(&c, s)| (c, s))
    }

    /// Appends solutions for the counts directly above the current coverage.
    fn commit(&mut self, solutions: Vec<FactorSolution>) {
        if solutions.is_empty() {
            return;
        }
        let start = self.coverage() + 1;
        for (offset, solution) in solutions.into_iter().enumerate() {
            self.entries.insert(start + offset, Arc::new(solution));
        }
        self.version += 1;
    }

    /// Replaces every entry.
    fn replace(&mut self, solutions: Vec<FactorSolution>) {
        self.entries.clear();
        self.commit(solutions);
        if self.entries.is_empty() {
            self.version += 1;
        }
    }
}

/// What a call to [`FactorTreeBuilder::extend`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionReport {
    /// Counts whose solutions were extracted by this call.
    pub computed: Vec<usize>,
    /// Counts served from the existing tree.
    pub reused: Vec<usize>,
    /// Tree version after the call.
    pub version: u64,
}

/// Builds factor trees with an external extractor.
#[derive(Clone)]
pub struct FactorTreeBuilder {
    extractor: Arc<dyn FactorExtractor>,
}

impl FactorTreeBuilder {
    pub fn new(extractor: Arc<dyn FactorExtractor>) -> Self {
        Self { extractor }
    }

    pub fn extractor(&self) -> &Arc<dyn FactorExtractor> {
        &self.extractor
    }

    /// A fresh tree covering `1..=max_c`.
    pub fn build(&self, data: &Dataset, max_c: usize) -> Result<FactorTree> {
        let mut tree = FactorTree::new();
        self.extend(&mut tree, data, max_c, false)?;
        Ok(tree)
    }

    /// Makes `tree` cover at least `1..=max_c`.
    ///
    /// Without `force`, only counts above the current coverage are extracted and existing entries
    /// are kept as they are; a `max_c` at or below the coverage is a no-op. With `force`, the whole
    /// range `1..=max_c` is recomputed and replaces the tree. Nothing is committed unless every
    /// requested count was extracted successfully.
    pub fn extend(&self, tree: &mut FactorTree, data: &Dataset, max_c: usize, force: bool) -> Result<ExtensionReport> {
        let p = data.n_variables();
        if max_c == 0 || max_c > p {
            return Err(AnalysisError::invalid(format!(
                "factor tree range 1..={} is invalid for {} variables",
                max_c, p
            )));
        }
        let first = if force { 1 } else { tree.coverage() + 1 };
        let reused: Vec<usize> = if force { Vec::new() } else { tree.counts().collect() };
        if first > max_c {
            debug!("Factor tree already covers 1..={}; nothing to extract", tree.coverage());
            return Ok(ExtensionReport {
                computed: Vec::new(),
                reused,
                version: tree.version(),
            });
        }

        let start = Instant::now();
        let mut solutions = Vec::with_capacity(max_c + 1 - first);
        for c in first..=max_c {
            let count_start = Instant::now();
            let solution = self.extractor.fit(data, c)?;
            if solution.loadings.dim() != (p, c) {
                return Err(AnalysisError::extraction(
                    c,
                    format!("extractor returned loadings of shape {:?}", solution.loadings.dim()),
                ));
            }
            debug!("Extracted the {}-factor solution in {:?}", c, count_start.elapsed());
            solutions.push(solution);
        }

        let computed: Vec<usize> = (first..=max_c).collect();
        if force {
            tree.replace(solutions);
        } else {
            tree.commit(solutions);
        }
        info!(
            "Factor tree now covers 1..={} ({} extracted, {} reused) in {:?}",
            tree.coverage(),
            computed.len(),
            reused.len(),
            start.elapsed()
        );
        Ok(ExtensionReport {
            computed,
            reused,
            version: tree.version(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{FactorFit, PrincipalAxisExtractor};
    use crate::synthetic::LatentFactorDesign;
    use ndarray::Array2;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and fails for one chosen factor count.
    struct FlakyExtractor {
        inner: PrincipalAxisExtractor,
        fail_at: usize,
        calls: AtomicUsize,
    }

    impl FactorExtractor for FlakyExtractor {
        fn fit_correlation(&self, corr: &Array2<f64>, n_obs: usize, n_factors: usize) -> Result<FactorFit> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if n_factors == self.fail_at {
                return Err(AnalysisError::extraction(n_factors, "forced failure"));
            }
            self.inner.fit_correlation(corr, n_obs, n_factors)
        }
    }

    fn data() -> Dataset {
        LatentFactorDesign::block_structure(3, 4, 0.8).generate(200, 31)
    }

    #[test]
    fn extension_reuses_existing_entries() {
        let data = data();
        let builder = FactorTreeBuilder::new(Arc::new(PrincipalAxisExtractor::default()));
        let mut tree = builder.build(&data, 5).unwrap();
        let before: Vec<Arc<FactorSolution>> = tree.iter().map(|(_, s)| s.clone()).collect();
        let version = tree.version();

        let report = builder.extend(&mut tree, &data, 8, false).unwrap();
        assert_eq!(report.computed, vec![6, 7, 8]);
        assert_eq!(report.reused, vec![1, 2, 3, 4, 5]);
        assert_eq!(tree.coverage(), 8);
        assert!(tree.version() > version);
        for (c, old) in (1..=5).zip(before.iter()) {
            assert!(Arc::ptr_eq(old, tree.get(c).unwrap()));
        }
    }

    #[test]
    fn extension_within_coverage_is_a_no_op() {
        let data = data();
        let builder = FactorTreeBuilder::new(Arc::new(PrincipalAxisExtractor::default()));
        let mut tree = builder.build(&data, 4).unwrap();
        let version = tree.version();
        let report = builder.extend(&mut tree, &data, 3, false).unwrap();
        assert!(report.computed.is_empty());
        assert_eq!(tree.version(), version);
        assert_eq!(tree.coverage(), 4);
    }

    #[test]
    fn forced_extension_recomputes_everything() {
        let data = data();
        let builder = FactorTreeBuilder::new(Arc::new(PrincipalAxisExtractor::default()));
        let mut tree = builder.build(&data, 3).unwrap();
        let first = tree.get(1).unwrap().clone();
        let report = builder.extend(&mut tree, &data, 3, true).unwrap();
        assert_eq!(report.computed, vec![1, 2, 3]);
        assert!(!Arc::ptr_eq(&first, tree.get(1).unwrap()));
        assert_eq!(first.as_ref(), tree.get(1).unwrap().as_ref());
    }

    #[test]
    fn failed_extraction_leaves_the_tree_untouched() {
        let data = data();
        let extractor = Arc::new(FlakyExtractor {
            inner: PrincipalAxisExtractor::default(),
            fail_at: 5,
            calls: AtomicUsize::new(0),
        });
        let builder = FactorTreeBuilder::new(extractor.clone());
        let mut tree = builder.build(&data, 3).unwrap();
        let snapshot = tree.clone();

        let err = builder.extend(&mut tree, &data, 6, false).unwrap_err();
        assert!(matches!(err, AnalysisError::Extraction { n_factors: 5, .. }));
        assert_eq!(tree, snapshot);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn range_is_validated() {
        let data = data();
        let builder = FactorTreeBuilder::new(Arc::new(PrincipalAxisExtractor::default()));
        assert!(matches!(builder.build(&data, 0), Err(AnalysisError::InvalidInput(_))));
        assert!(matches!(builder.build(&data, 13), Err(AnalysisError::InvalidInput(_))));
    }
}
