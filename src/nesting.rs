//! How well each factor of a lower-order solution is reconstructed by a higher-order solution.

use crate::error::{AnalysisError, Result};
use crate::extraction::FactorSolution;
use crate::factor_tree::FactorTree;
use crate::linalg_backends::{least_squares, LinAlgBackend};
use log::{debug, info};
use ndarray::{concatenate, Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Nesting of the `low`-factor solution inside the `high`-factor solution, `low < high`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NestingResult {
    pub low: usize,
    pub high: usize,
    /// Per low-order factor: R² of its loading column regressed on the high-order loadings.
    pub scores: Array1<f64>,
    pub threshold: f64,
    /// Mean score among factors above `threshold`, 0 when none is.
    pub explained_score: f64,
    /// Number of factors above `threshold`, divided by `low`.
    pub sum_explained: f64,
}

impl NestingResult {
    /// Recomputes both aggregates for another threshold.
    pub fn aggregates(&self, threshold: f64) -> (f64, f64) {
        aggregate(self.scores.view(), threshold)
    }

    /// Number of low-order factors scoring at least `threshold`.
    pub fn count_at_least(&self, threshold: f64) -> usize {
        self.scores.iter().filter(|&&s| s >= threshold).count()
    }
}

fn aggregate(scores: ArrayView1<f64>, threshold: f64) -> (f64, f64) {
    let explained: Vec<f64> = scores.iter().copied().filter(|&s| s > threshold).collect();
    let explained_score = if explained.is_empty() {
        0.0
    } else {
        explained.iter().sum::<f64>() / explained.len() as f64
    };
    let sum_explained = if scores.is_empty() {
        0.0
    } else {
        explained.len() as f64 / scores.len() as f64
    };
    (explained_score, sum_explained)
}

/// `max_c x max_c` views of the nesting aggregates, indexed `[low - 1, high - 1]`.
/// Entries outside `low < high` are `NaN`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NestingMatrices {
    pub explained_score: Array2<f64>,
    pub sum_explained: Array2<f64>,
}

/// Arranges nesting results into matrices, recomputing the aggregates at `threshold`.
pub fn nesting_matrix(results: &BTreeMap<(usize, usize), NestingResult>, max_c: usize, threshold: f64) -> NestingMatrices {
    let mut explained_score = Array2::from_elem((max_c, max_c), f64::NAN);
    let mut sum_explained = Array2::from_elem((max_c, max_c), f64::NAN);
    for (&(low, high), result) in results {
        if low == 0 || low >= high || high > max_c {
            continue;
        }
        let (e, s) = result.aggregates(threshold);
        explained_score[[low - 1, high - 1]] = e;
        sum_explained[[low - 1, high - 1]] = s;
    }
    NestingMatrices {
        explained_score,
        sum_explained,
    }
}

/// Compares every pair of factor counts of a tree.
#[derive(Clone)]
pub struct NestingQuantifier {
    backend: Arc<dyn LinAlgBackend>,
    pub threshold: f64,
}

impl NestingQuantifier {
    pub fn new(backend: Arc<dyn LinAlgBackend>, threshold: f64) -> Self {
        Self { backend, threshold }
    }

    /// Regresses each low-order loading column on an intercept plus the high-order loadings.
    pub fn compare(&self, low: &FactorSolution, high: &FactorSolution) -> Result<NestingResult> {
        if low.n_factors >= high.n_factors {
            return Err(AnalysisError::invalid(format!(
                "nesting compares a lower order with a higher one, got ({}, {})",
                low.n_factors, high.n_factors
            )));
        }
        let p = low.n_variables();
        if high.n_variables() != p {
            return Err(AnalysisError::invalid(format!(
                "solutions have {} and {} variables",
                p,
                high.n_variables()
            )));
        }
        let intercept = Array2::<f64>::ones((p, 1));
        let design = concatenate(Axis(1), &[intercept.view(), high.loadings.view()])
            .map_err(|e| AnalysisError::Linalg(format!("cannot assemble nesting design: {}", e)))?;

        let mut scores = Array1::<f64>::zeros(low.n_factors);
        for (j, target) in low.loadings.axis_iter(Axis(1)).enumerate() {
            let beta = least_squares(self.backend.as_ref(), &design, target)?;
            let fitted = design.dot(&beta);
            let mean = target.mean().unwrap_or(0.0);
            let total: f64 = target.iter().map(|y| (y - mean).powi(2)).sum();
            let residual: f64 = target.iter().zip(fitted.iter()).map(|(y, f)| (y - f).powi(2)).sum();
            scores[j] = if total > 0.0 {
                (1.0 - residual / total).clamp(0.0, 1.0)
            } else {
                0.0
            };
        }
        let (explained_score, sum_explained) = aggregate(scores.view(), self.threshold);
        Ok(NestingResult {
            low: low.n_factors,
            high: high.n_factors,
            scores,
            threshold: self.threshold,
            explained_score,
            sum_explained,
        })
    }

    /// All `low < high` pairs of the tree.
    pub fn quantify(&self, tree: &FactorTree) -> Result<BTreeMap<(usize, usize), NestingResult>> {
        let mut results = BTreeMap::new();
        self.quantify_missing(tree, &mut results)?;
        Ok(results)
    }

    /// Adds the pairs of `tree` that `results` does not hold yet. Returns how many were added.
    pub fn quantify_missing(
        &self,
        tree: &FactorTree,
        results: &mut BTreeMap<(usize, usize), NestingResult>,
    ) -> Result<usize> {
        let start = Instant::now();
        let mut fresh = Vec::new();
        for (high, high_solution) in tree.iter() {
            for (low, low_solution) in tree.iter().take_while(|(c, _)| *c < high) {
                if results.contains_key(&(low, high)) {
                    continue;
                }
                fresh.push(self.compare(low_solution, high_solution)?);
            }
        }
        let added = fresh.len();
        for result in fresh {
            results.insert((result.low, result.high), result);
        }
        if added > 0 {
            info!("Quantified nesting for {} factor-count pair(s) in {:?}", added, start.elapsed());
        } else {
            debug!("Nesting results already cover the factor tree");
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::RawFactorOutput;
    use crate::linalg_backends::NdarrayLinAlgBackend;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn solution(loadings: Array2<f64>) -> FactorSolution {
        let (p, k) = loadings.dim();
        FactorSolution {
            n_factors: k,
            scores: Array2::zeros((1, k)),
            raw: RawFactorOutput {
                weights: Array2::zeros((p, k)),
                uniquenesses: Array1::zeros(p),
                eigenvalues: Array1::zeros(p),
                iterations: 1,
                converged: true,
                discrepancy: 0.0,
                chi_square: 0.0,
                dof: 0.0,
                n_obs: 1,
            },
            loadings,
        }
    }

    fn quantifier() -> NestingQuantifier {
        NestingQuantifier::new(Arc::new(NdarrayLinAlgBackend), 0.5)
    }

    #[test]
    fn a_factor_kept_in_the_higher_solution_scores_one() {
        let high = solution(array![[0.8, 0.0], [0.7, 0.1], [0.0, 0.9], [0.1, 0.6], [0.5, 0.5]]);
        let low = solution(high.loadings.column(0).to_owned().insert_axis(Axis(1)));
        let result = quantifier().compare(&low, &high).unwrap();
        assert_abs_diff_eq!(result.scores[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.explained_score, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.sum_explained, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn no_qualifying_factor_gives_zero_aggregates() {
        let (e, s) = aggregate(array![0.1, 0.2, f64::NAN].view(), 0.5);
        assert_eq!(e, 0.0);
        assert_eq!(s, 0.0);
        let (e, s) = aggregate(array![0.9, 0.7, 0.2, 0.1].view(), 0.5);
        assert_abs_diff_eq!(e, 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(s, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn pairs_must_be_ordered() {
        let a = solution(array![[0.8], [0.7], [0.1]]);
        let b = solution(array![[0.8, 0.1], [0.7, 0.0], [0.1, 0.9]]);
        assert!(quantifier().compare(&b, &a).is_err());
        assert!(quantifier().compare(&a, &a).is_err());
    }

    #[test]
    fn matrix_has_nan_outside_the_upper_triangle() {
        let a = solution(array![[0.8], [0.7], [0.1], [0.2]]);
        let b = solution(array![[0.8, 0.1], [0.7, 0.0], [0.1, 0.9], [0.0, 0.8]]);
        let mut results = BTreeMap::new();
        results.insert((1, 2), quantifier().compare(&a, &b).unwrap());
        let m = nesting_matrix(&results, 2, 0.5);
        assert!(m.explained_score[[0, 1]].is_finite());
        assert!(m.explained_score[[0, 0]].is_nan());
        assert!(m.explained_score[[1, 0]].is_nan());
        assert!(m.sum_explained[[1, 1]].is_nan());
    }
}
