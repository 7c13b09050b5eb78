//! Per-variable loading entropy and its permutation null distribution.

use crate::error::{AnalysisError, Result};
use crate::factor_tree::FactorTree;
use crate::stats::normalized_entropy;
use log::debug;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Observed and null loading entropies for one factor count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntropyProfile {
    pub n_factors: usize,
    /// One normalized entropy in `[0, 1]` per variable.
    pub observed: Array1<f64>,
    /// Pooled entropies of column-permuted loadings, `permutations x n_variables` values.
    pub null: Array1<f64>,
}

impl EntropyProfile {
    /// Fraction of the null sample at or below the observed entropy of `variable`.
    /// Small values mark variables specific to one factor.
    pub fn lower_tail(&self, variable: usize) -> Option<f64> {
        let observed = *self.observed.get(variable)?;
        if self.null.is_empty() {
            return None;
        }
        let below = self.null.iter().filter(|&&v| v <= observed).count();
        Some(below as f64 / self.null.len() as f64)
    }
}

fn row_entropies(loadings: ArrayView2<f64>) -> Array1<f64> {
    loadings.map_axis(Axis(1), normalized_entropy)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntropyProfiler {
    pub permutations: usize,
}

impl Default for EntropyProfiler {
    fn default() -> Self {
        Self { permutations: 50 }
    }
}

impl EntropyProfiler {
    pub fn new(permutations: usize) -> Self {
        Self { permutations }
    }

    /// Profile of the `n_factors`-level of `tree`. Needs `n_factors > 1`.
    pub fn profile(&self, tree: &FactorTree, n_factors: usize, seed: u64) -> Result<EntropyProfile> {
        if n_factors <= 1 {
            return Err(AnalysisError::invalid(format!(
                "loading entropy needs more than one factor, got {}",
                n_factors
            )));
        }
        let solution = tree.solution(n_factors)?;
        self.profile_loadings(&solution.loadings, seed)
    }

    /// Profile of an arbitrary loading matrix (variables x factors).
    pub fn profile_loadings(&self, loadings: &Array2<f64>, seed: u64) -> Result<EntropyProfile> {
        let (p, k) = loadings.dim();
        if k <= 1 || p == 0 {
            return Err(AnalysisError::invalid(format!(
                "loading entropy needs at least one variable and two factors, got shape {:?}",
                loadings.dim()
            )));
        }
        let observed = row_entropies(loadings.view());

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut null = Vec::with_capacity(self.permutations * p);
        let mut permuted = loadings.clone();
        let mut order: Vec<usize> = (0..p).collect();
        for _ in 0..self.permutations {
            for (f, mut column) in permuted.axis_iter_mut(Axis(1)).enumerate() {
                order.shuffle(&mut rng);
                for (i, &source) in order.iter().enumerate() {
                    column[i] = loadings[[source, f]];
                }
            }
            null.extend(row_entropies(permuted.view()).iter().copied());
        }
        debug!(
            "Loading entropy for {} factors: {} observed, {} null values",
            k,
            observed.len(),
            null.len()
        );
        Ok(EntropyProfile {
            n_factors: k,
            observed,
            null: Array1::from(null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn extremes_and_bounds() {
        let loadings = array![[0.9, 0.0, 0.0], [0.4, 0.4, 0.4], [0.5, -0.3, 0.1], [0.0, 0.0, 0.0]];
        let profile = EntropyProfiler::new(10).profile_loadings(&loadings, 1).unwrap();
        assert_abs_diff_eq!(profile.observed[0], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(profile.observed[1], 1.0, epsilon = 1e-12);
        assert!(profile.observed[2] > 0.0 && profile.observed[2] < 1.0);
        assert_eq!(profile.observed[3], 0.0);
        assert!(profile.null.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(profile.null.len(), 10 * 4);
    }

    #[test]
    fn permutations_are_seeded() {
        let loadings = array![[0.9, 0.1], [0.2, 0.7], [0.5, 0.5], [0.1, 0.0], [0.3, 0.8]];
        let profiler = EntropyProfiler::default();
        let a = profiler.profile_loadings(&loadings, 7).unwrap();
        let b = profiler.profile_loadings(&loadings, 7).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.null.len(), 50 * 5);
        assert!(a.lower_tail(0).unwrap() <= 1.0);
        assert!(a.lower_tail(9).is_none());
    }

    #[test]
    fn single_factor_levels_are_rejected() {
        let loadings = array![[0.9], [0.2]];
        assert!(matches!(
            EntropyProfiler::default().profile_loadings(&loadings, 0),
            Err(AnalysisError::InvalidInput(_))
        ));
        assert!(EntropyProfiler::default().profile(&FactorTree::new(), 1, 0).is_err());
    }
}
