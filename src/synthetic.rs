//! Seeded generators for datasets with known latent structure.

use crate::dataset::Dataset;
use ndarray::Array2;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A population factor model `x = L f + e` with standard-normal factors and unique variances
/// `1 - communality`, so every observed variable has unit variance.
#[derive(Clone, Debug)]
pub struct LatentFactorDesign {
    /// Shape: (n_variables, n_factors)
    pub loadings: Array2<f64>,
}

impl LatentFactorDesign {
    pub fn new(loadings: Array2<f64>) -> Self {
        Self { loadings }
    }

    /// Simple structure: `n_factors` disjoint blocks of `vars_per_factor` variables, each loading
    /// `loading` on its own factor only.
    pub fn block_structure(n_factors: usize, vars_per_factor: usize, loading: f64) -> Self {
        let n_variables = n_factors * vars_per_factor;
        let loadings = Array2::from_shape_fn((n_variables, n_factors), |(v, f)| {
            if v / vars_per_factor == f {
                loading
            } else {
                0.0
            }
        });
        Self { loadings }
    }

    pub fn n_variables(&self) -> usize {
        self.loadings.nrows()
    }

    pub fn n_factors(&self) -> usize {
        self.loadings.ncols()
    }

    /// Draws `n_obs` observations.
    pub fn generate(&self, n_obs: usize, seed: u64) -> Dataset {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let factors = Array2::<f64>::random_using((n_obs, self.n_factors()), StandardNormal, &mut rng);
        let noise = Array2::<f64>::random_using((n_obs, self.n_variables()), StandardNormal, &mut rng);
        let unique_sd = self
            .loadings
            .map_axis(ndarray::Axis(1), |row| (1.0 - row.dot(&row)).max(0.0).sqrt());
        let values = factors.dot(&self.loadings.t()) + noise * &unique_sd;
        Dataset::from_matrix(values)
    }
}

/// Mutually independent standard-normal variables.
pub fn independent_noise(n_obs: usize, n_variables: usize, seed: u64) -> Dataset {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Dataset::from_matrix(Array2::random_using((n_obs, n_variables), StandardNormal, &mut rng))
}

/// Copies `data` with each entry independently replaced by `NaN` with probability `fraction`.
pub fn with_missing(data: &Dataset, fraction: f64, seed: u64) -> Dataset {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    data.map_values(|v| if rng.gen::<f64>() < fraction { f64::NAN } else { v })
}
