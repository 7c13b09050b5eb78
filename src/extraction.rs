//! Single-count factor extraction.
//!
//! The [`FactorExtractor`] trait is the seam to the factor-fitting routine: everything above it
//! (model-order selection, the factor tree, bootstrap runs) only needs loadings, scores and an
//! opaque raw output per factor count. [`PrincipalAxisExtractor`] is the shipped implementation.

use crate::config::ExtractionConfig;
use crate::dataset::Dataset;
use crate::error::{AnalysisError, Result};
use crate::linalg_backends::{
    eigh_descending, symmetric_inverse, symmetric_log_det, BackendSVD, LinAlgBackend, NdarrayLinAlgBackend,
    SVDOutput,
};
use crate::stats::{correlation_matrix, pearson, standardize_columns};
use log::{debug, trace, warn};
use ndarray::{s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Communalities are kept inside this interval while iterating (Heywood cases are clamped).
const COMMUNALITY_BOUNDS: (f64, f64) = (0.005, 0.995);
const VARIMAX_MAX_ITERATIONS: usize = 500;
const VARIMAX_TOLERANCE: f64 = 1e-8;

/// Engine-specific diagnostics kept next to every loading matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawFactorOutput {
    /// Regression-method score weights `R^-1 L`. Shape: (n_variables, n_factors)
    pub weights: Array2<f64>,
    /// `1 - communality` per variable.
    pub uniquenesses: Array1<f64>,
    /// Eigenvalues of the final reduced correlation matrix, descending.
    pub eigenvalues: Array1<f64>,
    pub iterations: usize,
    pub converged: bool,
    /// Maximum-likelihood discrepancy between the observed and model-implied correlation matrices.
    pub discrepancy: f64,
    /// Bartlett-corrected likelihood-ratio statistic of the fitted model.
    pub chi_square: f64,
    /// Degrees of freedom of the fitted model. May be zero or negative for saturated models.
    pub dof: f64,
    pub n_obs: usize,
}

impl RawFactorOutput {
    /// Bayesian information criterion in the chi-square form `chi2 - df ln(n)`.
    pub fn bic(&self) -> f64 {
        self.chi_square - self.dof * (self.n_obs as f64).ln()
    }

    /// Sample-size adjusted BIC, `chi2 - df ln((n + 2) / 24)`.
    pub fn sabic(&self) -> f64 {
        self.chi_square - self.dof * ((self.n_obs as f64 + 2.0) / 24.0).ln()
    }
}

/// Loadings and diagnostics fitted from a correlation matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactorFit {
    /// Shape: (n_variables, n_factors)
    pub loadings: Array2<f64>,
    pub raw: RawFactorOutput,
}

/// A fitted factor solution for one factor count on one dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactorSolution {
    pub n_factors: usize,
    /// Shape: (n_variables, n_factors)
    pub loadings: Array2<f64>,
    /// Shape: (n_observations, n_factors)
    pub scores: Array2<f64>,
    pub raw: RawFactorOutput,
}

impl FactorSolution {
    pub fn n_variables(&self) -> usize {
        self.loadings.nrows()
    }

    /// Sum of squared loadings per variable.
    pub fn communalities(&self) -> Array1<f64> {
        self.loadings.map_axis(Axis(1), |row| row.dot(&row))
    }

    /// Sum of squared loadings per factor.
    pub fn explained_variance(&self) -> Array1<f64> {
        self.loadings.map_axis(Axis(0), |column| column.dot(&column))
    }

    /// Scores of `data` under this solution's weights, after standardizing its columns.
    pub fn score(&self, data: &Dataset) -> Result<Array2<f64>> {
        if data.n_variables() != self.n_variables() {
            return Err(AnalysisError::invalid(format!(
                "solution has {} variables but the dataset has {}",
                self.n_variables(),
                data.n_variables()
            )));
        }
        let (z, _, _) = standardize_columns(data.values().view())?;
        Ok(z.dot(&self.raw.weights))
    }

    /// Largest absolute difference between the stored scores and a fresh scoring of `data`.
    pub fn verify(&self, data: &Dataset) -> Result<f64> {
        let rescored = self.score(data)?;
        if rescored.dim() != self.scores.dim() {
            return Err(AnalysisError::invalid(format!(
                "stored scores have shape {:?}, rescored data has shape {:?}",
                self.scores.dim(),
                rescored.dim()
            )));
        }
        Ok((&rescored - &self.scores)
            .iter()
            .fold(0.0_f64, |acc, d| acc.max(d.abs())))
    }

    /// Scores reconstructed from the listed variables only, with the squared correlation of each
    /// reconstructed factor against the full-data scores.
    pub fn subset_scores(&self, data: &Dataset, variables: &[usize]) -> Result<SubsetScores> {
        if variables.is_empty() {
            return Err(AnalysisError::invalid("subset scores need at least one variable"));
        }
        let subset = data.select_variables(variables)?;
        let (z, _, _) = standardize_columns(subset.values().view())?;
        let weights = self.raw.weights.select(Axis(0), variables);
        let scores = z.dot(&weights);
        let r_squared = Array1::from_shape_fn(self.n_factors, |f| {
            pearson(scores.column(f), self.scores.column(f)).powi(2)
        });
        Ok(SubsetScores { scores, r_squared })
    }
}

/// Factor scores estimated from a subset of variables.
#[derive(Clone, Debug, PartialEq)]
pub struct SubsetScores {
    /// Shape: (n_observations, n_factors)
    pub scores: Array2<f64>,
    /// Squared correlation with the full-data scores, per factor.
    pub r_squared: Array1<f64>,
}

/// Fits a factor model with a given number of factors.
///
/// Implementations must be deterministic for a fixed input and factor count.
pub trait FactorExtractor: Send + Sync {
    /// Fits `n_factors` factors to a correlation matrix estimated from `n_obs` observations.
    fn fit_correlation(&self, corr: &Array2<f64>, n_obs: usize, n_factors: usize) -> Result<FactorFit>;

    /// Fits `n_factors` factors to a complete dataset and scores its observations.
    fn fit(&self, data: &Dataset, n_factors: usize) -> Result<FactorSolution> {
        if data.has_missing() {
            return Err(AnalysisError::invalid(
                "factor extraction needs a dataset without missing values",
            ));
        }
        let (z, _, _) = standardize_columns(data.values().view())?;
        let corr = correlation_matrix(data.values().view())?;
        let FactorFit { loadings, raw } = self.fit_correlation(&corr, data.n_observations(), n_factors)?;
        let scores = z.dot(&raw.weights);
        Ok(FactorSolution {
            n_factors,
            loadings,
            scores,
            raw,
        })
    }
}

/// Squared multiple correlation of every variable with all the others: `1 - 1 / (R^-1)_ii`.
pub fn squared_multiple_correlations<B: LinAlgBackend + ?Sized>(
    backend: &B,
    corr: &Array2<f64>,
) -> Result<Array1<f64>> {
    let inverse = symmetric_inverse(backend, corr)?;
    Ok(inverse
        .diag()
        .mapv(|d| if d > 0.0 { 1.0 - 1.0 / d } else { 0.0 }))
}

/// Degrees of freedom of a `k`-factor model on `p` variables.
pub fn model_dof(n_variables: usize, n_factors: usize) -> f64 {
    let p = n_variables as f64;
    let k = n_factors as f64;
    ((p - k).powi(2) - (p + k)) / 2.0
}

/// Iterated principal-axis factoring with optional Kaiser-normalized varimax rotation.
#[derive(Clone)]
pub struct PrincipalAxisExtractor {
    pub config: ExtractionConfig,
    backend: Arc<dyn LinAlgBackend>,
}

impl Default for PrincipalAxisExtractor {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}

impl std::fmt::Debug for PrincipalAxisExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalAxisExtractor")
            .field("config", &self.config)
            .finish()
    }
}

impl PrincipalAxisExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self::with_backend(config, Arc::new(NdarrayLinAlgBackend))
    }

    pub fn with_backend(config: ExtractionConfig, backend: Arc<dyn LinAlgBackend>) -> Self {
        Self { config, backend }
    }

    /// Unrotated principal-axis loadings. Returns (loadings, reduced eigenvalues, iterations, converged).
    fn principal_axes(
        &self,
        corr: &Array2<f64>,
        n_factors: usize,
    ) -> Result<(Array2<f64>, Array1<f64>, usize, bool)> {
        let (lo, hi) = COMMUNALITY_BOUNDS;
        let mut communalities = squared_multiple_correlations(self.backend.as_ref(), corr)?.mapv(|h| h.clamp(lo, hi));
        let mut reduced = corr.clone();
        let mut iterations = 0;
        let mut converged = false;

        loop {
            reduced.diag_mut().assign(&communalities);
            let eig = eigh_descending(self.backend.as_ref(), &reduced)?;
            let roots = eig
                .eigenvalues
                .slice(s![..n_factors])
                .mapv(|l| l.max(0.0).sqrt());
            let loadings = &eig.eigenvectors.slice(s![.., ..n_factors]) * &roots;
            iterations += 1;

            let updated = loadings.map_axis(Axis(1), |row| row.dot(&row).clamp(lo, hi));
            let change = (&updated - &communalities)
                .iter()
                .fold(0.0_f64, |acc, d| acc.max(d.abs()));
            trace!("principal axes k={} iteration {}: max communality change {:.3e}", n_factors, iterations, change);
            communalities = updated;

            if change < self.config.tolerance {
                converged = true;
            }
            if converged || iterations >= self.config.max_iterations {
                return Ok((loadings, eig.eigenvalues, iterations, converged));
            }
        }
    }

    /// Kaiser-normalized varimax rotation, iterated through the SVD of the gradient.
    fn varimax(&self, loadings: &Array2<f64>) -> Result<Array2<f64>> {
        let (p, k) = loadings.dim();
        let norms = loadings.map_axis(Axis(1), |row| row.dot(&row).sqrt());
        let safe_norms = norms.mapv(|h| if h > 0.0 { h } else { 1.0 });
        let normalized = loadings / &safe_norms.view().insert_axis(Axis(1));

        let mut rotation = Array2::<f64>::eye(k);
        let mut criterion = 0.0;
        for _ in 0..VARIMAX_MAX_ITERATIONS {
            let rotated = normalized.dot(&rotation);
            let column_ss = rotated.map_axis(Axis(0), |column| column.dot(&column)) / p as f64;
            let target = rotated.mapv(|x| x.powi(3)) - &rotated * &column_ss;
            let gradient = normalized.t().dot(&target);
            let SVDOutput { u, s, vt } = self.backend.svd(&gradient, true, true)?;
            let u = u.ok_or_else(|| AnalysisError::Linalg("varimax SVD did not return U".to_string()))?;
            let vt = vt.ok_or_else(|| AnalysisError::Linalg("varimax SVD did not return V^T".to_string()))?;
            rotation = u.dot(&vt);
            let updated = s.sum();
            if updated < criterion * (1.0 + VARIMAX_TOLERANCE) {
                break;
            }
            criterion = updated;
        }
        Ok(normalized.dot(&rotation) * &norms.view().insert_axis(Axis(1)))
    }

    /// Fit statistics of the model `L L' + diag(1 - h)` against `corr`.
    fn fit_statistics(
        &self,
        corr: &Array2<f64>,
        loadings: &Array2<f64>,
        n_obs: usize,
    ) -> Result<(Array1<f64>, f64, f64, f64)> {
        let (p, k) = loadings.dim();
        let uniquenesses = loadings.map_axis(Axis(1), |row| (1.0 - row.dot(&row)).max(COMMUNALITY_BOUNDS.0));
        let mut implied = loadings.dot(&loadings.t());
        for (j, u) in uniquenesses.iter().enumerate() {
            implied[[j, j]] += u;
        }
        let implied_inverse = symmetric_inverse(self.backend.as_ref(), &implied)?;
        let trace: f64 = (0..p).map(|i| implied_inverse.row(i).dot(&corr.column(i))).sum();
        let discrepancy = (symmetric_log_det(self.backend.as_ref(), &implied)?
            - symmetric_log_det(self.backend.as_ref(), corr)?
            + trace
            - p as f64)
            .max(0.0);
        let multiplier = n_obs as f64 - 1.0 - (2.0 * p as f64 + 5.0) / 6.0 - 2.0 * k as f64 / 3.0;
        Ok((uniquenesses, discrepancy, multiplier * discrepancy, model_dof(p, k)))
    }
}

impl FactorExtractor for PrincipalAxisExtractor {
    fn fit_correlation(&self, corr: &Array2<f64>, n_obs: usize, n_factors: usize) -> Result<FactorFit> {
        let p = corr.nrows();
        if corr.ncols() != p {
            return Err(AnalysisError::invalid(format!(
                "correlation matrix must be square, got {:?}",
                corr.dim()
            )));
        }
        if n_factors == 0 || n_factors > p {
            return Err(AnalysisError::invalid(format!(
                "cannot extract {} factors from {} variables",
                n_factors, p
            )));
        }
        if n_obs < 2 {
            return Err(AnalysisError::invalid(format!(
                "factor extraction needs at least 2 observations, got {}",
                n_obs
            )));
        }

        let (unrotated, eigenvalues, iterations, converged) = self.principal_axes(corr, n_factors)?;
        if !converged {
            if self.config.require_convergence {
                return Err(AnalysisError::extraction(
                    n_factors,
                    format!("communalities did not converge within {} iterations", iterations),
                ));
            }
            warn!(
                "Principal-axis extraction of {} factor(s) did not converge within {} iterations",
                n_factors, iterations
            );
        }

        let rotated = if self.config.rotate && n_factors > 1 {
            self.varimax(&unrotated)?
        } else {
            unrotated
        };

        // descending explained variance, each column summing positive
        let variance = rotated.map_axis(Axis(0), |column| column.dot(&column));
        let mut order: Vec<usize> = (0..n_factors).collect();
        order.sort_by(|&a, &b| variance[b].partial_cmp(&variance[a]).unwrap_or(std::cmp::Ordering::Equal));
        let mut loadings = rotated.select(Axis(1), &order);
        for mut column in loadings.axis_iter_mut(Axis(1)) {
            if column.sum() < 0.0 {
                column.mapv_inplace(|x| -x);
            }
        }
        if loadings.iter().any(|v| !v.is_finite()) {
            return Err(AnalysisError::extraction(n_factors, "loadings contain non-finite values"));
        }

        let weights = symmetric_inverse(self.backend.as_ref(), corr)?.dot(&loadings);
        let (uniquenesses, discrepancy, chi_square, dof) = self.fit_statistics(corr, &loadings, n_obs)?;
        debug!(
            "Extracted {} factor(s): {} iterations, F = {:.4}, chi2 = {:.2}, df = {}",
            n_factors, iterations, discrepancy, chi_square, dof
        );

        Ok(FactorFit {
            loadings,
            raw: RawFactorOutput {
                weights,
                uniquenesses,
                eigenvalues,
                iterations,
                converged,
                discrepancy,
                chi_square,
                dof,
                n_obs,
            },
        })
    }
}
