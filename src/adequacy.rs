//! Sampling adequacy (Kaiser-Meyer-Olkin) and sphericity (Bartlett) tests gating factor analysis.

use crate::config::AdequacyThresholds;
use crate::error::{AnalysisError, Result};
use crate::linalg_backends::{symmetric_inverse, symmetric_log_det, BackendEigh};
use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Outcome of the adequacy gate, kept with the results of a factor analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdequacyReport {
    /// Overall Kaiser-Meyer-Olkin measure of sampling adequacy.
    pub kmo: f64,
    pub bartlett_chi_square: f64,
    pub bartlett_df: f64,
    pub bartlett_p: f64,
    pub adequate: bool,
}

impl AdequacyReport {
    /// Fails with [`AnalysisError::Adequacy`] naming the first violated precondition.
    pub fn ensure(&self, thresholds: &AdequacyThresholds) -> Result<()> {
        if !(self.kmo >= thresholds.min_kmo) {
            return Err(AnalysisError::Adequacy {
                statistic: "KMO".to_string(),
                measured: self.kmo,
                threshold: format!(">= {}", thresholds.min_kmo),
            });
        }
        if !(self.bartlett_p < thresholds.max_bartlett_p) {
            return Err(AnalysisError::Adequacy {
                statistic: "Bartlett sphericity p-value".to_string(),
                measured: self.bartlett_p,
                threshold: format!("< {}", thresholds.max_bartlett_p),
            });
        }
        Ok(())
    }
}

/// Runs both tests on a correlation matrix estimated from `n_obs` observations.
pub fn assess<B: BackendEigh + ?Sized>(
    backend: &B,
    corr: &Array2<f64>,
    n_obs: usize,
    thresholds: &AdequacyThresholds,
) -> Result<AdequacyReport> {
    let kmo = kmo(backend, corr)?;
    let (bartlett_chi_square, bartlett_df, bartlett_p) = bartlett_sphericity(backend, corr, n_obs)?;
    let adequate = kmo >= thresholds.min_kmo && bartlett_p < thresholds.max_bartlett_p;
    info!(
        "Adequacy: KMO = {:.3}, Bartlett chi2 = {:.2} (df = {}), p = {:.3e}; adequate = {}",
        kmo, bartlett_chi_square, bartlett_df, bartlett_p, adequate
    );
    Ok(AdequacyReport {
        kmo,
        bartlett_chi_square,
        bartlett_df,
        bartlett_p,
        adequate,
    })
}

/// Overall KMO: squared correlations relative to squared correlations plus squared partial
/// correlations, summed over distinct variable pairs.
pub fn kmo<B: BackendEigh + ?Sized>(backend: &B, corr: &Array2<f64>) -> Result<f64> {
    let p = corr.nrows();
    if p < 2 {
        return Err(AnalysisError::invalid("KMO needs at least 2 variables"));
    }
    let inverse = symmetric_inverse(backend, corr)?;
    let mut sum_r2 = 0.0;
    let mut sum_partial2 = 0.0;
    for i in 0..p {
        for j in 0..p {
            if i == j {
                continue;
            }
            let denom = (inverse[[i, i]] * inverse[[j, j]]).sqrt();
            let partial = if denom > 0.0 { -inverse[[i, j]] / denom } else { 0.0 };
            sum_r2 += corr[[i, j]].powi(2);
            sum_partial2 += partial.powi(2);
        }
    }
    let total = sum_r2 + sum_partial2;
    debug!("KMO sums: r^2 = {:.4}, partial^2 = {:.4}", sum_r2, sum_partial2);
    Ok(if total > 0.0 { sum_r2 / total } else { 0.0 })
}

/// Bartlett's test that the correlation matrix is an identity. Returns (chi-square, df, p-value).
pub fn bartlett_sphericity<B: BackendEigh + ?Sized>(
    backend: &B,
    corr: &Array2<f64>,
    n_obs: usize,
) -> Result<(f64, f64, f64)> {
    let p = corr.nrows() as f64;
    if n_obs < 2 {
        return Err(AnalysisError::invalid("Bartlett's test needs at least 2 observations"));
    }
    let log_det = symmetric_log_det(backend, corr)?;
    let statistic = -((n_obs as f64 - 1.0) - (2.0 * p + 5.0) / 6.0) * log_det;
    let df = p * (p - 1.0) / 2.0;
    let null = ChiSquared::new(df)
        .map_err(|e| AnalysisError::invalid(format!("Bartlett's test with {} degrees of freedom: {}", df, e)))?;
    Ok((statistic, df, null.sf(statistic.max(0.0))))
}
