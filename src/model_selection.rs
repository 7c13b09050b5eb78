//! Model-order selection: how many latent factors a dataset supports under each criterion.

use crate::adequacy::{assess, AdequacyReport};
use crate::config::{derive_seed, AdequacyThresholds};
use crate::dataset::{Dataset, DatasetPair, DatasetVariant};
use crate::error::{AnalysisError, Result};
use crate::extraction::{model_dof, squared_multiple_correlations, FactorExtractor};
use crate::linalg_backends::{eigh_descending, symmetric_inverse, symmetric_log_det, LinAlgBackend};
use crate::stats::{correlation_matrix, pairwise_correlation_matrix};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A model-order selection criterion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Criterion {
    /// Minimum BIC over the scanned factor counts.
    InformationCriterion,
    /// Leading eigenvalues above those of simulated uncorrelated data.
    ParallelAnalysis,
    /// Minimum sample-size adjusted BIC over the scanned factor counts.
    StabilityAdjustedIC,
    /// Minimum held-out negative log-likelihood on the non-imputed data.
    CrossValidated,
}

impl Criterion {
    pub const ALL: [Criterion; 4] = [
        Criterion::InformationCriterion,
        Criterion::ParallelAnalysis,
        Criterion::StabilityAdjustedIC,
        Criterion::CrossValidated,
    ];

    /// Short name used in logs and result keys.
    pub fn name(&self) -> &'static str {
        match self {
            Criterion::InformationCriterion => "BIC",
            Criterion::ParallelAnalysis => "PA",
            Criterion::StabilityAdjustedIC => "SABIC",
            Criterion::CrossValidated => "CV",
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The count chosen by one criterion, with the score curve it minimized when it has one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CriterionSelection {
    pub n_factors: usize,
    pub curve: Option<BTreeMap<usize, f64>>,
}

impl CriterionSelection {
    /// Picks the argmin of a curve. Ties go to the smaller count.
    fn minimizing(curve: BTreeMap<usize, f64>) -> Option<Self> {
        let n_factors = curve
            .iter()
            .filter(|(_, v)| v.is_finite())
            .fold(None::<(usize, f64)>, |best, (&k, &v)| match best {
                Some((_, bv)) if bv <= v => best,
                _ => Some((k, v)),
            })?
            .0;
        Some(Self {
            n_factors,
            curve: Some(curve),
        })
    }
}

/// Everything [`FactorModelSelector::select`] learned about a dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectionOutcome {
    pub adequacy: AdequacyReport,
    pub selections: BTreeMap<Criterion, CriterionSelection>,
    /// Criteria skipped because of a soft failure or a failed cross-validation, with the reported reason.
    pub skipped: BTreeMap<Criterion, String>,
}

impl SelectionOutcome {
    /// Largest count chosen by any criterion.
    pub fn max_chosen(&self) -> Option<usize> {
        self.selections.values().map(|s| s.n_factors).max()
    }

    /// Chosen count per criterion.
    pub fn counts(&self) -> BTreeMap<Criterion, usize> {
        self.selections.iter().map(|(&c, s)| (c, s.n_factors)).collect()
    }
}

/// Scan limits and resampling sizes used by the selector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectionLimits {
    pub max_scan_factors: usize,
    pub cv_max_factors: usize,
    pub cv_folds: usize,
    pub parallel_iterations: usize,
}

impl Default for SelectionLimits {
    fn default() -> Self {
        Self {
            max_scan_factors: 20,
            cv_max_factors: 50,
            cv_folds: 5,
            parallel_iterations: 100,
        }
    }
}

/// Model-order routines that are not a plain scan of the extractor's fit statistics.
pub trait ModelOrderRoutines: Send + Sync {
    /// Suggested number of factors for a complete dataset.
    fn parallel_analysis(&self, data: &Dataset, iterations: usize, seed: u64) -> Result<usize>;

    /// Held-out score of a `n_factors` model on data that may contain missing values. Lower is better.
    fn cross_validated_score(&self, data: &Dataset, n_factors: usize, folds: usize, seed: u64) -> Result<f64>;
}

/// Parallel analysis against simulated normal data and K-fold Gaussian likelihood cross-validation.
#[derive(Clone)]
pub struct SimulatedModelOrder {
    extractor: Arc<dyn FactorExtractor>,
    backend: Arc<dyn LinAlgBackend>,
}

impl SimulatedModelOrder {
    pub fn new(extractor: Arc<dyn FactorExtractor>, backend: Arc<dyn LinAlgBackend>) -> Self {
        Self { extractor, backend }
    }

    /// Eigenvalues of the correlation matrix with squared multiple correlations on the diagonal.
    fn reduced_eigenvalues(&self, corr: &Array2<f64>) -> Result<Array1<f64>> {
        let smc = squared_multiple_correlations(self.backend.as_ref(), corr)?;
        let mut reduced = corr.clone();
        reduced.diag_mut().assign(&smc);
        Ok(eigh_descending(self.backend.as_ref(), &reduced)?.eigenvalues)
    }

    /// Negative Gaussian log-likelihood of the observed coordinates of each row under `implied`.
    fn held_out_nll(&self, rows: &Array2<f64>, means: &Array1<f64>, sds: &Array1<f64>, implied: &Array2<f64>) -> Result<(f64, usize)> {
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let mut total = 0.0;
        let mut counted = 0;
        for row in rows.axis_iter(Axis(0)) {
            let observed: Vec<usize> = (0..row.len())
                .filter(|&j| row[j].is_finite() && sds[j] > 0.0)
                .collect();
            if observed.is_empty() {
                continue;
            }
            let z = Array1::from_iter(observed.iter().map(|&j| (row[j] - means[j]) / sds[j]));
            let marginal = implied.select(Axis(0), &observed).select(Axis(1), &observed);
            let inverse = symmetric_inverse(self.backend.as_ref(), &marginal)?;
            let log_det = symmetric_log_det(self.backend.as_ref(), &marginal)?;
            let quadratic = z.dot(&inverse.dot(&z));
            total += 0.5 * (observed.len() as f64 * ln_2pi + log_det + quadratic);
            counted += 1;
        }
        Ok((total, counted))
    }
}

fn nan_mean_sd(column: ndarray::ArrayView1<f64>) -> (f64, f64) {
    let present: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
    if present.len() < 2 {
        return (0.0, 0.0);
    }
    let n = present.len() as f64;
    let mean = present.iter().sum::<f64>() / n;
    let var = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

impl ModelOrderRoutines for SimulatedModelOrder {
    fn parallel_analysis(&self, data: &Dataset, iterations: usize, seed: u64) -> Result<usize> {
        let (n, p) = data.values().dim();
        let observed = self.reduced_eigenvalues(&correlation_matrix(data.values().view())?)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut simulated = Array1::<f64>::zeros(p);
        let iterations = iterations.max(1);
        for _ in 0..iterations {
            let noise = Array2::<f64>::random_using((n, p), StandardNormal, &mut rng);
            simulated += &self.reduced_eigenvalues(&correlation_matrix(noise.view())?)?;
        }
        simulated /= iterations as f64;

        let run = observed
            .iter()
            .zip(simulated.iter())
            .take_while(|(o, s)| o > s)
            .count();
        debug!(
            "Parallel analysis: leading {} observed eigenvalues exceed the simulated mean ({} iterations)",
            run, iterations
        );
        Ok(run.max(1))
    }

    fn cross_validated_score(&self, data: &Dataset, n_factors: usize, folds: usize, seed: u64) -> Result<f64> {
        let n = data.n_observations();
        if folds < 2 || n < 2 * folds {
            return Err(AnalysisError::invalid(format!(
                "cross-validation with {} folds needs at least {} observations, got {}",
                folds,
                2 * folds,
                n
            )));
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));

        let mut total = 0.0;
        let mut counted = 0;
        for fold in 0..folds {
            let (held, train): (Vec<usize>, Vec<usize>) =
                (0..n).partition(|&pos| pos % folds == fold);
            let held: Vec<usize> = held.into_iter().map(|pos| order[pos]).collect();
            let train: Vec<usize> = train.into_iter().map(|pos| order[pos]).collect();

            let train_rows = data.values().select(Axis(0), &train);
            let corr = pairwise_correlation_matrix(train_rows.view());
            let fit = self.extractor.fit_correlation(&corr, train.len(), n_factors)?;
            let mut implied = fit.loadings.dot(&fit.loadings.t());
            for (j, u) in fit.raw.uniquenesses.iter().enumerate() {
                implied[[j, j]] += u;
            }
            let stats: Vec<(f64, f64)> = train_rows.axis_iter(Axis(1)).map(nan_mean_sd).collect();
            let means = Array1::from_iter(stats.iter().map(|s| s.0));
            let sds = Array1::from_iter(stats.iter().map(|s| s.1));

            let (fold_total, fold_count) =
                self.held_out_nll(&data.values().select(Axis(0), &held), &means, &sds, &implied)?;
            total += fold_total;
            counted += fold_count;
        }
        if counted == 0 {
            return Err(AnalysisError::invalid("no held-out row has an observed value"));
        }
        Ok(total / counted as f64)
    }
}

/// Runs the adequacy gate and the requested model-order criteria on a dataset.
#[derive(Clone)]
pub struct FactorModelSelector {
    extractor: Arc<dyn FactorExtractor>,
    routines: Arc<dyn ModelOrderRoutines>,
    backend: Arc<dyn LinAlgBackend>,
    pub limits: SelectionLimits,
    pub thresholds: AdequacyThresholds,
}

impl FactorModelSelector {
    pub fn new(
        extractor: Arc<dyn FactorExtractor>,
        routines: Arc<dyn ModelOrderRoutines>,
        backend: Arc<dyn LinAlgBackend>,
    ) -> Self {
        Self {
            extractor,
            routines,
            backend,
            limits: SelectionLimits::default(),
            thresholds: AdequacyThresholds::default(),
        }
    }

    pub fn with_limits(mut self, limits: SelectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_thresholds(mut self, thresholds: AdequacyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Computes the adequacy report and fails if either precondition is violated.
    pub fn check_adequacy(&self, data: &Dataset) -> Result<AdequacyReport> {
        let corr = correlation_matrix(data.values().view())?;
        let report = assess(self.backend.as_ref(), &corr, data.n_observations(), &self.thresholds)?;
        report.ensure(&self.thresholds)?;
        Ok(report)
    }

    /// BIC and SABIC curves over every scanned count with positive degrees of freedom.
    pub fn information_curves(&self, data: &Dataset) -> Result<(BTreeMap<usize, f64>, BTreeMap<usize, f64>)> {
        let p = data.n_variables();
        let counts: Vec<usize> = (1..=self.limits.max_scan_factors.min(p))
            .filter(|&k| model_dof(p, k) > 0.0)
            .collect();
        if counts.is_empty() {
            return Err(AnalysisError::invalid(format!(
                "no factor count up to {} has positive degrees of freedom with {} variables",
                self.limits.max_scan_factors, p
            )));
        }
        let corr = correlation_matrix(data.values().view())?;
        let mut bic = BTreeMap::new();
        let mut sabic = BTreeMap::new();
        for k in counts {
            let fit = self.extractor.fit_correlation(&corr, data.n_observations(), k)?;
            bic.insert(k, fit.raw.bic());
            sabic.insert(k, fit.raw.sabic());
        }
        Ok((bic, sabic))
    }

    /// Held-out score curve of the cleaned dataset.
    pub fn cross_validation_curve(&self, cleaned: &Dataset, seed: u64) -> Result<BTreeMap<usize, f64>> {
        let max_k = self
            .limits
            .cv_max_factors
            .min(cleaned.n_variables().saturating_sub(1))
            .max(1);
        let mut curve = BTreeMap::new();
        for k in 1..=max_k {
            let score = self
                .routines
                .cross_validated_score(cleaned, k, self.limits.cv_folds, seed)?;
            curve.insert(k, score);
        }
        Ok(curve)
    }

    /// Selection under a single criterion. Cross-validation without a cleaned dataset fails with
    /// [`AnalysisError::MissingInput`].
    pub fn select_criterion(&self, data: &DatasetPair, criterion: Criterion, seed: u64) -> Result<CriterionSelection> {
        let no_minimum = || AnalysisError::invalid(format!("{} curve has no finite value", criterion));
        match criterion {
            Criterion::InformationCriterion => {
                let (bic, _) = self.information_curves(&data.imputed)?;
                CriterionSelection::minimizing(bic).ok_or_else(no_minimum)
            }
            Criterion::StabilityAdjustedIC => {
                let (_, sabic) = self.information_curves(&data.imputed)?;
                CriterionSelection::minimizing(sabic).ok_or_else(no_minimum)
            }
            Criterion::ParallelAnalysis => Ok(CriterionSelection {
                n_factors: self
                    .routines
                    .parallel_analysis(&data.imputed, self.limits.parallel_iterations, seed)?,
                curve: None,
            }),
            Criterion::CrossValidated => {
                let cleaned = data.cleaned.as_ref().ok_or_else(|| AnalysisError::MissingInput {
                    criterion: criterion.to_string(),
                    input: DatasetVariant::Cleaned.to_string(),
                })?;
                let curve = self.cross_validation_curve(cleaned, seed)?;
                CriterionSelection::minimizing(curve).ok_or_else(no_minimum)
            }
        }
    }

    /// Runs the adequacy gate, then every requested criterion.
    ///
    /// Soft failures (see [`AnalysisError::is_soft`]) and any failure of cross-validation skip
    /// their criterion and are reported in [`SelectionOutcome::skipped`]; any other failure aborts
    /// the selection.
    pub fn select(&self, data: &DatasetPair, criteria: &BTreeSet<Criterion>, seed: u64) -> Result<SelectionOutcome> {
        let start = Instant::now();
        let adequacy = self.check_adequacy(&data.imputed)?;

        let needs_scan = criteria.contains(&Criterion::InformationCriterion)
            || criteria.contains(&Criterion::StabilityAdjustedIC);
        let scan = if needs_scan {
            Some(self.information_curves(&data.imputed)?)
        } else {
            None
        };

        let mut selections = BTreeMap::new();
        let mut skipped = BTreeMap::new();
        for &criterion in criteria {
            let criterion_seed = derive_seed(seed, criterion as u64);
            let result = match (criterion, &scan) {
                (Criterion::InformationCriterion, Some((bic, _))) => CriterionSelection::minimizing(bic.clone())
                    .ok_or_else(|| AnalysisError::invalid("BIC curve has no finite value")),
                (Criterion::StabilityAdjustedIC, Some((_, sabic))) => CriterionSelection::minimizing(sabic.clone())
                    .ok_or_else(|| AnalysisError::invalid("SABIC curve has no finite value")),
                _ => self.select_criterion(data, criterion, criterion_seed),
            };
            match result {
                Ok(selection) => {
                    info!("Criterion {} selects {} factor(s)", criterion, selection.n_factors);
                    selections.insert(criterion, selection);
                }
                Err(e) if e.is_soft() || criterion == Criterion::CrossValidated => {
                    warn!("Skipping criterion {}: {}", criterion, e);
                    skipped.insert(criterion, e.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        info!("Model-order selection finished in {:?}", start.elapsed());
        Ok(SelectionOutcome {
            adequacy,
            selections,
            skipped,
        })
    }
}
