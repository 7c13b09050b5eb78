// Configuration for the analysis phases and the resampling controller.

use crate::clustering::{ClusterCut, Linkage};
use crate::model_selection::{Criterion, SelectionLimits};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Thresholds of the adequacy gate that runs before any model-order selection.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdequacyThresholds {
    /// Minimum Kaiser-Meyer-Olkin measure of sampling adequacy.
    pub min_kmo: f64,
    /// The Bartlett sphericity test must reject at a p-value below this.
    pub max_bartlett_p: f64,
}

impl Default for AdequacyThresholds {
    fn default() -> Self {
        Self {
            min_kmo: 0.6,
            max_bartlett_p: 0.05,
        }
    }
}

/// Parameters of the default principal-axis extractor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Upper bound on communality-refinement iterations.
    pub max_iterations: usize,
    /// Convergence tolerance on the largest absolute communality change.
    pub tolerance: f64,
    /// Apply a Kaiser-normalized varimax rotation when more than one factor is extracted.
    pub rotate: bool,
    /// Treat a fit that exhausts `max_iterations` as an extraction failure instead of a warning.
    pub require_convergence: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-6,
            rotate: true,
            require_convergence: false,
        }
    }
}

/// Configuration of a single [`AnalysisSession`](crate::session::AnalysisSession).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Model-order criteria evaluated by `run_factor_analysis`.
    pub criteria: BTreeSet<Criterion>,
    /// Number of factors added on top of the largest chosen count when sizing the factor tree.
    pub factor_margin: usize,
    /// Largest factor count scanned by the information criteria.
    pub max_scan_factors: usize,
    /// Largest factor count scanned by cross-validation.
    pub cv_max_factors: usize,
    /// Number of row folds used by cross-validation.
    pub cv_folds: usize,
    /// Number of simulated datasets drawn by parallel analysis.
    pub parallel_iterations: usize,
    pub adequacy: AdequacyThresholds,
    /// Score above which a lower-order factor counts as explained by a higher-order solution.
    pub nesting_threshold: f64,
    /// Permutation repetitions used for the null loading-entropy sample.
    pub entropy_permutations: usize,
    pub linkage: Linkage,
    /// How dendrograms are cut into flat cluster labels.
    pub cluster_cut: ClusterCut,
    pub extraction: ExtractionConfig,
    /// Seed for every random draw made by a session. `None` draws fresh entropy.
    pub seed: Option<u64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            criteria: [Criterion::InformationCriterion, Criterion::ParallelAnalysis]
                .into_iter()
                .collect(),
            factor_margin: 5,
            max_scan_factors: 20,
            cv_max_factors: 50,
            cv_folds: 5,
            parallel_iterations: 100,
            adequacy: AdequacyThresholds::default(),
            nesting_threshold: 0.5,
            entropy_permutations: 50,
            linkage: Linkage::Average,
            cluster_cut: ClusterCut::RelativeHeight(0.7),
            extraction: ExtractionConfig::default(),
            seed: None,
        }
    }
}

impl AnalysisConfig {
    /// Replaces the criteria set.
    pub fn with_criteria<I: IntoIterator<Item = Criterion>>(mut self, criteria: I) -> Self {
        self.criteria = criteria.into_iter().collect();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn selection_limits(&self) -> SelectionLimits {
        SelectionLimits {
            max_scan_factors: self.max_scan_factors,
            cv_max_factors: self.cv_max_factors,
            cv_folds: self.cv_folds,
            parallel_iterations: self.parallel_iterations,
        }
    }
}

/// Configuration of the [`ResampleController`](crate::bootstrap::ResampleController).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Also run the clustering phase on every resample.
    pub run_clustering: bool,
    /// Worker pool size. `None` uses one worker per CPU reported by the system.
    pub num_workers: Option<usize>,
    /// Seed for the per-repetition seeds. `None` draws fresh entropy.
    pub seed: Option<u64>,
    /// Filename prefix of persisted bootstrap records.
    pub record_prefix: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            run_clustering: true,
            num_workers: None,
            seed: None,
            record_prefix: "bootstrap".to_string(),
        }
    }
}

/// Derives an independent seed for a numbered random stream from a base seed (SplitMix64 finalizer).
pub fn derive_seed(base: u64, stream: u64) -> u64 {
    let mut z = base
        .wrapping_add(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(stream.wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
