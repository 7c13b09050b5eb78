//! One dataset's analysis state and the orchestrated phases that fill it.
//!
//! An [`AnalysisSession`] owns a [`FactorAnalysis`] (model-order selection, factor tree, nesting and
//! entropy results) and a [`HierarchicalClusterer`]. The two phases run independently; each one
//! either commits all of its results or leaves the session as it was.

use crate::adequacy::AdequacyReport;
use crate::bootstrap::ResampleController;
use crate::clustering::{
    AgglomerativeLinkage, ClusterInput, ClusterKey, ClusteringResult, DistanceMetric, HierarchicalClusterer,
    LinkageEngine,
};
use crate::config::{derive_seed, AnalysisConfig, BootstrapConfig};
use crate::dataset::{DatasetPair, DatasetSource};
use crate::entropy::{EntropyProfile, EntropyProfiler};
use crate::error::{AnalysisError, Result};
use crate::extraction::{FactorExtractor, PrincipalAxisExtractor, SubsetScores};
use crate::factor_tree::{FactorTree, FactorTreeBuilder};
use crate::linalg_backends::{LinAlgBackend, NdarrayLinAlgBackend};
use crate::model_selection::{Criterion, CriterionSelection, FactorModelSelector, ModelOrderRoutines, SimulatedModelOrder};
use crate::nesting::{nesting_matrix, NestingMatrices, NestingQuantifier, NestingResult};
use crate::persistence::{decode, encode, new_identifier, record_name, RecordStore};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

/// Record prefix of saved sessions.
pub const SESSION_PREFIX: &str = "results";

const SELECTION_STREAM: u64 = 0;
const ENTROPY_STREAM: u64 = 1_000;

/// The pluggable routines a session runs. Engines are behaviour, not data: they are supplied again
/// when a saved session is loaded.
#[derive(Clone)]
pub struct AnalysisEngines {
    pub extractor: Arc<dyn FactorExtractor>,
    pub routines: Arc<dyn ModelOrderRoutines>,
    pub linkage: Arc<dyn LinkageEngine>,
    pub metric: DistanceMetric,
    pub backend: Arc<dyn LinAlgBackend>,
}

impl AnalysisEngines {
    /// The shipped engines, parameterized by `config`. Variables are clustered by distance correlation.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let backend: Arc<dyn LinAlgBackend> = Arc::new(NdarrayLinAlgBackend);
        let extractor: Arc<dyn FactorExtractor> = Arc::new(PrincipalAxisExtractor::with_backend(
            config.extraction.clone(),
            backend.clone(),
        ));
        Self {
            routines: Arc::new(SimulatedModelOrder::new(extractor.clone(), backend.clone())),
            extractor,
            linkage: Arc::new(AgglomerativeLinkage::new(config.linkage, config.cluster_cut)),
            metric: DistanceMetric::DistanceCorrelation,
            backend,
        }
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }
}

impl Default for AnalysisEngines {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

/// Everything the factor-analysis phase produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorResults {
    pub adequacy: Option<AdequacyReport>,
    pub selections: BTreeMap<Criterion, CriterionSelection>,
    /// Criteria skipped after a soft failure or a failed cross-validation, with the reason.
    pub skipped: BTreeMap<Criterion, String>,
    /// Largest factor count the tree is built for.
    pub max_factors: usize,
    pub tree: FactorTree,
    pub nesting: BTreeMap<(usize, usize), NestingResult>,
    pub entropy: BTreeMap<usize, EntropyProfile>,
}

impl FactorResults {
    /// Chosen factor count per criterion.
    pub fn metric_counts(&self) -> BTreeMap<Criterion, usize> {
        self.selections.iter().map(|(&c, s)| (c, s.n_factors)).collect()
    }

    /// Distinct counts chosen by any criterion, ascending.
    pub fn chosen_counts(&self) -> BTreeSet<usize> {
        self.selections.values().map(|s| s.n_factors).collect()
    }

    fn has_criterion(&self, criterion: &Criterion) -> bool {
        self.selections.contains_key(criterion) || self.skipped.contains_key(criterion)
    }
}

/// Model-order selection, factor tree, nesting and entropy for one dataset.
#[derive(Clone)]
pub struct FactorAnalysis {
    selector: FactorModelSelector,
    builder: FactorTreeBuilder,
    quantifier: NestingQuantifier,
    profiler: EntropyProfiler,
    margin: usize,
    results: FactorResults,
}

impl FactorAnalysis {
    pub fn new(engines: &AnalysisEngines, config: &AnalysisConfig) -> Self {
        Self {
            selector: FactorModelSelector::new(engines.extractor.clone(), engines.routines.clone(), engines.backend.clone())
                .with_limits(config.selection_limits())
                .with_thresholds(config.adequacy),
            builder: FactorTreeBuilder::new(engines.extractor.clone()),
            quantifier: NestingQuantifier::new(engines.backend.clone(), config.nesting_threshold),
            profiler: EntropyProfiler::new(config.entropy_permutations),
            margin: config.factor_margin,
            results: FactorResults::default(),
        }
    }

    pub fn results(&self) -> &FactorResults {
        &self.results
    }

    pub fn tree(&self) -> &FactorTree {
        &self.results.tree
    }

    pub fn metric_counts(&self) -> BTreeMap<Criterion, usize> {
        self.results.metric_counts()
    }

    /// Nesting aggregates as `max_factors x max_factors` matrices at `threshold`.
    pub fn nesting_matrix(&self, threshold: f64) -> NestingMatrices {
        nesting_matrix(&self.results.nesting, self.results.tree.coverage(), threshold)
    }

    /// Runs every step, reusing cached results unless `rerun` is set. Nothing is committed if a
    /// step fails.
    pub fn run(&mut self, data: &DatasetPair, criteria: &BTreeSet<Criterion>, rerun: bool, seed: u64) -> Result<()> {
        let start = Instant::now();
        let mut staged = if rerun {
            FactorResults {
                tree: self.results.tree.clone(),
                ..FactorResults::default()
            }
        } else {
            self.results.clone()
        };

        let missing: BTreeSet<Criterion> = criteria
            .iter()
            .filter(|c| !staged.has_criterion(c))
            .copied()
            .collect();
        if missing.is_empty() && staged.adequacy.is_some() {
            debug!("Model-order selection cached for {:?}", criteria);
        } else {
            let outcome = self
                .selector
                .select(data, &missing, derive_seed(seed, SELECTION_STREAM))?;
            staged.adequacy = Some(outcome.adequacy);
            staged.selections.extend(outcome.selections);
            staged.skipped.extend(outcome.skipped);
        }

        let chosen = criteria
            .iter()
            .filter_map(|c| staged.selections.get(c))
            .map(|s| s.n_factors)
            .max()
            .ok_or_else(|| AnalysisError::invalid("no model-order criterion produced a factor count"))?;
        let ceiling = (chosen + self.margin).min(data.imputed.n_variables());
        staged.max_factors = if rerun { ceiling } else { ceiling.max(staged.max_factors) };

        self.builder
            .extend(&mut staged.tree, &data.imputed, staged.max_factors, rerun)?;
        self.quantifier.quantify_missing(&staged.tree, &mut staged.nesting)?;
        for c in 2..=staged.tree.coverage() {
            if !staged.entropy.contains_key(&c) {
                let profile = self
                    .profiler
                    .profile(&staged.tree, c, derive_seed(seed, ENTROPY_STREAM + c as u64))?;
                staged.entropy.insert(c, profile);
            }
        }

        self.results = staged;
        info!(
            "Factor analysis finished in {:?}: counts {:?}, tree 1..={}",
            start.elapsed(),
            self.results.metric_counts(),
            self.results.tree.coverage()
        );
        Ok(())
    }
}

/// The state persisted by [`AnalysisSession::save`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub config: AnalysisConfig,
    pub seed: u64,
    pub data: DatasetPair,
    pub metric: String,
    pub factor: FactorResults,
    pub clustering: BTreeMap<ClusterKey, ClusteringResult>,
}

/// Analysis state of one dataset.
pub struct AnalysisSession {
    id: Option<String>,
    data: Arc<DatasetPair>,
    config: AnalysisConfig,
    seed: u64,
    engines: AnalysisEngines,
    factor: FactorAnalysis,
    clusterer: HierarchicalClusterer,
}

impl AnalysisSession {
    pub fn new(data: DatasetPair, config: AnalysisConfig, engines: AnalysisEngines) -> Self {
        Self::with_shared_data(Arc::new(data), config, engines)
    }

    pub(crate) fn with_shared_data(data: Arc<DatasetPair>, config: AnalysisConfig, engines: AnalysisEngines) -> Self {
        let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
        Self {
            id: None,
            factor: FactorAnalysis::new(&engines, &config),
            clusterer: HierarchicalClusterer::new(engines.metric.clone(), engines.linkage.clone()),
            data,
            config,
            seed,
            engines,
        }
    }

    /// Loads both variants of the named dataset from `source`.
    pub fn from_source<S: DatasetSource + ?Sized>(
        source: &S,
        name: &str,
        config: AnalysisConfig,
        engines: AnalysisEngines,
    ) -> Result<Self> {
        Ok(Self::new(DatasetPair::load(source, name)?, config, engines))
    }

    /// Identifier assigned by the first complete factor analysis or the first save.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn data(&self) -> &DatasetPair {
        &self.data
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn engines(&self) -> &AnalysisEngines {
        &self.engines
    }

    pub fn factor_analysis(&self) -> &FactorAnalysis {
        &self.factor
    }

    pub fn factor_results(&self) -> &FactorResults {
        self.factor.results()
    }

    pub fn clusterer(&self) -> &HierarchicalClusterer {
        &self.clusterer
    }

    /// Factor analysis under the configured criteria.
    pub fn run_factor_analysis(&mut self, rerun: bool) -> Result<()> {
        let criteria = self.config.criteria.clone();
        self.run_factor_analysis_with(&criteria, rerun)
    }

    /// Adequacy gate, model-order selection, tree build, nesting and entropy.
    pub fn run_factor_analysis_with(&mut self, criteria: &BTreeSet<Criterion>, rerun: bool) -> Result<()> {
        self.factor.run(&self.data, criteria, rerun, self.seed)?;
        if rerun {
            // loadings changed, so clusterings of them are stale
            self.clusterer.clear_loadings();
        }
        if self.id.is_none() {
            self.id = Some(new_identifier());
        }
        Ok(())
    }

    /// Clusters the variables of the raw data and of every chosen factor solution.
    pub fn run_cluster_analysis(&mut self, rerun: bool) -> Result<()> {
        let start = Instant::now();
        let variables = self.data.imputed.variables().to_vec();
        self.clusterer
            .cluster(ClusterInput::Data, &variables, self.data.imputed.values().t(), rerun)?;

        let results = self.factor.results();
        for c in results.chosen_counts() {
            match results.tree.get(c) {
                Some(solution) => {
                    self.clusterer
                        .cluster(ClusterInput::Loadings(c), &variables, solution.loadings.view(), rerun)?;
                }
                None => warn!("No {}-factor solution in the tree; skipping its clustering", c),
            }
        }
        info!("Cluster analysis finished in {:?}", start.elapsed());
        Ok(())
    }

    pub fn metric_counts(&self) -> BTreeMap<Criterion, usize> {
        self.factor.metric_counts()
    }

    pub fn nesting_matrix(&self, threshold: f64) -> NestingMatrices {
        self.factor.nesting_matrix(threshold)
    }

    /// Scores of the `n_factors` solution recomputed from a subset of the variables.
    pub fn subset_scores(&self, n_factors: usize, variables: &[usize]) -> Result<SubsetScores> {
        self.factor
            .tree()
            .solution(n_factors)?
            .subset_scores(&self.data.imputed, variables)
    }

    /// Largest absolute difference between the stored and recomputed scores of a solution.
    pub fn verify_factor_solution(&self, n_factors: usize) -> Result<f64> {
        self.factor.tree().solution(n_factors)?.verify(&self.data.imputed)
    }

    /// A resampling controller for this session's data, configuration and engines.
    pub fn resample_controller(&self, config: BootstrapConfig) -> Result<ResampleController> {
        ResampleController::with_shared_data(self.data.clone(), self.config.clone(), self.engines.clone(), config)
    }

    pub fn to_record(&mut self) -> SessionRecord {
        let id = self.id.get_or_insert_with(new_identifier).clone();
        SessionRecord {
            id,
            config: self.config.clone(),
            seed: self.seed,
            data: self.data.as_ref().clone(),
            metric: self.engines.metric.name().to_string(),
            factor: self.factor.results().clone(),
            clustering: self.clusterer.results().clone(),
        }
    }

    /// Writes the whole session under its identifier, assigning one on the first call.
    pub fn save(&mut self, store: &dyn RecordStore) -> Result<String> {
        let record = self.to_record();
        let name = record_name(SESSION_PREFIX, &record.id);
        store.write_record(&name, &encode(&record)?)?;
        info!("Saved session {}", name);
        Ok(record.id)
    }

    /// Restores a saved session. `engines` provides the routines used by later runs.
    pub fn load(store: &dyn RecordStore, id: &str, engines: AnalysisEngines) -> Result<Self> {
        let record: SessionRecord = decode(&store.read_record(&record_name(SESSION_PREFIX, id))?)?;
        Ok(Self::from_record(record, engines))
    }

    pub fn from_record(record: SessionRecord, engines: AnalysisEngines) -> Self {
        if record.metric != engines.metric.name() {
            warn!(
                "Session {} was clustered with metric {}, new clusterings will use {}",
                record.id,
                record.metric,
                engines.metric.name()
            );
        }
        let mut config = record.config;
        config.seed = Some(record.seed);
        let mut session = Self::new(record.data, config, engines);
        session.id = Some(record.id);
        session.factor.results = record.factor;
        session.clusterer.restore(record.clustering);
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, DatasetVariant};
    use crate::persistence::DirectoryStore;
    use crate::synthetic::{independent_noise, with_missing, LatentFactorDesign};
    use tempfile::tempdir;

    fn config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default().with_seed(42);
        config.parallel_iterations = 20;
        config.entropy_permutations = 10;
        config
    }

    fn session(seed: u64) -> AnalysisSession {
        let data = LatentFactorDesign::block_structure(3, 4, 0.8).generate(200, seed);
        let config = config();
        let engines = AnalysisEngines::from_config(&config).with_metric(DistanceMetric::Correlation);
        AnalysisSession::new(DatasetPair::imputed_only(data).unwrap(), config, engines)
    }

    struct MemorySource {
        data: Dataset,
    }

    impl DatasetSource for MemorySource {
        fn load_table(&self, name: &str, variant: DatasetVariant) -> Result<Dataset> {
            match variant {
                DatasetVariant::Imputed => Ok(self.data.clone()),
                DatasetVariant::Cleaned => Err(AnalysisError::invalid(format!("no cleaned table for {}", name))),
            }
        }
    }

    #[test]
    fn factor_analysis_fills_every_result() {
        let mut session = session(3);
        session.run_factor_analysis(false).unwrap();
        let results = session.factor_results();
        let counts = session.metric_counts();
        assert_eq!(counts.len(), 2);
        let chosen = counts.values().copied().max().unwrap();
        assert_eq!(results.max_factors, (chosen + 5).min(12));
        assert_eq!(results.tree.coverage(), results.max_factors);
        let c = results.max_factors;
        assert_eq!(results.nesting.len(), c * (c - 1) / 2);
        assert_eq!(results.entropy.len(), c - 1);
        assert!(results.entropy.keys().all(|&k| k >= 2));
        assert!(session.id().is_some());
    }

    #[test]
    fn clustering_covers_data_and_chosen_counts() {
        let mut session = session(4);
        session.run_cluster_analysis(false).unwrap();
        assert_eq!(session.clusterer().results().len(), 1);

        session.run_factor_analysis(false).unwrap();
        session.run_cluster_analysis(false).unwrap();
        let chosen = session.factor_results().chosen_counts();
        assert_eq!(session.clusterer().results().len(), 1 + chosen.len());
        for c in chosen {
            let result = session.clusterer().get(ClusterInput::Loadings(c)).unwrap();
            assert_eq!(result.items.len(), 12);
        }
    }

    #[test]
    fn forced_rerun_drops_stale_loading_clusterings() {
        let mut session = session(5);
        session.run_factor_analysis(false).unwrap();
        session.run_cluster_analysis(false).unwrap();
        let version = session.factor_results().tree.version();
        session.run_factor_analysis(true).unwrap();
        assert!(session.factor_results().tree.version() > version);
        assert_eq!(session.clusterer().results().len(), 1);
    }

    #[test]
    fn adequacy_failure_leaves_clustering_available() {
        let data = independent_noise(200, 10, 2);
        let config = config();
        let engines = AnalysisEngines::from_config(&config).with_metric(DistanceMetric::Euclidean);
        let mut session = AnalysisSession::new(DatasetPair::imputed_only(data).unwrap(), config, engines);
        let err = session.run_factor_analysis(false).unwrap_err();
        assert!(matches!(err, AnalysisError::Adequacy { .. }));
        assert!(session.factor_results().tree.is_empty());
        assert!(session.factor_results().adequacy.is_none());
        assert!(session.id().is_none());
        session.run_cluster_analysis(false).unwrap();
        assert!(session.clusterer().get(ClusterInput::Data).is_some());
    }

    #[test]
    fn missing_cleaned_data_skips_cross_validation_only() {
        let mut session = session(6);
        let criteria: BTreeSet<Criterion> = [Criterion::InformationCriterion, Criterion::CrossValidated]
            .into_iter()
            .collect();
        session.run_factor_analysis_with(&criteria, false).unwrap();
        let results = session.factor_results();
        assert!(results.selections.contains_key(&Criterion::InformationCriterion));
        assert!(results.skipped[&Criterion::CrossValidated].contains("cleaned"));
    }

    #[test]
    fn cross_validation_uses_the_cleaned_variant() {
        let imputed = LatentFactorDesign::block_structure(2, 4, 0.8).generate(200, 10);
        let cleaned = with_missing(&imputed, 0.05, 11);
        let mut config = config();
        config.cv_max_factors = 4;
        let engines = AnalysisEngines::from_config(&config);
        let mut session = AnalysisSession::new(DatasetPair::new(imputed, Some(cleaned)).unwrap(), config, engines);
        session
            .run_factor_analysis_with(&[Criterion::CrossValidated].into_iter().collect(), false)
            .unwrap();
        let selection = &session.factor_results().selections[&Criterion::CrossValidated];
        assert_eq!(selection.curve.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn save_reuses_the_identifier_and_load_restores_state() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        let mut session = session(7);
        session.run_factor_analysis(false).unwrap();
        session.run_cluster_analysis(false).unwrap();
        let first = session.save(&store).unwrap();
        let second = session.save(&store).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_records(SESSION_PREFIX).unwrap().len(), 1);

        let engines = AnalysisEngines::from_config(session.config()).with_metric(DistanceMetric::Correlation);
        let mut restored = AnalysisSession::load(&store, &first, engines).unwrap();
        assert_eq!(restored.id(), Some(first.as_str()));
        assert_eq!(restored.factor_results(), session.factor_results());
        assert_eq!(restored.clusterer().results(), session.clusterer().results());

        let version = restored.factor_results().tree.version();
        restored.run_factor_analysis(false).unwrap();
        assert_eq!(restored.factor_results().tree.version(), version);
        assert_eq!(restored.save(&store).unwrap(), first);
    }

    #[test]
    fn sessions_load_from_a_dataset_source() {
        let source = MemorySource {
            data: LatentFactorDesign::block_structure(2, 3, 0.7).generate(50, 1),
        };
        let session = AnalysisSession::from_source(&source, "survey", config(), AnalysisEngines::default()).unwrap();
        assert!(session.data().cleaned.is_none());
        assert_eq!(session.data().imputed.n_variables(), 6);
    }

    #[test]
    fn helpers_delegate_to_the_tree() {
        let mut session = session(8);
        session.run_factor_analysis(false).unwrap();
        assert!(session.verify_factor_solution(2).unwrap() < 1e-10);
        let subset = session.subset_scores(3, &[0, 1, 4, 5, 8, 9]).unwrap();
        assert_eq!(subset.r_squared.len(), 3);
        assert!(session.verify_factor_solution(99).is_err());
        let m = session.nesting_matrix(0.5);
        let c = session.factor_results().tree.coverage();
        assert_eq!(m.explained_score.dim(), (c, c));
    }
}
