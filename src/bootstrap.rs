//! Bootstrap resampling of a whole analysis.
//!
//! Every repetition resamples the observations, runs the factor (and optionally the clustering)
//! phase on a fresh session and persists the outcome as its own record. Workers share nothing
//! mutable: a repetition that fails leaves no record behind, and [`reduce_records`] reads back
//! whatever completed.

use crate::clustering::{ClusterKey, ClusteringResult};
use crate::config::{derive_seed, AnalysisConfig, BootstrapConfig};
use crate::dataset::{Dataset, DatasetPair};
use crate::error::{AnalysisError, Result};
use crate::model_selection::Criterion;
use crate::persistence::{decode, encode, new_identifier, record_name, RecordStore};
use crate::session::{AnalysisEngines, AnalysisSession, FactorResults};
use log::{debug, info, warn};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;

/// A unit of independent work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs batches of independent tasks to completion.
pub trait TaskQueue: Send + Sync {
    /// Blocks until every task has finished. A panicking task is reported and does not affect
    /// the others.
    fn execute(&self, tasks: Vec<Task>);

    fn workers(&self) -> usize;
}

fn run_isolated(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        warn!("Worker task panicked: {}", message);
    }
}

/// A dedicated rayon pool.
pub struct RayonTaskQueue {
    pool: ThreadPool,
}

impl RayonTaskQueue {
    pub fn new(num_workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("bootstrap-worker-{}", i))
            .build()
            .map_err(|e| AnalysisError::invalid(format!("cannot start worker pool: {}", e)))?;
        Ok(Self { pool })
    }
}

impl TaskQueue for RayonTaskQueue {
    fn execute(&self, tasks: Vec<Task>) {
        self.pool.scope(|scope| {
            for task in tasks {
                scope.spawn(move |_| run_isolated(task));
            }
        });
    }

    fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Runs tasks one after another on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialTaskQueue;

impl TaskQueue for SequentialTaskQueue {
    fn execute(&self, tasks: Vec<Task>) {
        tasks.into_iter().for_each(run_isolated);
    }

    fn workers(&self) -> usize {
        1
    }
}

/// One worker per CPU the system reports.
pub fn available_workers() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    match sys.cpus().len() {
        0 => rayon::current_num_threads(),
        n => n,
    }
}

/// Persisted outcome of one bootstrap repetition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapRun {
    pub id: String,
    pub repetition: u64,
    pub seed: u64,
    /// The resampled imputed dataset.
    pub data: Dataset,
    pub factor: FactorResults,
    pub clustering: BTreeMap<ClusterKey, ClusteringResult>,
}

impl BootstrapRun {
    pub fn summary(&self) -> BootstrapSummary {
        let counts = self.factor.metric_counts();
        let loadings = self
            .factor
            .chosen_counts()
            .into_iter()
            .filter_map(|c| self.factor.tree.get(c).map(|s| (c, s.loadings.clone())))
            .collect();
        let clusters = self
            .clustering
            .iter()
            .map(|(key, result)| (key.clone(), result.dendrogram.labels.clone()))
            .collect();
        BootstrapSummary {
            id: self.id.clone(),
            counts,
            variables: self.data.variables().to_vec(),
            loadings,
            clusters,
        }
    }
}

/// The per-repetition quantities aggregated across a bootstrap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub id: String,
    /// Chosen factor count per criterion.
    pub counts: BTreeMap<Criterion, usize>,
    pub variables: Vec<String>,
    /// Loadings at each chosen factor count.
    pub loadings: BTreeMap<usize, Array2<f64>>,
    /// Flat cluster label per variable, for every clustering of the repetition.
    pub clusters: BTreeMap<ClusterKey, Vec<usize>>,
}

/// Drives bootstrap repetitions of one dataset.
///
/// Clones share the repetition counter, so repetitions numbered by any of them never repeat.
#[derive(Clone)]
pub struct ResampleController {
    data: Arc<DatasetPair>,
    analysis: AnalysisConfig,
    engines: AnalysisEngines,
    config: BootstrapConfig,
    queue: Arc<dyn TaskQueue>,
    seed: u64,
    next_repetition: Arc<AtomicU64>,
}

impl ResampleController {
    /// Runs repetitions on a dedicated rayon pool sized by [`BootstrapConfig::num_workers`].
    pub fn new(data: DatasetPair, analysis: AnalysisConfig, engines: AnalysisEngines, config: BootstrapConfig) -> Result<Self> {
        Self::with_shared_data(Arc::new(data), analysis, engines, config)
    }

    /// Runs repetitions on `queue`; `num_workers` is ignored.
    pub fn with_task_queue(
        data: DatasetPair,
        analysis: AnalysisConfig,
        engines: AnalysisEngines,
        config: BootstrapConfig,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self::assemble(Arc::new(data), analysis, engines, config, queue)
    }

    pub(crate) fn with_shared_data(
        data: Arc<DatasetPair>,
        analysis: AnalysisConfig,
        engines: AnalysisEngines,
        config: BootstrapConfig,
    ) -> Result<Self> {
        let workers = config.num_workers.unwrap_or_else(available_workers);
        let queue: Arc<dyn TaskQueue> = Arc::new(RayonTaskQueue::new(workers)?);
        Ok(Self::assemble(data, analysis, engines, config, queue))
    }

    fn assemble(
        data: Arc<DatasetPair>,
        analysis: AnalysisConfig,
        engines: AnalysisEngines,
        config: BootstrapConfig,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
        debug!("Bootstrap controller with {} worker(s)", queue.workers());
        Self {
            data,
            analysis,
            engines,
            config,
            queue,
            seed,
            next_repetition: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    pub fn workers(&self) -> usize {
        self.queue.workers()
    }

    /// Runs repetition `repetition` in memory. Its randomness depends only on the controller seed
    /// and the repetition number.
    pub fn run_one(&self, repetition: u64) -> Result<BootstrapRun> {
        let seed = derive_seed(self.seed, repetition);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let resampled = self.data.imputed.resample(&mut rng)?;

        // cross-validation needs the cleaned table, which is not resampled
        let pair = DatasetPair::imputed_only(resampled.clone())?;
        let analysis = self.analysis.clone().with_seed(derive_seed(seed, 1));
        let mut session = AnalysisSession::new(pair, analysis, self.engines.clone());
        session.run_factor_analysis(false)?;
        if self.config.run_clustering {
            session.run_cluster_analysis(false)?;
        }
        Ok(BootstrapRun {
            id: session.id().map_or_else(new_identifier, str::to_string),
            repetition,
            seed,
            data: resampled,
            factor: session.factor_results().clone(),
            clustering: session.clusterer().results().clone(),
        })
    }

    /// Writes `run` as its own record and returns the record name.
    pub fn persist(&self, store: &dyn RecordStore, run: &BootstrapRun) -> Result<String> {
        let name = record_name(&self.config.record_prefix, &run.id);
        store.write_record(&name, &encode(run)?)?;
        Ok(name)
    }

    /// Runs `reps` repetitions on the task queue and blocks until all of them finished.
    /// Numbering continues from the previous call, so every call draws new resamples.
    /// Failed repetitions are logged and leave no record. Returns the number persisted.
    pub fn run_many(&self, reps: usize, store: Arc<dyn RecordStore>) -> usize {
        let start = Instant::now();
        let first = self.next_repetition.fetch_add(reps as u64, Ordering::SeqCst);
        let persisted = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (first..first + reps as u64)
            .map(|repetition| {
                let controller = self.clone();
                let store = store.clone();
                let persisted = persisted.clone();
                Box::new(move || {
                    let outcome = controller
                        .run_one(repetition)
                        .and_then(|run| controller.persist(store.as_ref(), &run));
                    match outcome {
                        Ok(name) => {
                            debug!("Repetition {} stored as {}", repetition, name);
                            persisted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => warn!("Bootstrap repetition {} failed: {}", repetition, e),
                    }
                }) as Task
            })
            .collect();
        self.queue.execute(tasks);

        let persisted = persisted.load(Ordering::SeqCst);
        info!(
            "Bootstrap finished in {:?}: {} of {} repetition(s) persisted on {} worker(s)",
            start.elapsed(),
            persisted,
            reps,
            self.queue.workers()
        );
        persisted
    }

    /// Summaries of every record under this controller's prefix.
    pub fn reduce(&self, store: &dyn RecordStore) -> Result<Vec<BootstrapSummary>> {
        reduce_records(store, &self.config.record_prefix)
    }
}

/// Loads every `prefix` record of `store` in parallel, sorted by identifier.
pub fn reduce_records(store: &dyn RecordStore, prefix: &str) -> Result<Vec<BootstrapSummary>> {
    let start = Instant::now();
    let names = store.list_records(prefix)?;
    let mut summaries = names
        .par_iter()
        .map(|name| {
            let run: BootstrapRun = decode(&store.read_record(name)?)?;
            Ok(run.summary())
        })
        .collect::<Result<Vec<_>>>()?;
    summaries.sort_by(|a, b| a.id.cmp(&b.id));
    info!("Reduced {} bootstrap record(s) in {:?}", summaries.len(), start.elapsed());
    Ok(summaries)
}
