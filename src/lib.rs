// Hierarchical factor analysis

#![doc = include_str!("../README.md")]

pub mod adequacy;
pub mod bootstrap;
pub mod clustering;
pub mod config;
pub mod dataset;
pub mod entropy;
pub mod error;
pub mod extraction;
pub mod factor_tree;
pub mod linalg_backends;
pub mod model_selection;
pub mod nesting;
pub mod persistence;
pub mod session;
pub mod stats;
pub mod synthetic;

#[cfg(test)]
mod extraction_tests;

pub use bootstrap::{BootstrapRun, BootstrapSummary, ResampleController};
pub use clustering::{ClusterInput, ClusterKey, DistanceMetric, HierarchicalClusterer};
pub use config::{AnalysisConfig, BootstrapConfig};
pub use dataset::{Dataset, DatasetPair, DatasetSource, DatasetVariant};
pub use error::{AnalysisError, Result};
pub use extraction::{FactorExtractor, FactorSolution, PrincipalAxisExtractor};
pub use factor_tree::{FactorTree, FactorTreeBuilder};
pub use model_selection::{Criterion, FactorModelSelector};
pub use persistence::{DirectoryStore, RecordStore};
pub use session::{AnalysisEngines, AnalysisSession, FactorResults};
