//! Error taxonomy shared by every analysis phase.

use std::io;
use thiserror::Error;

/// Main error type for factor-hierarchy analyses.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The data failed a sampling-adequacy or sphericity precondition.
    /// Fatal to the factor-analysis phase only.
    #[error("Data is not adequate for factor analysis: {statistic} = {measured:.4} (required {threshold})")]
    Adequacy {
        statistic: String,
        measured: f64,
        threshold: String,
    },

    /// The factor-extraction routine failed for a given number of factors.
    #[error("Factor extraction failed for {n_factors} factor(s): {reason}")]
    Extraction { n_factors: usize, reason: String },

    /// A model-order criterion needs a dataset variant that was not provided.
    #[error("Criterion {criterion} requires the {input} dataset, which is not available")]
    MissingInput { criterion: String, input: String },

    /// Shape or argument violations.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dense decomposition failures reported by the linear-algebra backend.
    #[error("Linear algebra error: {0}")]
    Linalg(String),

    /// A record could not be stored or retrieved.
    #[error("Persistence error for record {record}: {reason}")]
    Persistence { record: String, reason: String },

    /// Serialization of a record failed.
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl AnalysisError {
    pub fn extraction(n_factors: usize, reason: impl Into<String>) -> Self {
        Self::Extraction {
            n_factors,
            reason: reason.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// True for errors that only disqualify a single criterion and leave the phase running.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::MissingInput { .. })
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
