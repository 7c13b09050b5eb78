//! Observation-by-variable tables and the external dataset source seam.
//!
//! Missing entries are encoded as `NaN`. The imputed variant must be complete; the cleaned variant
//! keeps its true missingness pattern and is only consulted by cross-validated model-order selection.

use crate::error::{AnalysisError, Result};
use log::{debug, warn};
use ndarray::{Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A real-valued table with labelled columns (variables) and unlabelled rows (observations).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    variables: Vec<String>,
    /// Shape: (n_observations, n_variables)
    values: Array2<f64>,
}

impl Dataset {
    /// Creates a dataset, checking that there is one label per column.
    pub fn new(variables: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if variables.len() != values.ncols() {
            return Err(AnalysisError::invalid(format!(
                "{} variable labels supplied for a table with {} columns",
                variables.len(),
                values.ncols()
            )));
        }
        Ok(Self { variables, values })
    }

    /// Creates a dataset whose variables are labelled `var_0`, `var_1`, ...
    pub fn from_matrix(values: Array2<f64>) -> Self {
        let variables = (0..values.ncols()).map(|j| format!("var_{}", j)).collect();
        Self { variables, values }
    }

    pub fn n_observations(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_variables(&self) -> usize {
        self.values.ncols()
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == name)
    }

    /// True if any entry is `NaN`.
    pub fn has_missing(&self) -> bool {
        self.values.iter().any(|v| v.is_nan())
    }

    /// Applies `f` to every entry, keeping the variable labels.
    pub fn map_values<F: FnMut(f64) -> f64>(&self, f: F) -> Dataset {
        Dataset {
            variables: self.variables.clone(),
            values: self.values.mapv(f),
        }
    }

    /// Draws a bootstrap resample: `n_observations` rows sampled with replacement.
    pub fn resample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Dataset> {
        let n = self.n_observations();
        if n == 0 {
            return Err(AnalysisError::invalid("cannot resample a dataset without observations"));
        }
        let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
        Ok(Dataset {
            variables: self.variables.clone(),
            values: self.values.select(Axis(0), &rows),
        })
    }

    /// Returns a dataset restricted to the given columns, in the given order.
    pub fn select_variables(&self, indices: &[usize]) -> Result<Dataset> {
        if let Some(&bad) = indices.iter().find(|&&j| j >= self.n_variables()) {
            return Err(AnalysisError::invalid(format!(
                "variable index {} out of range for {} variables",
                bad,
                self.n_variables()
            )));
        }
        Ok(Dataset {
            variables: indices.iter().map(|&j| self.variables[j].clone()).collect(),
            values: self.values.select(Axis(1), indices),
        })
    }
}

/// The two tracked forms of a source table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetVariant {
    /// Complete data used for model fitting.
    Imputed,
    /// Data with its true missingness pattern.
    Cleaned,
}

impl fmt::Display for DatasetVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetVariant::Imputed => write!(f, "imputed"),
            DatasetVariant::Cleaned => write!(f, "cleaned"),
        }
    }
}

/// Loads named tables from wherever they live. Implemented by the embedding application.
pub trait DatasetSource {
    fn load_table(&self, name: &str, variant: DatasetVariant) -> Result<Dataset>;
}

/// The imputed table plus the optional non-imputed table of the same variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetPair {
    pub imputed: Dataset,
    pub cleaned: Option<Dataset>,
}

impl DatasetPair {
    /// Pairs the two variants. The imputed table must be complete and, when present, the cleaned
    /// table must carry the same variables.
    pub fn new(imputed: Dataset, cleaned: Option<Dataset>) -> Result<Self> {
        if imputed.has_missing() {
            return Err(AnalysisError::invalid(
                "the imputed dataset contains missing values",
            ));
        }
        if let Some(ref c) = cleaned {
            if c.variables() != imputed.variables() {
                return Err(AnalysisError::invalid(
                    "the cleaned dataset does not have the same variables as the imputed dataset",
                ));
            }
        }
        Ok(Self { imputed, cleaned })
    }

    /// Loads both variants of `name`. A cleaned table that cannot be loaded is reported and dropped,
    /// since only cross-validation needs it.
    pub fn load<S: DatasetSource + ?Sized>(source: &S, name: &str) -> Result<Self> {
        let imputed = source.load_table(name, DatasetVariant::Imputed)?;
        let cleaned = match source.load_table(name, DatasetVariant::Cleaned) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("No {} variant for dataset '{}': {}", DatasetVariant::Cleaned, name, e);
                None
            }
        };
        debug!(
            "Loaded dataset '{}' ({} observations x {} variables)",
            name,
            imputed.n_observations(),
            imputed.n_variables()
        );
        Self::new(imputed, cleaned)
    }

    pub fn imputed_only(imputed: Dataset) -> Result<Self> {
        Self::new(imputed, None)
    }
}
