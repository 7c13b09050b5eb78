// src/linalg_backends.rs

use crate::error::{AnalysisError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{Eigh as NdLinalgEigh, SVD as NdLinalgSVD, UPLO};

/// Eigenvalues at or below this are treated as zero when inverting or taking logarithms.
pub const EIGENVALUE_FLOOR: f64 = 1e-12;

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput {
    /// Eigenvalues, in the order returned by the backend.
    pub eigenvalues: Array1<f64>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<f64>,
}

/// Trait for symmetric eigendecomposition (LAPACK DSYEVD through ndarray-linalg by default).
pub trait BackendEigh {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput>;
}

/// Output of a Singular Value Decomposition.
#[derive(Debug)]
pub struct SVDOutput {
    pub u: Option<Array2<f64>>,
    pub s: Array1<f64>,
    pub vt: Option<Array2<f64>>,
}

/// Trait for Singular Value Decomposition.
pub trait BackendSVD {
    fn svd(&self, matrix: &Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput>;
}

/// Dense kernels needed by the analysis components.
pub trait LinAlgBackend: BackendEigh + BackendSVD + Send + Sync {}

impl<T: BackendEigh + BackendSVD + Send + Sync> LinAlgBackend for T {}

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn linalg_error<E: std::fmt::Display>(context: &str) -> impl Fn(E) -> AnalysisError + '_ {
    move |e| AnalysisError::Linalg(format!("{}: {}", context, e))
}

impl BackendEigh for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput> {
        if matrix.nrows() != matrix.ncols() {
            return Err(AnalysisError::Linalg(format!(
                "eigendecomposition needs a square matrix, got {:?}",
                matrix.dim()
            )));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(AnalysisError::Linalg(
                "matrix passed to eigendecomposition has non-finite entries".to_string(),
            ));
        }
        let (eigenvalues, eigenvectors) = matrix
            .eigh(UPLO::Upper)
            .map_err(linalg_error("symmetric eigendecomposition failed"))?;
        Ok(EighOutput {
            eigenvalues,
            eigenvectors,
        })
    }
}

impl BackendSVD for NdarrayLinAlgBackend {
    fn svd(&self, matrix: &Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput> {
        let (u, s, vt) = matrix
            .svd(compute_u, compute_v)
            .map_err(linalg_error("singular value decomposition failed"))?;
        Ok(SVDOutput { u, s, vt })
    }
}

/// Symmetric eigendecomposition with pairs sorted by descending eigenvalue.
pub fn eigh_descending<B: BackendEigh + ?Sized>(backend: &B, matrix: &Array2<f64>) -> Result<EighOutput> {
    let EighOutput {
        eigenvalues,
        eigenvectors,
    } = backend.eigh_upper(matrix)?;
    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eigenvalues[b]
            .partial_cmp(&eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(EighOutput {
        eigenvalues: eigenvalues.select(Axis(0), &order),
        eigenvectors: eigenvectors.select(Axis(1), &order),
    })
}

/// Inverse of a symmetric positive (semi-)definite matrix via its eigendecomposition.
/// Directions with eigenvalues below [`EIGENVALUE_FLOOR`] are dropped (pseudo-inverse).
pub fn symmetric_inverse<B: BackendEigh + ?Sized>(backend: &B, matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let eig = backend.eigh_upper(matrix)?;
    let inv_vals = eig
        .eigenvalues
        .mapv(|l| if l > EIGENVALUE_FLOOR { 1.0 / l } else { 0.0 });
    let scaled = &eig.eigenvectors * &inv_vals.view().insert_axis(Axis(0));
    Ok(scaled.dot(&eig.eigenvectors.t()))
}

/// Natural log-determinant of a symmetric positive-definite matrix.
pub fn symmetric_log_det<B: BackendEigh + ?Sized>(backend: &B, matrix: &Array2<f64>) -> Result<f64> {
    let eig = backend.eigh_upper(matrix)?;
    Ok(eig.eigenvalues.iter().map(|&l| l.max(EIGENVALUE_FLOOR).ln()).sum())
}

/// Minimum-norm least-squares solution of `design · beta = target` through the SVD pseudo-inverse.
/// Works for over- and under-determined systems alike.
pub fn least_squares<B: BackendSVD + ?Sized>(
    backend: &B,
    design: &Array2<f64>,
    target: ArrayView1<f64>,
) -> Result<Array1<f64>> {
    if design.nrows() != target.len() {
        return Err(AnalysisError::Linalg(format!(
            "least squares: design has {} rows but target has {} entries",
            design.nrows(),
            target.len()
        )));
    }
    let n_params = design.ncols();
    if design.nrows() == 0 || n_params == 0 {
        return Ok(Array1::zeros(n_params));
    }
    let SVDOutput { u, s, vt } = backend.svd(design, true, true)?;
    let u = u.ok_or_else(|| AnalysisError::Linalg("SVD did not return U".to_string()))?;
    let vt = vt.ok_or_else(|| AnalysisError::Linalg("SVD did not return V^T".to_string()))?;

    let s_max = s.iter().cloned().fold(0.0_f64, f64::max);
    let cutoff = s_max * (design.nrows().max(n_params) as f64) * f64::EPSILON;
    let mut beta = Array1::<f64>::zeros(n_params);
    for (i, &sigma) in s.iter().enumerate() {
        if sigma <= cutoff {
            break;
        }
        let coefficient = u.column(i).dot(&target) / sigma;
        beta.scaled_add(coefficient, &vt.row(i));
    }
    Ok(beta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn eigh_descending_orders_pairs() {
        let m = array![[2.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 1.0]];
        let out = eigh_descending(&NdarrayLinAlgBackend, &m).unwrap();
        assert_abs_diff_eq!(out.eigenvalues[0], 5.0, epsilon = 1e-10);
        assert_abs_diff_eq!(out.eigenvalues[2], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(out.eigenvectors[[1, 0]].abs(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn symmetric_inverse_and_log_det_agree_with_closed_form() {
        let m = array![[4.0, 1.0], [1.0, 3.0]];
        let inv = symmetric_inverse(&NdarrayLinAlgBackend, &m).unwrap();
        let identity = m.dot(&inv);
        assert_abs_diff_eq!(identity[[0, 0]], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(identity[[0, 1]], 0.0, epsilon = 1e-10);
        let log_det = symmetric_log_det(&NdarrayLinAlgBackend, &m).unwrap();
        assert_abs_diff_eq!(log_det, 11.0_f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn least_squares_recovers_exact_coefficients() {
        let design = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let target = array![1.0, 3.0, 5.0, 7.0];
        let beta = least_squares(&NdarrayLinAlgBackend, &design, target.view()).unwrap();
        assert_abs_diff_eq!(beta[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(beta[1], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn least_squares_handles_underdetermined_systems() {
        let design = array![[1.0, 1.0, 0.0], [0.0, 1.0, 1.0]];
        let target = array![2.0, 2.0];
        let beta = least_squares(&NdarrayLinAlgBackend, &design, target.view()).unwrap();
        let fitted = design.dot(&beta);
        assert_abs_diff_eq!(fitted[0], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fitted[1], 2.0, epsilon = 1e-9);
    }
}
