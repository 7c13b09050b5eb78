//! Numeric helpers shared across components: correlation matrices, standardization,
//! normalized entropy and distance correlation.

use crate::error::{AnalysisError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Column standard deviations at or below this are treated as constant columns.
const STD_FLOOR: f64 = 1e-12;

/// Centers each column and scales it to unit (population) standard deviation.
/// Constant columns become all zeros. Returns the standardized matrix with its means and scales.
pub fn standardize_columns(data: ArrayView2<f64>) -> Result<(Array2<f64>, Array1<f64>, Array1<f64>)> {
    if data.nrows() < 2 {
        return Err(AnalysisError::invalid(format!(
            "at least 2 observations are needed to standardize, got {}",
            data.nrows()
        )));
    }
    let means = data
        .mean_axis(Axis(0))
        .ok_or_else(|| AnalysisError::invalid("cannot compute column means of an empty table"))?;
    let mut z = &data - &means;
    let scales = z.map_axis(Axis(0), |column| column.std(0.0));
    for (mut column, &s) in z.axis_iter_mut(Axis(1)).zip(scales.iter()) {
        if s > STD_FLOOR {
            column.mapv_inplace(|x| x / s);
        } else {
            column.fill(0.0);
        }
    }
    Ok((z, means, scales))
}

/// Pearson correlation matrix of a complete table (variables are columns).
pub fn correlation_matrix(data: ArrayView2<f64>) -> Result<Array2<f64>> {
    if data.iter().any(|v| !v.is_finite()) {
        return Err(AnalysisError::invalid(
            "correlation_matrix needs complete data; use pairwise_correlation_matrix for missing values",
        ));
    }
    let (z, _, _) = standardize_columns(data)?;
    let n = z.nrows() as f64;
    let mut corr = z.t().dot(&z) / n;
    for j in 0..corr.nrows() {
        corr[[j, j]] = 1.0;
    }
    Ok(corr)
}

/// Pearson correlation matrix using, for every pair, the observations where both values are present.
/// Pairs with fewer than 3 shared observations or no variance get a correlation of 0.
pub fn pairwise_correlation_matrix(data: ArrayView2<f64>) -> Array2<f64> {
    let p = data.ncols();
    let mut corr = Array2::<f64>::eye(p);
    for i in 0..p {
        for j in (i + 1)..p {
            let (a, b): (Vec<f64>, Vec<f64>) = data
                .column(i)
                .iter()
                .zip(data.column(j).iter())
                .filter(|(x, y)| x.is_finite() && y.is_finite())
                .map(|(&x, &y)| (x, y))
                .unzip();
            let r = if a.len() >= 3 {
                pearson(ArrayView1::from(&a[..]), ArrayView1::from(&b[..]))
            } else {
                0.0
            };
            corr[[i, j]] = r;
            corr[[j, i]] = r;
        }
    }
    corr
}

/// Pearson correlation of two equally long vectors. Zero if either has no variance.
pub fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n = a.len();
    if n == 0 || n != b.len() {
        return 0.0;
    }
    let mean_a = a.sum() / n as f64;
    let mean_b = b.sum() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= STD_FLOOR || var_b <= STD_FLOOR {
        return 0.0;
    }
    (cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)
}

/// Sample distance correlation (Székely, Rizzo & Bakirov 2007), in `[0, 1]`.
pub fn distance_correlation(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n = a.len();
    if n < 2 || n != b.len() {
        return 0.0;
    }
    let centered = |v: ArrayView1<f64>| -> Array2<f64> {
        let mut d = Array2::from_shape_fn((n, n), |(i, j)| (v[i] - v[j]).abs());
        let row_means = d.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(n));
        let grand = row_means.mean().unwrap_or(0.0);
        for i in 0..n {
            for j in 0..n {
                // the distance matrix is symmetric, so column means equal row means
                d[[i, j]] += grand - row_means[i] - row_means[j];
            }
        }
        d
    };
    let da = centered(a);
    let db = centered(b);
    let n2 = (n * n) as f64;
    let dcov_ab = (&da * &db).sum() / n2;
    let dvar_a = (&da * &da).sum() / n2;
    let dvar_b = (&db * &db).sum() / n2;
    let denom = (dvar_a * dvar_b).sqrt();
    if denom <= STD_FLOOR {
        return 0.0;
    }
    (dcov_ab.max(0.0) / denom).sqrt().clamp(0.0, 1.0)
}

/// Shannon entropy of `|weights|` (normalized to a distribution) divided by `ln(len)`,
/// the entropy of the uniform distribution over the same number of categories.
/// A vector of zeros carries no spread and scores 0.
pub fn normalized_entropy(weights: ArrayView1<f64>) -> f64 {
    let k = weights.len();
    if k < 2 {
        return 0.0;
    }
    let total: f64 = weights.iter().map(|w| w.abs()).sum();
    if total <= 0.0 || !total.is_finite() {
        return 0.0;
    }
    let h: f64 = weights
        .iter()
        .map(|w| w.abs() / total)
        .filter(|&p| p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    (h / (k as f64).ln()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn correlation_of_linear_columns_is_one() {
        let data = array![[1.0, 2.0, 3.0], [2.0, 4.0, 1.0], [3.0, 6.0, 2.0], [4.0, 8.0, 0.5]];
        let corr = correlation_matrix(data.view()).unwrap();
        assert_abs_diff_eq!(corr[[0, 1]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(corr[[1, 0]], 1.0, epsilon = 1e-12);
        assert!(corr[[0, 2]] < 0.0);
    }

    #[test]
    fn pairwise_correlation_skips_missing_entries() {
        let data = array![
            [1.0, 2.0],
            [2.0, f64::NAN],
            [3.0, 6.0],
            [4.0, 8.0],
            [f64::NAN, 1.0]
        ];
        let corr = pairwise_correlation_matrix(data.view());
        assert_abs_diff_eq!(corr[[0, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn normalized_entropy_extremes() {
        assert_abs_diff_eq!(normalized_entropy(array![0.9, 0.0, 0.0].view()), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalized_entropy(array![0.5, -0.5, 0.5, 0.5].view()), 1.0, epsilon = 1e-12);
        assert_eq!(normalized_entropy(array![0.0, 0.0].view()), 0.0);
    }

    #[test]
    fn distance_correlation_detects_nonlinear_dependence() {
        let x = Array1::linspace(-1.0, 1.0, 41);
        let y = x.mapv(|v| v * v);
        let r = pearson(x.view(), y.view());
        let dcor = distance_correlation(x.view(), y.view());
        assert!(r.abs() < 1e-10);
        assert!(dcor > 0.3, "dCor = {}", dcor);
        assert_abs_diff_eq!(distance_correlation(x.view(), x.view()), 1.0, epsilon = 1e-10);
    }
}
