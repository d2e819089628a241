//! Minimal dense matrix type and the loss math used by the trainers.
//!
//! The trainers are framework-agnostic: batches, model outputs, and
//! parameter tensors are plain row-major `f32` matrices, and the only
//! numerics the control loop itself needs are temperature-scaled
//! softmax/log-softmax, KL divergence with its analytic input gradient,
//! one-hot target construction, and a handful of reductions.
//!
//! KL divergence follows the mean-over-elements convention: the input is a
//! matrix of log-probabilities, the target a matrix of probabilities, and
//! the loss is `mean(target * (ln(target) - input))` with zero-probability
//! target entries contributing nothing.

use serde::{Deserialize, Serialize};

/// Row-major dense `f32` matrix.
///
/// Rows are samples (or output classes for weight tensors), columns are
/// features or class scores depending on context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Creates a zero-filled matrix.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Creates a matrix from row vectors.
    ///
    /// # Panics
    ///
    /// Panics if the rows have inconsistent lengths.
    #[must_use]
    pub fn from_rows(rows: &[Vec<f32>]) -> Self {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            assert_eq!(row.len(), cols, "inconsistent row length");
            data.extend_from_slice(row);
        }
        Self {
            rows: rows.len(),
            cols,
            data,
        }
    }

    /// Creates a matrix from a flat row-major buffer.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != rows * cols`.
    #[must_use]
    pub fn from_flat(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), rows * cols, "flat buffer size mismatch");
        Self { rows, cols, data }
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// True when the matrix has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Immutable view of row `i`.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Mutable view of row `i`.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Flat immutable view of the whole buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Flat mutable view of the whole buffer.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// New matrix containing the given rows, in order.
    #[must_use]
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            rows: indices.len(),
            cols: self.cols,
            data,
        }
    }

    /// Sets every element to zero.
    pub fn fill_zero(&mut self) {
        self.data.fill(0.0);
    }

    /// Scales every element in place.
    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    /// True when any element is NaN or infinite.
    #[must_use]
    pub fn has_non_finite(&self) -> bool {
        self.data.iter().any(|v| !v.is_finite())
    }
}

/// Row-wise softmax of `input / temperature`.
#[must_use]
pub fn softmax_rows(input: &Matrix, temperature: f32) -> Matrix {
    let mut out = input.clone();
    for i in 0..out.rows() {
        let row = out.row_mut(i);
        let mut max = f32::NEG_INFINITY;
        for v in row.iter_mut() {
            *v /= temperature;
            max = max.max(*v);
        }
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    out
}

/// Row-wise log-softmax of `input / temperature`.
#[must_use]
pub fn log_softmax_rows(input: &Matrix, temperature: f32) -> Matrix {
    let mut out = input.clone();
    for i in 0..out.rows() {
        let row = out.row_mut(i);
        let mut max = f32::NEG_INFINITY;
        for v in row.iter_mut() {
            *v /= temperature;
            max = max.max(*v);
        }
        let log_sum: f32 = row.iter().map(|v| (*v - max).exp()).sum::<f32>().ln() + max;
        for v in row.iter_mut() {
            *v -= log_sum;
        }
    }
    out
}

/// KL divergence between a log-probability input and a probability target,
/// averaged over all elements.
///
/// Zero-probability target entries contribute nothing.
///
/// # Panics
///
/// Panics if the shapes differ.
#[must_use]
pub fn kl_div(log_probs: &Matrix, targets: &Matrix) -> f32 {
    assert_eq!(log_probs.rows(), targets.rows(), "row mismatch");
    assert_eq!(log_probs.cols(), targets.cols(), "col mismatch");
    let n = log_probs.numel();
    if n == 0 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    for (&x, &t) in log_probs.as_slice().iter().zip(targets.as_slice()) {
        if t > 0.0 {
            sum += f64::from(t) * (f64::from(t).ln() - f64::from(x));
        }
    }
    (sum / n as f64) as f32
}

/// Gradient of [`kl_div`] with respect to its log-probability input.
///
/// With mean reduction this is `-target / numel` elementwise; the target
/// is treated as a constant (detached pseudo-target).
#[must_use]
pub fn kl_div_grad(targets: &Matrix) -> Matrix {
    let n = targets.numel();
    let mut grad = targets.clone();
    if n == 0 {
        return grad;
    }
    grad.scale(-1.0 / n as f32);
    grad
}

/// One-hot target matrix of shape `(targets.len(), classes)`.
#[must_use]
pub fn one_hot(targets: &[usize], classes: usize) -> Matrix {
    let mut out = Matrix::zeros(targets.len(), classes);
    for (i, &t) in targets.iter().enumerate() {
        debug_assert!(t < classes, "target id out of range");
        out.row_mut(i)[t] = 1.0;
    }
    out
}

/// Column-wise sums, one per class.
#[must_use]
pub fn column_sums(m: &Matrix) -> Vec<f64> {
    let mut sums = vec![0.0f64; m.cols()];
    for i in 0..m.rows() {
        for (s, &v) in sums.iter_mut().zip(m.row(i)) {
            *s += f64::from(v);
        }
    }
    sums
}

/// Row-wise sums of absolute values, one per row.
///
/// For a classifier weight matrix laid out `(classes, features)` this is
/// the per-output-class gradient mass.
#[must_use]
pub fn abs_row_sums(m: &Matrix) -> Vec<f64> {
    (0..m.rows())
        .map(|i| m.row(i).iter().map(|v| f64::from(v.abs())).sum())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_rows_sum_to_one() {
        let m = Matrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![-1.0, 0.0, 1.0]]);
        let p = softmax_rows(&m, 2.0);
        for i in 0..p.rows() {
            let sum: f32 = p.row(i).iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn log_softmax_matches_softmax() {
        let m = Matrix::from_rows(&[vec![0.5, -0.5, 2.0]]);
        let p = softmax_rows(&m, 1.5);
        let lp = log_softmax_rows(&m, 1.5);
        for (a, b) in p.as_slice().iter().zip(lp.as_slice()) {
            assert!((a.ln() - b).abs() < 1e-5);
        }
    }

    #[test]
    fn kl_div_is_zero_for_matching_distributions() {
        let logits = Matrix::from_rows(&[vec![1.0, 2.0, 0.5]]);
        let p = softmax_rows(&logits, 1.0);
        let lp = log_softmax_rows(&logits, 1.0);
        assert!(kl_div(&lp, &p).abs() < 1e-6);
    }

    #[test]
    fn kl_div_positive_for_mismatched_distributions() {
        let lp = log_softmax_rows(&Matrix::from_rows(&[vec![3.0, 0.0, 0.0]]), 1.0);
        let target = Matrix::from_rows(&[vec![0.0, 1.0, 0.0]]);
        assert!(kl_div(&lp, &target) > 0.0);
    }

    #[test]
    fn kl_div_grad_scales_by_numel() {
        let target = Matrix::from_rows(&[vec![0.0, 1.0], vec![1.0, 0.0]]);
        let grad = kl_div_grad(&target);
        assert!((grad.row(0)[1] + 0.25).abs() < 1e-7);
        assert_eq!(grad.row(0)[0], 0.0);
    }

    #[test]
    fn one_hot_places_single_unit_mass() {
        let m = one_hot(&[2, 0], 4);
        assert_eq!(m.row(0), &[0.0, 0.0, 1.0, 0.0]);
        assert_eq!(m.row(1), &[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(column_sums(&m), vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn select_rows_preserves_order() {
        let m = Matrix::from_rows(&[vec![1.0], vec![2.0], vec![3.0]]);
        let s = m.select_rows(&[2, 0]);
        assert_eq!(s.row(0), &[3.0]);
        assert_eq!(s.row(1), &[1.0]);
    }

    #[test]
    fn non_finite_detection() {
        let mut m = Matrix::zeros(1, 2);
        assert!(!m.has_non_finite());
        m.row_mut(0)[1] = f32::NAN;
        assert!(m.has_non_finite());
    }
}
