//! Diagnostic threshold bookkeeping.
//!
//! The trainers maintain two per-class vectors that mirror, respectively,
//! the total target mass seen during training (one-hot mass for new classes
//! plus temperature-scaled pseudo-target mass for old classes) and an
//! exponentially decayed sum of absolute gradient magnitude on the final
//! classification layer, per output class.
//!
//! These vectors are pure side-channel state: they influence nothing about
//! gradient computation and exist only as calibration/diagnostic signals.
//! Keeping them in a standalone tracker keeps the training loop testable
//! independent of the diagnostics.

use serde::{Deserialize, Serialize};

/// Accumulates the two per-class diagnostic vectors.
///
/// Both vectors are reset to all-ones exactly once per setup phase and
/// clamped at epoch boundaries so classes that were never revealed do not
/// appear artificially under-weighted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdTracker {
    target_mass: Vec<f64>,
    grad_mass: Vec<f64>,
}

impl ThresholdTracker {
    /// Creates a tracker for `classes` output classes, initialized to ones.
    #[must_use]
    pub fn new(classes: usize) -> Self {
        Self {
            target_mass: vec![1.0; classes],
            grad_mass: vec![1.0; classes],
        }
    }

    /// Resets both vectors to all-ones.
    pub fn reset(&mut self) {
        self.target_mass.fill(1.0);
        self.grad_mass.fill(1.0);
    }

    /// Adds per-class target mass, scaled by `scale`.
    ///
    /// New-class one-hot mass uses `scale = 1`; old-class pseudo-target
    /// mass uses `scale = T * T * alpha`.
    ///
    /// # Panics
    ///
    /// Panics if `per_class` does not cover every class.
    pub fn add_target_mass(&mut self, per_class: &[f64], scale: f64) {
        assert_eq!(per_class.len(), self.target_mass.len(), "class count mismatch");
        for (acc, &v) in self.target_mass.iter_mut().zip(per_class) {
            *acc += v * scale;
        }
    }

    /// Records per-output-class absolute gradient mass of the classifier
    /// weight matrix.
    ///
    /// With `decay` set, the accumulated vector is first multiplied by the
    /// decay factor (the incremental trainer uses 0.99; the peer distiller
    /// accumulates undecayed).
    ///
    /// # Panics
    ///
    /// Panics if `per_class` does not cover every class.
    pub fn record_classifier_grads(&mut self, per_class: &[f64], decay: Option<f64>) {
        assert_eq!(per_class.len(), self.grad_mass.len(), "class count mismatch");
        if let Some(factor) = decay {
            for v in &mut self.grad_mass {
                *v *= factor;
            }
        }
        for (acc, &v) in self.grad_mass.iter_mut().zip(per_class) {
            *acc += v;
        }
    }

    /// Clamps the tail `[start..]` of both vectors to their respective
    /// observed maxima. A start at or past the end is a no-op.
    pub fn clamp_tail_from(&mut self, start: usize) {
        let len = self.target_mass.len();
        self.clamp_range(start.min(len), len);
    }

    /// Clamps the window `[start..end)` of both vectors to their respective
    /// observed maxima. Bounds are intersected with the vector length.
    pub fn clamp_range(&mut self, start: usize, end: usize) {
        let len = self.target_mass.len();
        let start = start.min(len);
        let end = end.min(len);
        if start >= end {
            return;
        }
        let max_target = max_of(&self.target_mass);
        let max_grad = max_of(&self.grad_mass);
        for v in &mut self.target_mass[start..end] {
            *v = max_target;
        }
        for v in &mut self.grad_mass[start..end] {
            *v = max_grad;
        }
    }

    /// Accumulated per-class target mass.
    #[must_use]
    pub fn target_mass(&self) -> &[f64] {
        &self.target_mass
    }

    /// Accumulated per-class classifier gradient mass.
    #[must_use]
    pub fn grad_mass(&self) -> &[f64] {
        &self.grad_mass
    }

    /// Target-mass vector normalized by its maximum, for logging.
    #[must_use]
    pub fn normalized_target_mass(&self) -> Vec<f64> {
        normalize(&self.target_mass)
    }

    /// Gradient-mass vector normalized by its maximum, for logging.
    #[must_use]
    pub fn normalized_grad_mass(&self) -> Vec<f64> {
        normalize(&self.grad_mass)
    }
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn normalize(values: &[f64]) -> Vec<f64> {
    let max = max_of(values);
    if max == 0.0 || !max.is_finite() {
        return values.to_vec();
    }
    values.iter().map(|v| v / max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tracker_is_all_ones() {
        let tracker = ThresholdTracker::new(4);
        assert_eq!(tracker.target_mass(), &[1.0; 4]);
        assert_eq!(tracker.grad_mass(), &[1.0; 4]);
    }

    #[test]
    fn target_mass_scales_contributions() {
        let mut tracker = ThresholdTracker::new(3);
        tracker.add_target_mass(&[1.0, 0.0, 2.0], 4.0);
        assert_eq!(tracker.target_mass(), &[5.0, 1.0, 9.0]);
    }

    #[test]
    fn grad_mass_decays_before_accumulating() {
        let mut tracker = ThresholdTracker::new(2);
        tracker.record_classifier_grads(&[1.0, 1.0], Some(0.5));
        // 1.0 * 0.5 + 1.0
        assert_eq!(tracker.grad_mass(), &[1.5, 1.5]);
        tracker.record_classifier_grads(&[0.0, 0.0], None);
        assert_eq!(tracker.grad_mass(), &[1.5, 1.5]);
    }

    #[test]
    fn clamp_tail_sets_maximum() {
        let mut tracker = ThresholdTracker::new(4);
        tracker.add_target_mass(&[9.0, 0.0, 0.0, 0.0], 1.0);
        tracker.clamp_tail_from(2);
        assert_eq!(tracker.target_mass(), &[10.0, 1.0, 10.0, 10.0]);
    }

    #[test]
    fn clamp_range_out_of_bounds_is_safe() {
        let mut tracker = ThresholdTracker::new(3);
        tracker.clamp_range(2, 10);
        tracker.clamp_tail_from(7);
        assert_eq!(tracker.target_mass(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn reset_restores_ones() {
        let mut tracker = ThresholdTracker::new(2);
        tracker.add_target_mass(&[3.0, 4.0], 1.0);
        tracker.record_classifier_grads(&[2.0, 2.0], Some(0.99));
        tracker.reset();
        assert_eq!(tracker.target_mass(), &[1.0, 1.0]);
        assert_eq!(tracker.grad_mass(), &[1.0, 1.0]);
    }

    #[test]
    fn normalized_peaks_at_one() {
        let mut tracker = ThresholdTracker::new(2);
        tracker.add_target_mass(&[3.0, 0.0], 1.0);
        let normalized = tracker.normalized_target_mass();
        assert!((normalized[0] - 1.0).abs() < 1e-12);
        assert!((normalized[1] - 0.25).abs() < 1e-12);
    }
}
