//! Peer two-teacher distillation.
//!
//! Trains a student model purely from the temperature-scaled soft outputs
//! of two frozen teacher models; no ground-truth labels are consumed. Both
//! teachers' KL terms backpropagate through the student's single forward
//! per batch, each pre-scaled by `T * T * alpha`, before one optimizer
//! step. Unlike the incremental trainer's diagnostics, classifier gradient
//! mass accumulates here without decay, and the epoch-end clamp covers a
//! fixed class range rather than a schedule-dependent tail.

use crate::config::IncrementalTrainerConfig;
use crate::error::{IncrementalError, TrainResult};
use crate::metrics::ThresholdTracker;
use crate::tensor;
use crate::{DataSource, EpochSummary, ForwardOptions, Mode, Model, Optimizer};

/// Distills two teacher models into one student.
pub struct PeerDistiller<M, O, D> {
    model: M,
    optimizer: O,
    source: D,
    thresholds: ThresholdTracker,
    config: IncrementalTrainerConfig,
    current_lr: f32,
}

impl<M, O, D> PeerDistiller<M, O, D>
where
    M: Model,
    O: Optimizer<M>,
    D: DataSource<M>,
{
    /// Creates a distiller around a student model, its optimizer, and the
    /// data source providing unlabeled-in-spirit batches (targets are
    /// ignored).
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn new(
        model: M,
        mut optimizer: O,
        source: D,
        config: IncrementalTrainerConfig,
    ) -> TrainResult<Self> {
        config.validate()?;
        optimizer.set_learning_rate(config.lr);
        let thresholds = ThresholdTracker::new(config.total_classes);
        let current_lr = config.lr;
        Ok(Self {
            model,
            optimizer,
            source,
            thresholds,
            config,
            current_lr,
        })
    }

    /// Applies the scheduled learning-rate decay for `epoch`, if any.
    pub fn update_lr(&mut self, epoch: usize) {
        for (point, gamma) in self.config.schedule.iter().zip(&self.config.gammas) {
            if *point == epoch {
                let previous = self.current_lr;
                self.current_lr *= gamma;
                self.optimizer.set_learning_rate(self.current_lr);
                tracing::info!(
                    previous,
                    current = self.current_lr,
                    epoch,
                    "learning rate decayed"
                );
            }
        }
    }

    /// Runs one distillation epoch against two teachers.
    ///
    /// Per batch: one student forward at temperature `T`, one KL term per
    /// teacher backpropagated through that forward with scale `T * T *
    /// alpha`, one optimizer step. At epoch end the diagnostic vectors are
    /// clamped over the configured fixed class range.
    ///
    /// # Errors
    ///
    /// [`IncrementalError::NumericalAnomaly`] on non-finite losses or
    /// teacher outputs, or any collaborator error.
    pub fn distill_epoch(
        &mut self,
        teacher_a: &mut M,
        teacher_b: &mut M,
        epoch: usize,
    ) -> TrainResult<EpochSummary> {
        self.update_lr(epoch);
        self.model.set_mode(Mode::Train);
        teacher_a.set_mode(Mode::Eval);
        teacher_b.set_mode(Mode::Eval);

        let temperature = self.config.temperature;
        let scale = temperature * temperature * self.config.alpha;
        let soft = ForwardOptions {
            temperature,
            predict_class: true,
            soft_targets: true,
        };
        let batches = self.source.epoch_batches()?;

        let mut loss_sum = 0.0f64;
        let mut loss_count = 0usize;
        let mut grad_norm_sum = 0.0f64;
        let mut grad_norm_count = 0usize;

        for batch in &batches {
            self.optimizer.zero_grad(&mut self.model);

            let targets_a = teacher_a.forward(&batch.data, &soft)?.output;
            let targets_b = teacher_b.forward(&batch.data, &soft)?.output;
            if targets_a.has_non_finite() || targets_b.has_non_finite() {
                return Err(IncrementalError::NumericalAnomaly {
                    detail: "teacher soft targets are non-finite".to_string(),
                    epoch,
                });
            }

            let student = self.model.forward(
                &batch.data,
                &ForwardOptions {
                    temperature,
                    predict_class: true,
                    soft_targets: false,
                },
            )?;
            let loss_a = tensor::kl_div(&student.output, &targets_a);
            let loss_b = tensor::kl_div(&student.output, &targets_b);
            if !loss_a.is_finite() || !loss_b.is_finite() {
                return Err(IncrementalError::NumericalAnomaly {
                    detail: "distillation loss is non-finite".to_string(),
                    epoch,
                });
            }

            self.thresholds
                .add_target_mass(&tensor::column_sums(&targets_a), f64::from(scale));
            self.thresholds
                .add_target_mass(&tensor::column_sums(&targets_b), f64::from(scale));

            // Both terms flow through the same retained forward.
            let info_a = self.model.backward(&tensor::kl_div_grad(&targets_a), scale)?;
            let info_b = self.model.backward(&tensor::kl_div_grad(&targets_b), scale)?;
            grad_norm_sum += f64::from(info_a.gradient_norm) + f64::from(info_b.gradient_norm);
            grad_norm_count += 2;

            self.record_classifier_grads();
            self.optimizer.step(&mut self.model)?;

            loss_sum += f64::from(loss_a) + f64::from(loss_b);
            loss_count += 1;
        }

        let clamp = &self.config.peer_clamp;
        self.thresholds.clamp_range(clamp.start, clamp.end);

        Ok(EpochSummary {
            epoch,
            batches: batches.len(),
            mean_new_loss: None,
            mean_distill_loss: mean_loss(loss_sum, loss_count),
            mean_gradient_norm: mean_loss(grad_norm_sum, grad_norm_count),
            learning_rate: self.current_lr,
        })
    }

    fn record_classifier_grads(&mut self) {
        for (name, param) in self.model.named_parameters() {
            if name.contains(&self.config.classifier_filter) {
                let per_class = tensor::abs_row_sums(&param.grad);
                // No decay here: gradient mass accumulates across batches.
                self.thresholds.record_classifier_grads(&per_class, None);
            }
        }
    }

    /// Shared access to the student model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Consumes the distiller, returning the student model.
    pub fn into_model(self) -> M {
        self.model
    }

    /// The diagnostic threshold vectors.
    #[must_use]
    pub fn thresholds(&self) -> &ThresholdTracker {
        &self.thresholds
    }

    /// The learning rate currently in effect.
    #[must_use]
    pub fn learning_rate(&self) -> f32 {
        self.current_lr
    }
}

fn mean_loss(sum: f64, count: usize) -> Option<f32> {
    (count > 0).then(|| (sum / count as f64) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IncrementalTrainerConfig;
    use crate::models::{InMemoryDataSource, LinearSoftmax};
    use crate::optim::Sgd;
    use crate::tensor::Matrix;
    use crate::ClassVisibility;

    fn config(classes: usize) -> IncrementalTrainerConfig {
        IncrementalTrainerConfig::builder()
            .total_classes(classes)
            .step_size(1)
            .lr(0.5)
            .temperature(2.0)
            .build()
    }

    fn source_with_class(id: usize, features: usize) -> InMemoryDataSource {
        let mut source = InMemoryDataSource::new(8);
        let samples: Vec<Vec<f32>> = (0..16)
            .map(|i| (0..features).map(|f| ((i + f + id) % 5) as f32 * 0.2).collect())
            .collect();
        source.insert_class(id, samples);
        source.add_class(id);
        source
    }

    #[test]
    fn student_moves_toward_agreeing_teachers() {
        let cfg = config(4);
        let student = LinearSoftmax::new(3, 4, 11);
        let mut teacher_a = LinearSoftmax::new(3, 4, 99);
        let mut teacher_b = teacher_a.clone();
        let optimizer = Sgd::from_config(&cfg);
        let source = source_with_class(0, 3);
        let mut distiller = PeerDistiller::new(student, optimizer, source, cfg).unwrap();

        let data = Matrix::from_rows(&[vec![0.2, 0.4, 0.6]]);
        let target = teacher_a
            .forward(&data, &ForwardOptions::default())
            .unwrap()
            .output;

        let mut gaps = Vec::new();
        for epoch in 0..2 {
            let before = distiller
                .model
                .forward(&data, &ForwardOptions::default())
                .unwrap()
                .output;
            let gap: f32 = before
                .as_slice()
                .iter()
                .zip(target.as_slice())
                .map(|(a, b)| (a - b).abs())
                .sum();
            gaps.push(gap);
            distiller
                .distill_epoch(&mut teacher_a, &mut teacher_b, epoch)
                .unwrap();
        }
        let after = distiller
            .model
            .forward(&data, &ForwardOptions::default())
            .unwrap()
            .output;
        let final_gap: f32 = after
            .as_slice()
            .iter()
            .zip(target.as_slice())
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(final_gap < gaps[0]);
    }

    #[test]
    fn epoch_summary_reports_distill_loss_only() {
        let cfg = config(4);
        let student = LinearSoftmax::new(3, 4, 1);
        let mut teacher_a = LinearSoftmax::new(3, 4, 2);
        let mut teacher_b = LinearSoftmax::new(3, 4, 3);
        let optimizer = Sgd::from_config(&cfg);
        let source = source_with_class(1, 3);
        let mut distiller = PeerDistiller::new(student, optimizer, source, cfg).unwrap();
        let summary = distiller
            .distill_epoch(&mut teacher_a, &mut teacher_b, 0)
            .unwrap();
        assert!(summary.batches > 0);
        assert!(summary.mean_new_loss.is_none());
        assert!(summary.mean_distill_loss.unwrap() >= 0.0);
        assert!(summary.mean_gradient_norm.unwrap() > 0.0);
    }

    #[test]
    fn non_finite_teacher_output_aborts_the_epoch() {
        let cfg = config(4);
        let student = LinearSoftmax::new(3, 4, 1);
        let mut teacher_a = LinearSoftmax::new(3, 4, 2);
        let mut teacher_b = LinearSoftmax::new(3, 4, 3);
        let optimizer = Sgd::from_config(&cfg);
        let mut source = InMemoryDataSource::new(8);
        source.insert_class(0, vec![vec![0.1, f32::NAN, 0.3]]);
        source.add_class(0);
        let mut distiller = PeerDistiller::new(student, optimizer, source, cfg).unwrap();
        let err = distiller
            .distill_epoch(&mut teacher_a, &mut teacher_b, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            IncrementalError::NumericalAnomaly { epoch: 0, .. }
        ));
    }

    #[test]
    fn thresholds_clamp_over_fixed_range() {
        let mut cfg = config(10);
        cfg.peer_clamp.start = 0;
        cfg.peer_clamp.end = 10;
        let student = LinearSoftmax::new(3, 10, 1);
        let mut teacher_a = LinearSoftmax::new(3, 10, 2);
        let mut teacher_b = LinearSoftmax::new(3, 10, 3);
        let optimizer = Sgd::from_config(&cfg);
        let source = source_with_class(2, 3);
        let mut distiller = PeerDistiller::new(student, optimizer, source, cfg).unwrap();
        distiller
            .distill_epoch(&mut teacher_a, &mut teacher_b, 0)
            .unwrap();
        let mass = distiller.thresholds().target_mass();
        let max = mass.iter().copied().fold(f64::MIN, f64::max);
        assert!(mass.iter().all(|&v| (v - max).abs() < 1e-12));
    }

    #[test]
    fn learning_rate_decays_on_schedule() {
        let mut cfg = config(4);
        cfg.schedule = vec![1];
        cfg.gammas = vec![0.1];
        let student = LinearSoftmax::new(3, 4, 1);
        let mut teacher_a = LinearSoftmax::new(3, 4, 2);
        let mut teacher_b = LinearSoftmax::new(3, 4, 3);
        let optimizer = Sgd::from_config(&cfg);
        let source = source_with_class(0, 3);
        let mut distiller = PeerDistiller::new(student, optimizer, source, cfg).unwrap();
        distiller
            .distill_epoch(&mut teacher_a, &mut teacher_b, 0)
            .unwrap();
        assert!((distiller.learning_rate() - 0.5).abs() < 1e-6);
        distiller
            .distill_epoch(&mut teacher_a, &mut teacher_b, 1)
            .unwrap();
        assert!((distiller.learning_rate() - 0.05).abs() < 1e-6);
    }
}
