//! # incremental-trainer-rs
//!
//! Class-incremental training with knowledge distillation and a bounded
//! exemplar memory.
//!
//! ## Overview
//!
//! Training proceeds over a sequence of class groups introduced over time.
//! Each cycle combines a supervised loss on the newly introduced classes
//! with a temperature-scaled distillation loss against a frozen snapshot of
//! the model, mitigating catastrophic forgetting, while a herding-based
//! exemplar memory bounds the number of stored samples per class.
//!
//! ```text
//!   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!   │ reveal class │──▶│ train epochs │──▶│ setup phase  │
//!   │    group     │   │ (KD + CE)    │   │ (trim memory)│
//!   └──────────────┘   └──────────────┘   └──────┬───────┘
//!          ▲                                     │
//!          │            ┌──────────────┐         │
//!          └────────────│ refresh      │◀────────┘
//!                       │ frozen model │
//!                       └──────────────┘
//! ```
//!
//! The crate is framework-agnostic: models, optimizers, and datasets are
//! trait collaborators, and the control loop works on plain row-major
//! `f32` matrices. A reference linear classifier, SGD optimizer, and
//! in-memory data source live in [`models`] and [`optim`] for validation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use incremental_trainer_rs::config::IncrementalTrainerConfig;
//! use incremental_trainer_rs::models::{InMemoryDataSource, LinearSoftmax};
//! use incremental_trainer_rs::optim::Sgd;
//! use incremental_trainer_rs::IncrementalTrainer;
//!
//! # fn main() -> Result<(), incremental_trainer_rs::IncrementalError> {
//! let config = IncrementalTrainerConfig::builder()
//!     .total_classes(10)
//!     .step_size(2)
//!     .memory_budget(200)
//!     .build();
//! let model = LinearSoftmax::new(16, 10, config.seed);
//! let optimizer = Sgd::from_config(&config);
//! let source = InMemoryDataSource::new(32);
//! let mut trainer = IncrementalTrainer::new(model, optimizer, source, config)?;
//!
//! for _cycle in 0..5 {
//!     trainer.reveal_next_group()?;
//!     for epoch in 0..3 {
//!         trainer.train_epoch(epoch)?;
//!     }
//!     trainer.setup_phase()?;
//!     trainer.refresh_frozen()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - training configuration and serialization
//! - [`error`] - fail-fast error taxonomy
//! - [`schedule`] - deterministic class release order and bookkeeping sets
//! - [`exemplar`] - exemplar memory budget allocation (herding)
//! - [`frozen`] - frozen model snapshot management
//! - [`distill`] - two-teacher peer distillation
//! - [`metrics`] - per-class diagnostic threshold vectors
//! - [`tensor`] - dense matrix and loss math
//! - [`optim`] - reference SGD optimizer
//! - [`models`] - reference model and data source for validation

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]
// Precision-loss casts are pervasive in the numerical paths and benign at
// the scales involved.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]

pub mod config;
pub mod distill;
pub mod error;
pub mod exemplar;
pub mod frozen;
pub mod metrics;
pub mod models;
pub mod optim;
pub mod schedule;
pub mod tensor;

pub use config::IncrementalTrainerConfig;
pub use distill::PeerDistiller;
pub use error::{IncrementalError, TrainResult};
pub use exemplar::{ExemplarBudgetAllocator, ExemplarRebalance};
pub use frozen::FrozenModelManager;
pub use metrics::ThresholdTracker;
pub use schedule::ClassSchedule;
pub use tensor::Matrix;

/// Integer class identifier, as reported in batch targets.
pub type ClassId = usize;

/// Train/eval switch for model collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Training mode (dropout/batch-norm style layers active).
    Train,
    /// Evaluation mode.
    Eval,
}

/// Options recognized by a model's forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Softmax temperature; higher values flatten the distribution.
    pub temperature: f32,
    /// Also return the secondary class-confidence output.
    pub predict_class: bool,
    /// Return probabilities suitable as detached distillation targets
    /// instead of log-probabilities.
    pub soft_targets: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            predict_class: false,
            soft_targets: false,
        }
    }
}

/// Result of a model forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Log-probabilities over all classes, one row per sample, or
    /// probabilities when `soft_targets` was requested.
    pub output: Matrix,
    /// Secondary class-confidence output, present when `predict_class`
    /// was requested.
    pub class_scores: Option<Matrix>,
}

/// Gradient information reported by a backward pass.
#[derive(Debug, Clone)]
pub struct GradientInfo {
    /// L2 norm of this backward's gradient contribution.
    pub gradient_norm: f32,
}

/// A learnable tensor with its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Current values.
    pub value: Matrix,
    /// Accumulated gradient, same shape as `value`.
    pub grad: Matrix,
    /// Whether gradient descent may update this parameter.
    pub requires_grad: bool,
}

impl Parameter {
    /// Wraps a value tensor with a zeroed gradient buffer.
    #[must_use]
    pub fn new(value: Matrix) -> Self {
        let grad = Matrix::zeros(value.rows(), value.cols());
        Self {
            value,
            grad,
            requires_grad: true,
        }
    }
}

/// One batch of training data with integer class-id targets.
#[derive(Debug, Clone)]
pub struct LabeledBatch {
    /// Sample matrix, one row per sample.
    pub data: Matrix,
    /// Class id per row of `data`.
    pub targets: Vec<ClassId>,
}

/// Trait for trainable classifier models.
///
/// The trainers are framework-agnostic: they only need a forward pass
/// producing (log-)probability rows, an accumulating backward pass, and
/// parameter access. A framework binding implements these against its own
/// autodiff; the reference [`models::LinearSoftmax`] implements them
/// analytically.
///
/// # Backward contract
///
/// `backward` receives the gradient of a scalar loss with respect to the
/// most recent `forward`'s output, multiplies it by `scale`, and
/// accumulates parameter gradients without clearing previously accumulated
/// ones. The forward state must be retained until the next `forward`, so
/// two loss terms can backpropagate through the same forward.
pub trait Model: Send {
    /// Executes the forward pass.
    fn forward(&mut self, data: &Matrix, opts: &ForwardOptions) -> TrainResult<ForwardOutput>;

    /// Accumulates parameter gradients for the most recent forward.
    ///
    /// # Errors
    ///
    /// Implementations must reject backward on a frozen model, without a
    /// preceding forward, and through a detached soft-target output.
    fn backward(&mut self, grad_output: &Matrix, scale: f32) -> TrainResult<GradientInfo>;

    /// Mutable access to every learnable parameter.
    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Name-tagged parameter access; the final classification layer's
    /// weight matrix is located by substring match on these names.
    fn named_parameters(&self) -> Vec<(&str, &Parameter)>;

    /// Switches between train and eval mode.
    fn set_mode(&mut self, mode: Mode);

    /// Disables gradient accumulation on every parameter.
    fn freeze(&mut self);

    /// True while any parameter still accumulates gradients.
    fn requires_grad(&self) -> bool;
}

/// Trait for optimizers that update model parameters.
pub trait Optimizer<M: Model>: Send {
    /// Applies one update step from the accumulated gradients.
    fn step(&mut self, model: &mut M) -> TrainResult<()>;

    /// Returns the current learning rate.
    fn learning_rate(&self) -> f32;

    /// Sets the learning rate (setup-phase reset and scheduled decay).
    fn set_learning_rate(&mut self, lr: f32);

    /// Zeros all accumulated gradients.
    fn zero_grad(&mut self, model: &mut M);

    /// Discards internal state such as momentum buffers. Must be called
    /// when the model is replaced wholesale.
    fn reset(&mut self);
}

/// Class-visibility operations every data stream supports.
///
/// Object-safe so a reveal can fan out to a heterogeneous set of
/// registered streams (train, test, "ideal" baselines).
pub trait ClassVisibility: Send {
    /// Makes a class's samples visible to iteration.
    fn add_class(&mut self, id: ClassId);

    /// Truncates a class's visible sample set to at most `k` samples
    /// (implementation-defined selection).
    fn limit_class(&mut self, id: ClassId, k: usize) -> TrainResult<()>;
}

/// Data-providing collaborator for training streams.
pub trait DataSource<M: Model>: ClassVisibility {
    /// Truncates a class to at most `k` samples chosen by herding: ranked
    /// by closeness to the class mean in the reference model's learned
    /// representation.
    fn limit_class_and_sort(&mut self, id: ClassId, k: usize, reference: &mut M)
        -> TrainResult<()>;

    /// Produces a fresh, finite batch sequence for one epoch.
    fn epoch_batches(&mut self) -> TrainResult<Vec<LabeledBatch>>;
}

/// Constructs freshly initialized models, used for random
/// reinitialization of the live model at a frozen-model refresh.
pub trait ModelFactory<M: Model>: Send {
    /// Builds a new model with fresh random weights.
    fn create(&self) -> TrainResult<M>;
}

/// Summary of one training or distillation epoch.
#[derive(Debug, Clone)]
pub struct EpochSummary {
    /// The epoch index passed by the caller.
    pub epoch: usize,
    /// Number of batches processed.
    pub batches: usize,
    /// Mean new-class loss over the batches that computed one.
    pub mean_new_loss: Option<f32>,
    /// Mean distillation loss over the batches that computed one.
    pub mean_distill_loss: Option<f32>,
    /// Mean gradient norm across the epoch's backward passes, when any
    /// ran.
    pub mean_gradient_norm: Option<f32>,
    /// Learning rate in effect at the end of the epoch.
    pub learning_rate: f32,
}

/// The central class-incremental trainer.
///
/// Owns the live model, its optimizer, the training data source, the class
/// release schedule, the frozen snapshot, and the diagnostic threshold
/// vectors. Execution is single-threaded and batch-at-a-time: each batch's
/// forward/backward/step completes before the next begins, and a frozen
/// refresh is a barrier between epochs.
///
/// # Type Parameters
///
/// - `M`: model type (cloneable for snapshots)
/// - `O`: optimizer type
/// - `D`: training data source type
pub struct IncrementalTrainer<M, O, D> {
    model: M,
    optimizer: O,
    train_source: D,
    eval_sinks: Vec<Box<dyn ClassVisibility>>,
    schedule: ClassSchedule,
    frozen: FrozenModelManager<M>,
    allocator: ExemplarBudgetAllocator,
    thresholds: ThresholdTracker,
    factory: Option<Box<dyn ModelFactory<M>>>,
    config: IncrementalTrainerConfig,
    current_lr: f32,
}

impl<M, O, D> IncrementalTrainer<M, O, D>
where
    M: Model + Clone,
    O: Optimizer<M>,
    D: DataSource<M>,
{
    /// Creates a trainer and takes the initial frozen snapshot from the
    /// live model, so first-phase distillation state is always defined.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn new(
        model: M,
        mut optimizer: O,
        train_source: D,
        config: IncrementalTrainerConfig,
    ) -> TrainResult<Self> {
        config.validate()?;
        optimizer.set_learning_rate(config.lr);
        let schedule = ClassSchedule::new(config.total_classes, config.seed);
        let frozen = FrozenModelManager::from_live(&model);
        let allocator = ExemplarBudgetAllocator::new(config.memory_budget, !config.no_herding);
        let thresholds = ThresholdTracker::new(config.total_classes);
        let current_lr = config.lr;
        Ok(Self {
            model,
            optimizer,
            train_source,
            eval_sinks: Vec::new(),
            schedule,
            frozen,
            allocator,
            thresholds,
            factory: None,
            config,
            current_lr,
        })
    }

    /// Registers the model factory used for random reinitialization.
    #[must_use]
    pub fn with_model_factory(mut self, factory: Box<dyn ModelFactory<M>>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Registers an evaluation-only stream (test or "ideal" iterators)
    /// that should receive class-visibility instructions on every reveal.
    pub fn register_eval_sink(&mut self, sink: Box<dyn ClassVisibility>) {
        self.eval_sinks.push(sink);
    }

    /// Reveals the next `step_size` classes on the training source and
    /// every registered evaluation sink.
    ///
    /// # Errors
    ///
    /// [`IncrementalError::ScheduleExhausted`] when fewer classes remain.
    pub fn reveal_next_group(&mut self) -> TrainResult<Vec<ClassId>> {
        let mut sinks: Vec<&mut dyn ClassVisibility> =
            Vec::with_capacity(1 + self.eval_sinks.len());
        sinks.push(&mut self.train_source);
        for sink in &mut self.eval_sinks {
            sinks.push(sink.as_mut());
        }
        self.schedule.reveal_next(self.config.step_size, &mut sinks)
    }

    /// Reveals `hi - lo` classes for evaluation visibility without
    /// exemplar memory: evaluation sinks additionally receive
    /// `limit_class(idx, 0)` for each index in `[lo, hi)`.
    ///
    /// # Errors
    ///
    /// [`IncrementalError::ScheduleExhausted`] when fewer classes remain,
    /// or a sink error from `limit_class`.
    pub fn reveal_eval_range(&mut self, lo: usize, hi: usize) -> TrainResult<Vec<ClassId>> {
        let mut train_sinks: Vec<&mut dyn ClassVisibility> = vec![&mut self.train_source];
        let mut eval_sinks: Vec<&mut dyn ClassVisibility> =
            Vec::with_capacity(self.eval_sinks.len());
        for sink in &mut self.eval_sinks {
            eval_sinks.push(sink.as_mut());
        }
        self.schedule
            .reveal_range(lo, hi, &mut train_sinks, &mut eval_sinks)
    }

    /// Runs one setup phase: logs and resets the threshold diagnostics,
    /// restores the base learning rate, and bounds the exemplar memory of
    /// every left-over class (promoting each to the older set).
    ///
    /// # Errors
    ///
    /// [`IncrementalError::EmptyLeftOver`] when no classes are pending
    /// allocation.
    pub fn setup_phase(&mut self) -> TrainResult<ExemplarRebalance> {
        tracing::info!(
            target_mass = ?self.thresholds.normalized_target_mass(),
            grad_mass = ?self.thresholds.normalized_grad_mass(),
            "threshold diagnostics at setup"
        );
        self.thresholds.reset();
        self.optimizer.set_learning_rate(self.config.lr);
        self.current_lr = self.config.lr;
        tracing::info!(lr = self.config.lr, "learning rate reset to base");
        let frozen = self.frozen.snapshot_mut()?;
        self.allocator
            .rebalance(&mut self.schedule, &mut self.train_source, frozen)
    }

    /// Replaces the frozen snapshot with a deep copy of the live model.
    ///
    /// With `random_init` configured, additionally replaces the live model
    /// with a freshly initialized one from the registered factory and
    /// resets the optimizer. This is a hard boundary: all prior gradient
    /// and momentum state is invalid afterwards.
    ///
    /// # Errors
    ///
    /// A configuration error when `random_init` is set without a factory.
    pub fn refresh_frozen(&mut self) -> TrainResult<()> {
        self.frozen.refresh(&mut self.model);
        if self.config.random_init {
            let factory = self.factory.as_ref().ok_or_else(|| {
                IncrementalError::config("random_init requires a registered model factory")
            })?;
            tracing::info!("reinitializing live model with fresh random weights");
            self.model = factory.create()?;
            self.optimizer.reset();
            self.optimizer.set_learning_rate(self.config.lr);
            self.current_lr = self.config.lr;
            self.model.set_mode(Mode::Eval);
        }
        Ok(())
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

    /// Runs one training epoch over the training source.
    ///
    /// Each batch is partitioned into old/new by the raw-label boundary
    /// `base_class_count`. The old partition receives a temperature-scaled
    /// distillation loss against the frozen snapshot, with its gradient
    /// contribution pre-scaled by `T * T * alpha`; the new partition
    /// receives a KL loss against one-hot targets. Both terms accumulate
    /// into the same parameter gradients before the single optimizer step
    /// per batch.
    ///
    /// # Errors
    ///
    /// [`IncrementalError::NoRevealedClasses`] before the first reveal,
    /// [`IncrementalError::NumericalAnomaly`] on non-finite losses or
    /// pseudo-targets, or any collaborator error.
    pub fn train_epoch(&mut self, epoch: usize) -> TrainResult<EpochSummary> {
        self.update_lr(epoch);
        if self.schedule.revealed().is_empty() {
            return Err(IncrementalError::NoRevealedClasses);
        }
        self.model.set_mode(Mode::Train);

        let temperature = self.config.temperature;
        let distill_scale = temperature * temperature * self.config.alpha;
        let batches = self.train_source.epoch_batches()?;

        let mut new_loss_sum = 0.0f64;
        let mut new_loss_count = 0usize;
        let mut distill_loss_sum = 0.0f64;
        let mut distill_loss_count = 0usize;
        let mut grad_norm_sum = 0.0f64;
        let mut grad_norm_count = 0usize;

        for batch in &batches {
            let (old_idx, new_idx) =
                partition_by_label(&batch.targets, self.config.base_class_count);
            self.optimizer.zero_grad(&mut self.model);

            // Distillation term first; its gradient is scaled analytically
            // at the loss seed so the new-class term is never touched by
            // the scale.
            let distill_active = !self.config.no_distill && !self.schedule.older().is_empty();
            if distill_active && !old_idx.is_empty() {
                let old_data = batch.data.select_rows(&old_idx);
                let pseudo = self
                    .frozen
                    .snapshot_mut()?
                    .forward(
                        &old_data,
                        &ForwardOptions {
                            temperature,
                            predict_class: true,
                            soft_targets: true,
                        },
                    )?
                    .output;
                if pseudo.has_non_finite() {
                    return Err(IncrementalError::NumericalAnomaly {
                        detail: "frozen-model pseudo-targets are non-finite".to_string(),
                        epoch,
                    });
                }
                let live = self.model.forward(
                    &old_data,
                    &ForwardOptions {
                        temperature,
                        predict_class: true,
                        soft_targets: false,
                    },
                )?;
                let loss = tensor::kl_div(&live.output, &pseudo);
                if !loss.is_finite() {
                    return Err(IncrementalError::NumericalAnomaly {
                        detail: "distillation loss is non-finite".to_string(),
                        epoch,
                    });
                }
                self.thresholds
                    .add_target_mass(&tensor::column_sums(&pseudo), f64::from(distill_scale));
                let info = self
                    .model
                    .backward(&tensor::kl_div_grad(&pseudo), distill_scale)?;
                grad_norm_sum += f64::from(info.gradient_norm);
                grad_norm_count += 1;
                distill_loss_sum += f64::from(loss);
                distill_loss_count += 1;
            }

            let new_loss_active = self.schedule.older().is_empty() || !self.config.no_new_loss;
            if new_loss_active && !new_idx.is_empty() {
                let new_data = batch.data.select_rows(&new_idx);
                let new_targets: Vec<ClassId> =
                    new_idx.iter().map(|&i| batch.targets[i]).collect();
                let targets = tensor::one_hot(&new_targets, self.config.total_classes);
                let out = self.model.forward(
                    &new_data,
                    &ForwardOptions {
                        temperature: 1.0,
                        predict_class: true,
                        soft_targets: false,
                    },
                )?;
                let loss = tensor::kl_div(&out.output, &targets);
                if !loss.is_finite() {
                    return Err(IncrementalError::NumericalAnomaly {
                        detail: "new-class loss is non-finite".to_string(),
                        epoch,
                    });
                }
                self.thresholds
                    .add_target_mass(&tensor::column_sums(&targets), 1.0);
                let info = self.model.backward(&tensor::kl_div_grad(&targets), 1.0)?;
                grad_norm_sum += f64::from(info.gradient_norm);
                grad_norm_count += 1;
                new_loss_sum += f64::from(loss);
                new_loss_count += 1;
            }

            self.record_classifier_grads();
            self.optimizer.step(&mut self.model)?;
        }

        // Classes that have not been trained yet must not look artificially
        // under-weighted in the diagnostics. Two distinct tail boundaries.
        let tail_start = if self.config.no_new_loss {
            self.schedule.older().len()
        } else {
            self.config.base_class_count + self.schedule.older().len() + self.config.step_size
        };
        self.thresholds.clamp_tail_from(tail_start);

        Ok(EpochSummary {
            epoch,
            batches: batches.len(),
            mean_new_loss: mean_of(new_loss_sum, new_loss_count),
            mean_distill_loss: mean_of(distill_loss_sum, distill_loss_count),
            mean_gradient_norm: mean_of(grad_norm_sum, grad_norm_count),
            learning_rate: self.current_lr,
        })
    }

    fn record_classifier_grads(&mut self) {
        let decay = self.config.grad_decay;
        for (name, param) in self.model.named_parameters() {
            if name.contains(&self.config.classifier_filter) {
                let per_class = tensor::abs_row_sums(&param.grad);
                self.thresholds
                    .record_classifier_grads(&per_class, Some(decay));
            }
        }
    }

    /// Shared access to the live model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable access to the live model.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Consumes the trainer, returning the live model.
    pub fn into_model(self) -> M {
        self.model
    }

    /// The class release schedule and its bookkeeping sets.
    #[must_use]
    pub fn schedule(&self) -> &ClassSchedule {
        &self.schedule
    }

    /// The diagnostic threshold vectors.
    #[must_use]
    pub fn thresholds(&self) -> &ThresholdTracker {
        &self.thresholds
    }

    /// The frozen snapshot manager.
    #[must_use]
    pub fn frozen(&self) -> &FrozenModelManager<M> {
        &self.frozen
    }

    /// The training data source.
    pub fn train_source(&self) -> &D {
        &self.train_source
    }

    /// The learning rate currently in effect.
    #[must_use]
    pub fn learning_rate(&self) -> f32 {
        self.current_lr
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &IncrementalTrainerConfig {
        &self.config
    }
}

/// Splits batch indices into (old, new) by the raw-label boundary:
/// targets below `base_class_count` form the old partition.
fn partition_by_label(targets: &[ClassId], base_class_count: usize) -> (Vec<usize>, Vec<usize>) {
    let mut old = Vec::new();
    let mut new = Vec::new();
    for (i, &t) in targets.iter().enumerate() {
        if t < base_class_count {
            old.push(i);
        } else {
            new.push(i);
        }
    }
    (old, new)
}

fn mean_of(sum: f64, count: usize) -> Option<f32> {
    (count > 0).then(|| (sum / count as f64) as f32)
}

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```
/// use incremental_trainer_rs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::IncrementalTrainerConfig;
    pub use crate::distill::PeerDistiller;
    pub use crate::error::{IncrementalError, TrainResult};
    pub use crate::{
        ClassId, ClassVisibility, DataSource, EpochSummary, ForwardOptions, ForwardOutput,
        GradientInfo, IncrementalTrainer, LabeledBatch, Mode, Model, ModelFactory, Optimizer,
        Parameter,
    };
}
