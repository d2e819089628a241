//! Configuration for the incremental trainer and peer distiller.
//!
//! The configuration system follows the usual conventions:
//! - **Serializable** - load/save from TOML files.
//! - **Validated** - out-of-range values are rejected before training.
//! - **Defaulted** - defaults reproduce the classic 100-class setup.
//!
//! The legacy magic numbers of the original algorithm (the `[0, 50)` raw
//! label partition, the `0.99` gradient-mass decay, the `[20, 100)` /
//! `[0, 80)` clamp windows) are exposed as explicit parameters rather than
//! literals: `base_class_count`, `grad_decay`, and `peer_clamp`. They are
//! deliberately kept as distinct, reviewable values.
//!
//! # Example
//!
//! ```rust
//! use incremental_trainer_rs::config::IncrementalTrainerConfig;
//!
//! let config = IncrementalTrainerConfig::builder()
//!     .total_classes(100)
//!     .step_size(10)
//!     .memory_budget(2000)
//!     .temperature(2.0)
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{IncrementalError, TrainResult};

/// Half-open index range clamped at epoch end by the peer distiller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClampRange {
    /// First index of the clamped window.
    pub start: usize,
    /// One past the last index of the clamped window.
    pub end: usize,
}

impl Default for ClampRange {
    fn default() -> Self {
        Self { start: 0, end: 80 }
    }
}

/// Main configuration for incremental training.
///
/// # Defaults
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `total_classes` | 100 | Size of the class universe |
/// | `step_size` | 10 | Classes revealed per increment |
/// | `memory_budget` | 2000 | Total exemplar capacity |
/// | `temperature` | 2.0 | Distillation temperature |
/// | `alpha` | 1.0 | Distillation loss weight |
/// | `base_class_count` | 50 | Raw-label boundary of the old/new batch partition |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalTrainerConfig {
    /// Size of the class universe (`dataset.classes`).
    #[serde(default = "default_total_classes")]
    pub total_classes: usize,

    /// Number of classes revealed per increment.
    #[serde(default = "default_step_size")]
    pub step_size: usize,

    /// Total exemplar memory capacity, floor-divided across the left-over
    /// classes at each setup phase.
    #[serde(default = "default_memory_budget")]
    pub memory_budget: usize,

    /// Base learning rate, restored at every setup phase.
    #[serde(default = "default_lr")]
    pub lr: f32,

    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f32,

    /// Optimizer weight decay.
    #[serde(default = "default_decay")]
    pub decay: f32,

    /// Epoch indices at which the learning rate decays.
    #[serde(default)]
    pub schedule: Vec<usize>,

    /// Per-schedule-point decay factors; must match `schedule` in length.
    #[serde(default)]
    pub gammas: Vec<f32>,

    /// Distillation temperature `T`.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Distillation loss weight; the distillation gradient contribution is
    /// scaled by `T * T * alpha`.
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Seed for the class release-order shuffle.
    #[serde(default)]
    pub seed: u64,

    /// Disable herding; exemplars are truncated to the first `k` instead of
    /// ranked by closeness to the class mean.
    #[serde(default)]
    pub no_herding: bool,

    /// Disable the distillation loss entirely.
    #[serde(default)]
    pub no_distill: bool,

    /// Disable the new-class loss once older classes exist.
    #[serde(default)]
    pub no_new_loss: bool,

    /// Replace the live model with freshly initialized weights at every
    /// frozen-model refresh. Requires a registered model factory.
    #[serde(default)]
    pub random_init: bool,

    /// Raw-label boundary of the batch partition: targets below this value
    /// are treated as the "old" partition, the rest as "new".
    #[serde(default = "default_base_class_count")]
    pub base_class_count: usize,

    /// Substring used to locate the final classification layer's weight
    /// matrix among named parameters.
    #[serde(default = "default_classifier_filter")]
    pub classifier_filter: String,

    /// Exponential decay applied to the classifier gradient-mass vector
    /// each batch (incremental training only; the peer distiller does not
    /// decay).
    #[serde(default = "default_grad_decay")]
    pub grad_decay: f64,

    /// Index window of both threshold vectors clamped to their maxima at
    /// the end of every peer-distillation epoch.
    #[serde(default)]
    pub peer_clamp: ClampRange,
}

fn default_total_classes() -> usize {
    100
}
fn default_step_size() -> usize {
    10
}
fn default_memory_budget() -> usize {
    2000
}
fn default_lr() -> f32 {
    0.1
}
fn default_momentum() -> f32 {
    0.9
}
fn default_decay() -> f32 {
    5e-4
}
fn default_temperature() -> f32 {
    2.0
}
fn default_alpha() -> f32 {
    1.0
}
fn default_base_class_count() -> usize {
    50
}
fn default_classifier_filter() -> String {
    "fc.weight".to_string()
}
fn default_grad_decay() -> f64 {
    0.99
}

impl Default for IncrementalTrainerConfig {
    fn default() -> Self {
        Self {
            total_classes: default_total_classes(),
            step_size: default_step_size(),
            memory_budget: default_memory_budget(),
            lr: default_lr(),
            momentum: default_momentum(),
            decay: default_decay(),
            schedule: Vec::new(),
            gammas: Vec::new(),
            temperature: default_temperature(),
            alpha: default_alpha(),
            seed: 0,
            no_herding: false,
            no_distill: false,
            no_new_loss: false,
            random_init: false,
            base_class_count: default_base_class_count(),
            classifier_filter: default_classifier_filter(),
            grad_decay: default_grad_decay(),
            peer_clamp: ClampRange::default(),
        }
    }
}

impl IncrementalTrainerConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> IncrementalTrainerConfigBuilder {
        IncrementalTrainerConfigBuilder::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> TrainResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| IncrementalError::config(format!("failed to read config file: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| IncrementalError::config(format!("failed to parse config: {e}")))
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> TrainResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| IncrementalError::config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| IncrementalError::config(format!("failed to write config file: {e}")))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first violated
    /// constraint.
    pub fn validate(&self) -> TrainResult<()> {
        if self.total_classes == 0 {
            return Err(IncrementalError::config("total_classes must be > 0"));
        }
        if self.step_size == 0 || self.step_size > self.total_classes {
            return Err(IncrementalError::config(
                "step_size must be in 1..=total_classes",
            ));
        }
        if self.lr <= 0.0 {
            return Err(IncrementalError::config("lr must be > 0"));
        }
        if self.temperature <= 0.0 {
            return Err(IncrementalError::config("temperature must be > 0"));
        }
        if self.alpha < 0.0 {
            return Err(IncrementalError::config("alpha must be >= 0"));
        }
        if self.schedule.len() != self.gammas.len() {
            return Err(IncrementalError::config(
                "schedule and gammas must have equal length",
            ));
        }
        if !(0.0..=1.0).contains(&self.grad_decay) || self.grad_decay == 0.0 {
            return Err(IncrementalError::config("grad_decay must be in (0, 1]"));
        }
        if self.peer_clamp.start > self.peer_clamp.end {
            return Err(IncrementalError::config(
                "peer_clamp.start must not exceed peer_clamp.end",
            ));
        }
        Ok(())
    }
}

/// Builder for [`IncrementalTrainerConfig`].
///
/// Starts from the default configuration; each setter overrides one field.
#[derive(Debug, Default)]
pub struct IncrementalTrainerConfigBuilder {
    config: IncrementalTrainerConfig,
}

impl IncrementalTrainerConfigBuilder {
    /// Sets the class universe size.
    #[must_use]
    pub fn total_classes(mut self, value: usize) -> Self {
        self.config.total_classes = value;
        self
    }

    /// Sets the number of classes revealed per increment.
    #[must_use]
    pub fn step_size(mut self, value: usize) -> Self {
        self.config.step_size = value;
        self
    }

    /// Sets the total exemplar memory capacity.
    #[must_use]
    pub fn memory_budget(mut self, value: usize) -> Self {
        self.config.memory_budget = value;
        self
    }

    /// Sets the base learning rate.
    #[must_use]
    pub fn lr(mut self, value: f32) -> Self {
        self.config.lr = value;
        self
    }

    /// Sets the SGD momentum.
    #[must_use]
    pub fn momentum(mut self, value: f32) -> Self {
        self.config.momentum = value;
        self
    }

    /// Sets the optimizer weight decay.
    #[must_use]
    pub fn decay(mut self, value: f32) -> Self {
        self.config.decay = value;
        self
    }

    /// Sets the learning-rate decay epochs.
    #[must_use]
    pub fn schedule(mut self, value: Vec<usize>) -> Self {
        self.config.schedule = value;
        self
    }

    /// Sets the per-schedule-point decay factors.
    #[must_use]
    pub fn gammas(mut self, value: Vec<f32>) -> Self {
        self.config.gammas = value;
        self
    }

    /// Sets the distillation temperature.
    #[must_use]
    pub fn temperature(mut self, value: f32) -> Self {
        self.config.temperature = value;
        self
    }

    /// Sets the distillation loss weight.
    #[must_use]
    pub fn alpha(mut self, value: f32) -> Self {
        self.config.alpha = value;
        self
    }

    /// Sets the release-order shuffle seed.
    #[must_use]
    pub fn seed(mut self, value: u64) -> Self {
        self.config.seed = value;
        self
    }

    /// Disables or enables herding-based exemplar selection.
    #[must_use]
    pub fn no_herding(mut self, value: bool) -> Self {
        self.config.no_herding = value;
        self
    }

    /// Disables or enables the distillation loss.
    #[must_use]
    pub fn no_distill(mut self, value: bool) -> Self {
        self.config.no_distill = value;
        self
    }

    /// Disables or enables the new-class loss once older classes exist.
    #[must_use]
    pub fn no_new_loss(mut self, value: bool) -> Self {
        self.config.no_new_loss = value;
        self
    }

    /// Enables random reinitialization at frozen-model refresh.
    #[must_use]
    pub fn random_init(mut self, value: bool) -> Self {
        self.config.random_init = value;
        self
    }

    /// Sets the raw-label partition boundary.
    #[must_use]
    pub fn base_class_count(mut self, value: usize) -> Self {
        self.config.base_class_count = value;
        self
    }

    /// Sets the classifier parameter name filter.
    #[must_use]
    pub fn classifier_filter(mut self, value: impl Into<String>) -> Self {
        self.config.classifier_filter = value.into();
        self
    }

    /// Sets the classifier gradient-mass decay factor.
    #[must_use]
    pub fn grad_decay(mut self, value: f64) -> Self {
        self.config.grad_decay = value;
        self
    }

    /// Sets the peer-distillation clamp window.
    #[must_use]
    pub fn peer_clamp(mut self, value: ClampRange) -> Self {
        self.config.peer_clamp = value;
        self
    }

    /// Finalizes the configuration.
    #[must_use]
    pub fn build(self) -> IncrementalTrainerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(IncrementalTrainerConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_overrides_fields() {
        let config = IncrementalTrainerConfig::builder()
            .total_classes(10)
            .step_size(2)
            .base_class_count(5)
            .temperature(3.0)
            .build();
        assert_eq!(config.total_classes, 10);
        assert_eq!(config.step_size, 2);
        assert_eq!(config.base_class_count, 5);
        assert!((config.temperature - 3.0).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mismatched_schedule_rejected() {
        let config = IncrementalTrainerConfig {
            schedule: vec![10, 20],
            gammas: vec![0.1],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_step_size_rejected() {
        let config = IncrementalTrainerConfig {
            step_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = IncrementalTrainerConfig::builder()
            .total_classes(10)
            .step_size(5)
            .seed(7)
            .build();
        let text = toml::to_string(&config).unwrap();
        let back: IncrementalTrainerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.total_classes, 10);
        assert_eq!(back.step_size, 5);
        assert_eq!(back.seed, 7);
    }
}
