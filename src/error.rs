//! Error types for class-incremental training.
//!
//! Every error here is terminal for the current phase: an exhausted class
//! schedule, a zero-length budget division, a missing frozen snapshot, or a
//! numeric anomaly has no sensible recovery path in an offline training
//! run, so callers are expected to propagate and abort rather than retry.
//!
//! # Error Categories
//!
//! - **Configuration errors**: invalid parameters, empty left-over set at
//!   budget-allocation time, revealing more classes than remain.
//! - **State-consistency errors**: training before any class is revealed,
//!   or distilling against a frozen model that was never initialized.
//! - **Numeric anomalies**: NaN or infinity surfacing in a loss or in soft
//!   pseudo-targets. These are detected and reported loudly rather than
//!   silently propagated through the KL divergence.
//! - **Collaborator errors**: failures reported by the model or the
//!   data-providing iterators.

use thiserror::Error;

/// The main error type for incremental training.
///
/// Each variant carries enough context to diagnose the failure without a
/// debugger attached.
#[derive(Debug, Error)]
pub enum IncrementalError {
    /// Invalid configuration value or combination.
    #[error("configuration error: {detail}")]
    Config {
        /// Description of the configuration issue.
        detail: String,
    },

    /// More classes were requested from the release order than remain.
    #[error("class schedule exhausted: requested {requested}, only {remaining} remaining")]
    ScheduleExhausted {
        /// Number of classes the caller asked to reveal.
        requested: usize,
        /// Number of classes still pending in the release order.
        remaining: usize,
    },

    /// Exemplar budget allocation was attempted with no left-over classes.
    ///
    /// The per-class budget is `memory_budget / |left_over|`; a zero-length
    /// left-over set makes the division undefined and indicates a phase
    /// ordering bug in the caller.
    #[error("exemplar budget allocation with empty left-over class set")]
    EmptyLeftOver,

    /// Training was attempted before any class had been revealed.
    #[error("no classes revealed: call reveal_next_group before training")]
    NoRevealedClasses,

    /// Distillation requires a frozen snapshot that was never taken.
    #[error("frozen model snapshot missing: refresh was never called")]
    MissingFrozenModel,

    /// NaN or infinity detected in a loss value or pseudo-target.
    #[error("numeric anomaly during epoch {epoch}: {detail}")]
    NumericalAnomaly {
        /// What went non-finite and where.
        detail: String,
        /// The epoch in which the anomaly surfaced.
        epoch: usize,
    },

    /// The model collaborator reported a failure.
    #[error("model error: {reason}")]
    Model {
        /// Description of the model failure.
        reason: String,
    },

    /// A data-providing collaborator reported a failure.
    #[error("data source error: {reason}")]
    Data {
        /// Description of the data source failure.
        reason: String,
    },
}

/// Result alias used throughout the crate.
pub type TrainResult<T> = Result<T, IncrementalError>;

impl IncrementalError {
    /// Builds a [`IncrementalError::Config`] from anything displayable.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    /// Builds a [`IncrementalError::Model`] from anything displayable.
    pub fn model(reason: impl Into<String>) -> Self {
        Self::Model {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_exhausted_display_includes_counts() {
        let err = IncrementalError::ScheduleExhausted {
            requested: 5,
            remaining: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains('5') && msg.contains('2'));
    }

    #[test]
    fn numeric_anomaly_display_includes_epoch() {
        let err = IncrementalError::NumericalAnomaly {
            detail: "distillation loss is NaN".to_string(),
            epoch: 3,
        };
        assert!(err.to_string().contains("epoch 3"));
    }
}
