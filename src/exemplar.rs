//! Exemplar memory budget allocation.
//!
//! When a class group finishes its training phase, its stored samples are
//! bounded: the total memory budget is floor-divided across the left-over
//! classes and each class's sample set is truncated, either arbitrarily
//! (first `k`) or by herding - keeping the `k` samples whose representation
//! under the frozen reference model is closest to the class mean.

use crate::error::{IncrementalError, TrainResult};
use crate::schedule::ClassSchedule;
use crate::{ClassId, DataSource, Model};

/// Result of one budget rebalance, mostly useful for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExemplarRebalance {
    /// Retained samples requested per class.
    pub per_class: usize,
    /// Classes whose memory was bounded by this rebalance.
    pub classes: Vec<ClassId>,
}

/// Splits a fixed memory budget across the left-over classes and asks the
/// data collaborator to truncate each class accordingly.
#[derive(Debug, Clone, Copy)]
pub struct ExemplarBudgetAllocator {
    memory_budget: usize,
    herding: bool,
}

impl ExemplarBudgetAllocator {
    /// Creates an allocator with the given total budget. `herding` selects
    /// representation-ranked truncation over plain truncation.
    #[must_use]
    pub fn new(memory_budget: usize, herding: bool) -> Self {
        Self {
            memory_budget,
            herding,
        }
    }

    /// Bounds the memory of every left-over class and promotes each to the
    /// older set. Drains `left_over`.
    ///
    /// # Errors
    ///
    /// [`IncrementalError::EmptyLeftOver`] when no classes are pending
    /// allocation (the per-class division would be undefined), or any error
    /// from the data collaborator.
    pub fn rebalance<M, D>(
        &self,
        schedule: &mut ClassSchedule,
        source: &mut D,
        reference: &mut M,
    ) -> TrainResult<ExemplarRebalance>
    where
        M: Model,
        D: DataSource<M>,
    {
        let left_over = schedule.take_left_over();
        if left_over.is_empty() {
            return Err(IncrementalError::EmptyLeftOver);
        }
        let per_class = self.memory_budget / left_over.len();
        tracing::info!(
            budget = self.memory_budget,
            classes = left_over.len(),
            per_class,
            herding = self.herding,
            "rebalancing exemplar memory"
        );
        for &id in &left_over {
            if self.herding {
                source.limit_class_and_sort(id, per_class, reference)?;
            } else {
                source.limit_class(id, per_class)?;
            }
            schedule.mark_older(id);
        }
        Ok(ExemplarRebalance {
            per_class,
            classes: left_over,
        })
    }
}
