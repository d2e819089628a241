//! Class release scheduling.
//!
//! The class universe is shuffled once at construction with a seeded RNG
//! and consumed strictly from the tail as class groups are revealed. The
//! schedule also keeps the incremental bookkeeping sets: `revealed` (ids
//! visible to training/testing), `left_over` (most recently revealed ids,
//! pending exemplar-budget allocation), and `older` (append-only set of
//! ids that have completed a setup cycle).

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{IncrementalError, TrainResult};
use crate::ClassId;
use crate::ClassVisibility;

/// Deterministic incremental-release order over the class universe.
#[derive(Debug, Clone)]
pub struct ClassSchedule {
    pending: Vec<ClassId>,
    revealed: Vec<ClassId>,
    left_over: Vec<ClassId>,
    older: Vec<ClassId>,
}

impl ClassSchedule {
    /// Builds a schedule over the universe `0..total_classes`, shuffled
    /// once with the given seed. The order is never reshuffled.
    #[must_use]
    pub fn new(total_classes: usize, seed: u64) -> Self {
        let mut pending: Vec<ClassId> = (0..total_classes).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        pending.shuffle(&mut rng);
        Self {
            pending,
            revealed: Vec::new(),
            left_over: Vec::new(),
            older: Vec::new(),
        }
    }

    /// Pops `count` ids off the release order and makes them visible on
    /// every registered sink. The popped ids join both `revealed` and
    /// `left_over`.
    ///
    /// # Errors
    ///
    /// [`IncrementalError::ScheduleExhausted`] if fewer than `count` ids
    /// remain; the release order is left untouched in that case.
    pub fn reveal_next(
        &mut self,
        count: usize,
        sinks: &mut [&mut dyn ClassVisibility],
    ) -> TrainResult<Vec<ClassId>> {
        if self.pending.len() < count {
            return Err(IncrementalError::ScheduleExhausted {
                requested: count,
                remaining: self.pending.len(),
            });
        }
        tracing::debug!(remaining = self.pending.len(), count, "revealing class group");
        let mut group = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.pending.pop().expect("length checked above");
            for sink in sinks.iter_mut() {
                sink.add_class(id);
            }
            self.revealed.push(id);
            self.left_over.push(id);
            group.push(id);
        }
        Ok(group)
    }

    /// Reveals `hi - lo` ids for evaluation visibility without exemplar
    /// memory: every sink gains the classes, and evaluation-only sinks
    /// additionally receive `limit_class(idx, 0)` for each index in
    /// `[lo, hi)`. The popped ids do not join `left_over`.
    ///
    /// # Errors
    ///
    /// [`IncrementalError::ScheduleExhausted`] if fewer ids remain than the
    /// range requires, or a sink error from `limit_class`.
    pub fn reveal_range(
        &mut self,
        lo: usize,
        hi: usize,
        train_sinks: &mut [&mut dyn ClassVisibility],
        eval_sinks: &mut [&mut dyn ClassVisibility],
    ) -> TrainResult<Vec<ClassId>> {
        let count = hi.saturating_sub(lo);
        if self.pending.len() < count {
            return Err(IncrementalError::ScheduleExhausted {
                requested: count,
                remaining: self.pending.len(),
            });
        }
        tracing::debug!(remaining = self.pending.len(), lo, hi, "revealing class range");
        let mut group = Vec::with_capacity(count);
        for idx in lo..hi {
            let id = self.pending.pop().expect("length checked above");
            for sink in train_sinks.iter_mut() {
                sink.add_class(id);
            }
            for sink in eval_sinks.iter_mut() {
                sink.add_class(id);
                sink.limit_class(idx, 0)?;
            }
            self.revealed.push(id);
            group.push(id);
        }
        Ok(group)
    }

    /// Marks a class as older (having gained bounded exemplar memory).
    /// Idempotent; `older` is append-only.
    pub fn mark_older(&mut self, id: ClassId) {
        if !self.older.contains(&id) {
            self.older.push(id);
        }
    }

    /// Drains the left-over set, returning the ids pending budget
    /// allocation.
    pub fn take_left_over(&mut self) -> Vec<ClassId> {
        std::mem::take(&mut self.left_over)
    }

    /// Ids still pending in the release order.
    #[must_use]
    pub fn pending(&self) -> &[ClassId] {
        &self.pending
    }

    /// Ids visible to training/testing, in reveal order.
    #[must_use]
    pub fn revealed(&self) -> &[ClassId] {
        &self.revealed
    }

    /// Most recently revealed ids, pending budget allocation.
    #[must_use]
    pub fn left_over(&self) -> &[ClassId] {
        &self.left_over
    }

    /// Ids that have completed at least one setup cycle.
    #[must_use]
    pub fn older(&self) -> &[ClassId] {
        &self.older
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct RecordingSink {
        added: Vec<ClassId>,
        limited: Vec<(ClassId, usize)>,
    }

    impl ClassVisibility for RecordingSink {
        fn add_class(&mut self, id: ClassId) {
            self.added.push(id);
        }

        fn limit_class(&mut self, id: ClassId, k: usize) -> TrainResult<()> {
            self.limited.push((id, k));
            Ok(())
        }
    }

    #[test]
    fn shuffle_is_deterministic_per_seed() {
        let a = ClassSchedule::new(10, 42);
        let b = ClassSchedule::new(10, 42);
        let c = ClassSchedule::new(10, 43);
        assert_eq!(a.pending(), b.pending());
        assert_ne!(a.pending(), c.pending());
        let universe: BTreeSet<_> = a.pending().iter().copied().collect();
        assert_eq!(universe.len(), 10);
    }

    #[test]
    fn reveal_next_pops_from_tail_and_fans_out() {
        let mut schedule = ClassSchedule::new(10, 1);
        let expected: Vec<ClassId> = schedule.pending().iter().rev().take(3).copied().collect();
        let mut sink = RecordingSink::default();
        let group = schedule
            .reveal_next(3, &mut [&mut sink as &mut dyn ClassVisibility])
            .unwrap();
        assert_eq!(group, expected);
        assert_eq!(sink.added, expected);
        assert_eq!(schedule.left_over(), &group[..]);
        assert_eq!(schedule.revealed(), &group[..]);
        assert_eq!(schedule.pending().len(), 7);
    }

    #[test]
    fn reveal_next_exhausts_then_errors() {
        let mut schedule = ClassSchedule::new(10, 7);
        schedule.reveal_next(5, &mut []).unwrap();
        schedule.reveal_next(5, &mut []).unwrap();
        assert!(schedule.pending().is_empty());
        let err = schedule.reveal_next(5, &mut []).unwrap_err();
        assert!(matches!(
            err,
            IncrementalError::ScheduleExhausted {
                requested: 5,
                remaining: 0
            }
        ));
    }

    #[test]
    fn reveal_range_limits_eval_sinks_only() {
        let mut schedule = ClassSchedule::new(10, 3);
        let mut train = RecordingSink::default();
        let mut eval = RecordingSink::default();
        let group = schedule
            .reveal_range(
                2,
                4,
                &mut [&mut train as &mut dyn ClassVisibility],
                &mut [&mut eval as &mut dyn ClassVisibility],
            )
            .unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(train.added, group);
        assert!(train.limited.is_empty());
        assert_eq!(eval.added, group);
        assert_eq!(eval.limited, vec![(2, 0), (3, 0)]);
        // Visibility without exemplar memory: left_over untouched.
        assert!(schedule.left_over().is_empty());
    }

    #[test]
    fn mark_older_is_append_only_and_deduplicated() {
        let mut schedule = ClassSchedule::new(4, 0);
        schedule.mark_older(2);
        schedule.mark_older(1);
        schedule.mark_older(2);
        assert_eq!(schedule.older(), &[2, 1]);
    }
}
