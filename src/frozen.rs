//! Frozen model snapshot management.
//!
//! The frozen model is a deep, parameter-frozen copy of the live model
//! taken at phase boundaries. It is replaced wholesale at every refresh:
//! an explicit value copy rather than a shared reference, so later live
//! updates can never corrupt the snapshot. A refresh is a hard boundary:
//! no batch may straddle it.

use crate::error::{IncrementalError, TrainResult};
use crate::{Mode, Model};

/// Owns the read-only snapshot used to produce soft pseudo-targets.
#[derive(Debug, Clone)]
pub struct FrozenModelManager<M> {
    snapshot: Option<M>,
}

impl<M: Model + Clone> FrozenModelManager<M> {
    /// Creates a manager with no snapshot taken yet.
    #[must_use]
    pub fn empty() -> Self {
        Self { snapshot: None }
    }

    /// Creates a manager whose initial snapshot is taken from `live`.
    #[must_use]
    pub fn from_live(live: &M) -> Self {
        let mut manager = Self::empty();
        manager.install(live.clone());
        manager
    }

    /// Replaces the snapshot with a deep copy of the live model.
    ///
    /// The live model is switched to evaluation mode first (as it would be
    /// at any phase boundary); the copy has every parameter frozen and is
    /// itself in evaluation mode. Any prior snapshot is discarded.
    pub fn refresh(&mut self, live: &mut M) {
        live.set_mode(Mode::Eval);
        self.install(live.clone());
        tracing::info!("frozen model snapshot refreshed");
    }

    fn install(&mut self, mut copy: M) {
        copy.freeze();
        copy.set_mode(Mode::Eval);
        self.snapshot = Some(copy);
    }

    /// True once a snapshot exists.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Mutable access to the snapshot (forward passes take `&mut self`;
    /// the parameters stay frozen).
    ///
    /// # Errors
    ///
    /// [`IncrementalError::MissingFrozenModel`] if no snapshot was taken.
    pub fn snapshot_mut(&mut self) -> TrainResult<&mut M> {
        self.snapshot
            .as_mut()
            .ok_or(IncrementalError::MissingFrozenModel)
    }

    /// Shared access to the snapshot.
    ///
    /// # Errors
    ///
    /// [`IncrementalError::MissingFrozenModel`] if no snapshot was taken.
    pub fn snapshot(&self) -> TrainResult<&M> {
        self.snapshot
            .as_ref()
            .ok_or(IncrementalError::MissingFrozenModel)
    }
}
