//! Shared/exclusive gate over the three queues of a site
//!
//! Every public single-queue operation holds the shared side. Cross-queue moves,
//! reclamation scans, and backup snapshots hold the exclusive side, so they
//! observe and mutate the three queues as of a single instant.
//!
//! While holding an [`ExclusiveSection`] use the queue methods that take the
//! section (`put_in`, `remove_in`, ...). The plain methods take the shared side
//! and would deadlock.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Default)]
pub struct QueueGate {
    lock: Arc<RwLock<()>>,
}

/// Proof that the shared side of a gate is held
pub struct SharedSection<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Proof that the exclusive side of a gate is held
pub struct ExclusiveSection<'a> {
    gate: &'a QueueGate,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl QueueGate {
    pub fn new() -> Self {
        Self::default()
    }

    // The lock guards no data, so a panic elsewhere cannot leave it inconsistent.
    pub fn shared(&self) -> SharedSection<'_> {
        SharedSection {
            _guard: self.lock.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn exclusive(&self) -> ExclusiveSection<'_> {
        ExclusiveSection {
            gate: self,
            _guard: self.lock.write().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Returns true if both handles refer to the same gate
    pub fn same_as(&self, other: &QueueGate) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }
}

impl ExclusiveSection<'_> {
    /// Returns true if this section was taken on `gate`
    pub fn belongs_to(&self, gate: &QueueGate) -> bool {
        self.gate.same_as(gate)
    }
}
