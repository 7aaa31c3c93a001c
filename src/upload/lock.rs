//! Per-fingerprint assembly locks
//!
//! In-process exclusion only. A store shared between nodes needs a
//! distributed lock in front of this.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use super::types::Fingerprint;

/// Registry of fingerprints with an assembly in flight
#[derive(Clone, Default)]
pub struct AssemblyLocks {
    held: Arc<Mutex<HashSet<Fingerprint>>>,
}

impl AssemblyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `fingerprint` without waiting.
    ///
    /// Returns `None` if another assembly holds it.
    pub fn try_acquire(&self, fingerprint: &Fingerprint) -> Option<AssemblyLockGuard> {
        let mut held = self.held.lock();
        if !held.insert(fingerprint.clone()) {
            return None;
        }

        Some(AssemblyLockGuard {
            held: Arc::clone(&self.held),
            fingerprint: fingerprint.clone(),
        })
    }

    pub fn is_held(&self, fingerprint: &Fingerprint) -> bool {
        self.held.lock().contains(fingerprint)
    }

    /// Number of assemblies currently running
    pub fn active(&self) -> usize {
        self.held.lock().len()
    }
}

/// Exclusive assembly token; released on drop
pub struct AssemblyLockGuard {
    held: Arc<Mutex<HashSet<Fingerprint>>>,
    fingerprint: Fingerprint,
}

impl AssemblyLockGuard {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for AssemblyLockGuard {
    fn drop(&mut self) {
        self.held.lock().remove(&self.fingerprint);
        tracing::trace!(fingerprint = %self.fingerprint, "Assembly lock released");
    }
}
