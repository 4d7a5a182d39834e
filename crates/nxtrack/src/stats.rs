//! Stats Module - Tracking Counters
//!
//! Counters for the costly or unusual paths of the tracker:
//! - Protection changes pushed to the memory manager
//! - Access signals dispatched to regions
//! - One-shot actions fired
//! - Handles that gave up on protection (volatile)
//! - Recoveries from a protected page with no region

use std::sync::atomic::{AtomicU64, Ordering};

/// TrackingStats - relaxed counters shared by the whole tracker
#[derive(Debug, Default)]
pub struct TrackingStats {
    protection_changes: AtomicU64,
    signals: AtomicU64,
    actions_fired: AtomicU64,
    volatile_handles: AtomicU64,
    race_recoveries: AtomicU64,
}

/// Point-in-time copy of [`TrackingStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub protection_changes: u64,
    pub signals: u64,
    pub actions_fired: u64,
    pub volatile_handles: u64,
    pub race_recoveries: u64,
}

impl TrackingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_protection_change(&self) {
        self.protection_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_signal(&self) {
        self.signals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_action_fired(&self) {
        self.actions_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_volatile(&self) {
        self.volatile_handles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_race_recovery(&self) {
        self.race_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            protection_changes: self.protection_changes.load(Ordering::Relaxed),
            signals: self.signals.load(Ordering::Relaxed),
            actions_fired: self.actions_fired.load(Ordering::Relaxed),
            volatile_handles: self.volatile_handles.load(Ordering::Relaxed),
            race_recoveries: self.race_recoveries.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero
    pub fn reset(&self) {
        self.protection_changes.store(0, Ordering::Relaxed);
        self.signals.store(0, Ordering::Relaxed);
        self.actions_fired.store(0, Ordering::Relaxed);
        self.volatile_handles.store(0, Ordering::Relaxed);
        self.race_recoveries.store(0, Ordering::Relaxed);
    }
}
