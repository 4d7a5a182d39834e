//! Region Handle - A Tracked Address Range
//!
//! A region handle is the caller's view of a tracked range. It owns a dirty
//! flag, an optional one-shot pre-action, an optional precise action and
//! the volatility state of the range.
//!
//! # Structure
//!
//! The shared part, [`HandleCore`], is referenced from every virtual region
//! the handle overlaps. [`RegionHandle`] is the unique owner; disposing it
//! (or dropping it) detaches the core from all regions.
//!
//! # Dirty Storage
//!
//! The dirty flag is one bit in a [`ConcurrentBitmap`]. A stand-alone handle
//! owns a one-bit bitmap; granule handles of a
//! [`MultiRegionHandle`](crate::MultiRegionHandle) share one bitmap with one
//! bit per granule so the owner can scan whole words at once.
//!
//! # Locking
//!
//! The pre-action slot has its own reentrant lock. A pre-action is always
//! invoked with that lock held and the tracking lock released, so a
//! callback may freely re-register actions or reprotect handles. The lock
//! order is pre-action slot, then tracking state.

use super::volatility::{Volatility, VolatilityState};
use super::{TrackingInner, TrackingState};
use crate::bitmap::ConcurrentBitmap;
use crate::memory::{DirtyEvent, MemoryPermission, PreciseRegionSignal, RegionSignal};
use log::trace;
use parking_lot::{Mutex, MutexGuard, ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Unique key of a handle within its tracker
pub(crate) type HandleKey = u64;

/// Protected (page aligned) and requested ranges of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandleRange {
    pub address: u64,
    pub size: u64,
    pub real_address: u64,
    pub real_size: u64,
}

impl HandleRange {
    pub fn new(address: u64, size: u64, real_address: u64, real_size: u64) -> Self {
        Self {
            address,
            size,
            real_address,
            real_size,
        }
    }

    pub fn end_address(&self) -> u64 {
        self.address + self.size
    }

    pub fn real_end_address(&self) -> u64 {
        self.real_address + self.real_size
    }
}

/// A handle's dirty flag: one bit in a possibly shared bitmap
pub(crate) struct DirtyBit {
    bitmap: Arc<ConcurrentBitmap>,
    index: usize,
}

impl DirtyBit {
    pub fn new(bitmap: Arc<ConcurrentBitmap>, index: usize) -> Self {
        Self { bitmap, index }
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.bitmap.is_set(self.index)
    }

    /// Returns the previous value.
    #[inline]
    pub fn set(&self, value: bool) -> bool {
        self.bitmap.set_to(self.index, value)
    }
}

/// State of a handle shared with the virtual regions it overlaps
pub(crate) struct HandleCore {
    key: HandleKey,
    id: i32,
    range: HandleRange,
    dirty: DirtyBit,
    unmapped: AtomicBool,
    disposed: AtomicBool,

    /// Mirrors `pre_action.is_some()` whenever the slot lock is free.
    pre_action_pending: AtomicBool,
    pre_action: ReentrantMutex<RefCell<Option<RegionSignal>>>,
    precise_action: RwLock<Option<PreciseRegionSignal>>,
    dirty_events: RwLock<Vec<DirtyEvent>>,

    volatility: Mutex<Volatility>,
    parent_dirty: Option<Arc<AtomicBool>>,
}

impl HandleCore {
    pub fn new(
        key: HandleKey,
        id: i32,
        range: HandleRange,
        dirty: DirtyBit,
        mapped: bool,
        parent_dirty: Option<Arc<AtomicBool>>,
    ) -> Self {
        Self {
            key,
            id,
            range,
            dirty,
            unmapped: AtomicBool::new(!mapped),
            disposed: AtomicBool::new(false),
            pre_action_pending: AtomicBool::new(false),
            pre_action: ReentrantMutex::new(RefCell::new(None)),
            precise_action: RwLock::new(None),
            dirty_events: RwLock::new(Vec::new()),
            volatility: Mutex::new(Volatility::new()),
            parent_dirty,
        }
    }

    pub fn key(&self) -> HandleKey {
        self.key
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn range(&self) -> HandleRange {
        self.range
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn is_unmapped(&self) -> bool {
        self.unmapped.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn has_pre_action(&self) -> bool {
        self.pre_action_pending.load(Ordering::Acquire)
    }

    /// Protection this handle needs on its pages
    pub fn required_permission(&self) -> MemoryPermission {
        if self.is_unmapped() {
            MemoryPermission::READ_AND_WRITE
        } else if self.has_pre_action() {
            MemoryPermission::NONE
        } else if self.dirty.get() {
            MemoryPermission::READ_AND_WRITE
        } else {
            MemoryPermission::READ
        }
    }

    /// Set the dirty flag, notifying the parent on a set
    fn set_dirty(&self, value: bool) -> bool {
        let previous = self.dirty.set(value);
        if value {
            if let Some(parent) = &self.parent_dirty {
                parent.store(true, Ordering::Release);
            }
        }
        previous
    }

    fn mark_written(&self) {
        let was_dirty = self.set_dirty(true);
        if !was_dirty {
            for event in self.dirty_events.read().iter() {
                event();
            }
        }
    }

    /// Drop the pending pre-action without running it
    fn clear_pre_action(&self) {
        let slot = self.pre_action.lock();
        slot.borrow_mut().take();
        self.pre_action_pending.store(false, Ordering::Release);
    }

    /// Run the pending pre-action once, then clear it. Concurrent callers
    /// serialize on the slot lock; only the first finds an action.
    fn run_pre_action(&self, address: u64, size: u64) -> bool {
        let slot = self.pre_action.lock();
        let action = slot.borrow().clone();

        let Some(action) = action else {
            self.pre_action_pending.store(false, Ordering::Release);
            return false;
        };

        action(address, size);

        // Keep an action registered from inside the callback.
        let mut current = slot.borrow_mut();
        if current.as_ref().is_some_and(|a| Arc::ptr_eq(a, &action)) {
            *current = None;
            self.pre_action_pending.store(false, Ordering::Release);
        }

        true
    }

    /// Deliver an access inside a region this handle overlaps.
    ///
    /// Called with the tracking lock held through `guard`. The lock is
    /// released while a pre-action runs.
    pub fn signal(
        &self,
        tracking: &TrackingInner,
        guard: &mut MutexGuard<'_, TrackingState>,
        address: u64,
        size: u64,
        write: bool,
    ) {
        if self.is_unmapped() {
            if self.has_pre_action() {
                MutexGuard::unlocked(guard, || self.clear_pre_action());
            }
            return;
        }

        if self.has_pre_action() {
            let start = address.max(self.range.real_address);
            let end = address
                .saturating_add(size)
                .min(self.range.real_end_address());
            let clamped = end.saturating_sub(start);

            let fired = MutexGuard::unlocked(guard, || self.run_pre_action(start, clamped));
            if fired {
                tracking.record(|s| s.record_action_fired());
            }
        }

        if write {
            self.mark_written();
        }
    }

    /// Offer an access to the precise action first. Returns `true` if the
    /// precise action fully handled it.
    pub fn signal_precise(
        &self,
        tracking: &TrackingInner,
        guard: &mut MutexGuard<'_, TrackingState>,
        address: u64,
        size: u64,
        write: bool,
    ) -> bool {
        if !self.is_unmapped() {
            let precise = self.precise_action.read().clone();
            if let Some(precise) = precise {
                if precise(address, size, write) {
                    return true;
                }
            }
        }

        self.signal(tracking, guard, address, size, write);
        false
    }

    /// Mapping state changed under the handle
    pub fn signal_mapping_changed(&self, mapped: bool) {
        if self.unmapped.load(Ordering::Acquire) != mapped {
            return;
        }

        self.unmapped.store(!mapped, Ordering::Release);
        self.volatility.lock().clear();

        // Freshly mapped memory has unknown contents.
        self.set_dirty(mapped);
    }

    pub fn mark_disposed(&self) -> bool {
        self.disposed.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for HandleCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCore")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("range", &self.range)
            .field("dirty", &self.dirty.get())
            .field("unmapped", &self.is_unmapped())
            .finish_non_exhaustive()
    }
}

/// Tracks writes to one address range.
///
/// Created by [`MemoryTracking::begin_tracking`](crate::MemoryTracking::begin_tracking).
/// The handle is detached from the tracker when disposed or dropped.
pub struct RegionHandle {
    core: Arc<HandleCore>,
    tracking: Arc<TrackingInner>,
}

impl RegionHandle {
    pub(crate) fn new(core: Arc<HandleCore>, tracking: Arc<TrackingInner>) -> Self {
        Self { core, tracking }
    }

    pub(crate) fn core(&self) -> &Arc<HandleCore> {
        &self.core
    }

    /// Page aligned start of the protected range
    pub fn address(&self) -> u64 {
        self.core.range.address
    }

    /// Size of the protected range
    pub fn size(&self) -> u64 {
        self.core.range.size
    }

    pub fn end_address(&self) -> u64 {
        self.core.range.end_address()
    }

    /// Start of the range as requested by the caller
    pub fn real_address(&self) -> u64 {
        self.core.range.real_address
    }

    pub fn real_size(&self) -> u64 {
        self.core.range.real_size
    }

    pub fn real_end_address(&self) -> u64 {
        self.core.range.real_end_address()
    }

    /// Caller supplied id, used to exempt accesses made by the caller itself
    pub fn id(&self) -> i32 {
        self.core.id
    }

    pub fn dirty(&self) -> bool {
        self.core.dirty.get()
    }

    pub fn unmapped(&self) -> bool {
        self.core.is_unmapped()
    }

    pub fn is_volatile(&self) -> bool {
        self.core.volatility.lock().is_volatile()
    }

    pub fn volatility(&self) -> VolatilityState {
        self.core.volatility.lock().state()
    }

    /// Check the dirty flag for a consumer that will reprotect on `true`.
    ///
    /// Counts the check for the volatility heuristic and reports volatile
    /// handles as always dirty.
    pub fn dirty_or_volatile(&self) -> bool {
        let mut volatility = self.core.volatility.lock();
        volatility.record_check();
        volatility.is_volatile() || self.core.dirty.get()
    }

    /// Mark dirty without touching protection. The next reprotect will not
    /// see a protection change and so will not count toward volatility.
    pub fn force_dirty(&self) {
        self.core.set_dirty(true);
    }

    /// Consume the dirty state and re-apply protection.
    ///
    /// `as_dirty` keeps the handle dirty (no write protection). Does nothing
    /// for volatile handles.
    pub fn reprotect(&self, as_dirty: bool) {
        self.reprotect_with(as_dirty, false);
    }

    /// Like [`reprotect`](Self::reprotect), telling the volatility heuristic
    /// whether the previous check also found this handle dirty.
    pub fn reprotect_with(&self, as_dirty: bool, consecutive_check: bool) {
        if self.core.volatility.lock().is_volatile() {
            return;
        }

        self.core.dirty.set(as_dirty);

        let changed = {
            let mut state = self.tracking.state.lock();
            self.tracking
                .update_handle_protection(&mut state, self.core.key)
        };

        let became_volatile = self.core.volatility.lock().on_reprotect(
            changed,
            as_dirty,
            consecutive_check,
            self.core.has_pre_action(),
        );

        if became_volatile {
            self.tracking.record(|s| s.record_volatile());
            trace!(
                "handle {:#x}+{:#x} became volatile",
                self.real_address(),
                self.real_size()
            );
        }
    }

    /// Install a one-shot action run before the next access to the range.
    ///
    /// The range is fully protected until the action has run. Registering
    /// replaces any pending action and clears volatility.
    pub fn register_action(&self, action: RegionSignal) {
        self.core.volatility.lock().clear();

        let slot = self.core.pre_action.lock();
        let previous = slot.borrow_mut().replace(action);
        self.core.pre_action_pending.store(true, Ordering::Release);

        if previous.is_none() {
            let mut state = self.tracking.state.lock();
            self.tracking
                .update_handle_protection(&mut state, self.core.key);
        }
    }

    /// Install a persistent action consulted on precise accesses
    pub fn register_precise_action(&self, action: PreciseRegionSignal) {
        *self.core.precise_action.write() = Some(action);
    }

    /// Subscribe to clean to dirty transitions caused by writes
    pub fn register_dirty_event(&self, event: DirtyEvent) {
        self.core.dirty_events.write().push(event);
    }

    /// The pending pre-action, if any
    pub fn pre_action(&self) -> Option<RegionSignal> {
        let slot = self.core.pre_action.lock();
        let action = slot.borrow().clone();
        action
    }

    /// Whether `[address, address + size)` intersects the protected range
    pub fn overlaps_with(&self, address: u64, size: u64) -> bool {
        self.address() < address.saturating_add(size) && address < self.end_address()
    }

    /// Whether the requested range is exactly `[address, address + size)`
    pub fn range_equals(&self, address: u64, size: u64) -> bool {
        self.real_address() == address && self.real_size() == size
    }

    /// Stop tracking the range
    pub fn dispose(self) {
        // Detaches in Drop.
    }

    fn detach(&self) {
        let already = self.core.mark_disposed();
        assert!(!already, "region handle {:#x} disposed twice", self.core.key);

        let mut state = self.tracking.state.lock();
        self.tracking.detach_handle(&mut state, self.core.key);
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionHandle")
            .field("address", &self.address())
            .field("size", &self.size())
            .field("real_address", &self.real_address())
            .field("real_size", &self.real_size())
            .field("dirty", &self.dirty())
            .field("unmapped", &self.unmapped())
            .finish()
    }
}
