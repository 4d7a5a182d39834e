//! Tracking Module - Write Tracking over Virtual Memory
//!
//! [`MemoryTracking`] keeps the virtual regions of two address-space views
//! (host and guest), creates region handles over them and routes faulting
//! accesses to the handles they concern.
//!
//! # Protection Model
//!
//! Every region carries the strictest protection any of its handles needs:
//!
//! | Handle state            | Needs            |
//! |-------------------------|------------------|
//! | unmapped                | read and write   |
//! | pre-action pending      | none             |
//! | dirty                   | read and write   |
//! | clean                   | read only        |
//!
//! A write to a read-only page faults into [`MemoryTracking::virtual_memory_event`],
//! which marks the overlapping handles dirty and lifts the protection so the
//! write can complete. Reprotecting a handle consumes its dirty state.
//!
//! # Locking
//!
//! One mutex guards both region lists and the handle-to-region links. It is
//! released while a pre-action runs. Precise actions and dirty events run
//! with it held and must not call back into the tracker.

mod handle;
mod multi;
mod region;
mod smart;
mod volatility;

pub use handle::RegionHandle;
pub use multi::MultiRegionHandle;
pub use smart::SmartMultiRegionHandle;
pub use volatility::{VolatilityState, CHECK_COUNT_FOR_INFREQUENT, VOLATILE_THRESHOLD};

use self::handle::{DirtyBit, HandleCore, HandleKey, HandleRange};
use self::region::{RegionRef, VirtualRegion};
use crate::bitmap::ConcurrentBitmap;
use crate::config::TrackingConfig;
use crate::error::{Result, TrackingError};
use crate::memory::page::{align_down, page_align};
use crate::memory::{InvalidAccessHandler, MemoryPermission, RegionFlags, VirtualMemoryManager};
use crate::stats::TrackingStats;
use log::{debug, error, trace, warn};
use nxtrack_util::{checked_end, NonOverlappingRange, RangeList};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// How an access reported to [`MemoryTracking::virtual_memory_event_with`]
/// should be delivered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventOptions {
    /// Offer the access to precise actions first
    pub precise: bool,

    /// Skip handles created with this id
    pub exempt_id: Option<i32>,

    /// The access address is in the guest view
    pub guest: bool,
}

/// Region lists and handle links, guarded by the tracking lock
pub(crate) struct TrackingState {
    host: RangeList<VirtualRegion>,
    guest: RangeList<VirtualRegion>,

    /// Every region each live handle is attached to, in both views
    links: FxHashMap<HandleKey, Vec<RegionRef>>,
}

impl TrackingState {
    fn new() -> Self {
        Self {
            host: RangeList::new(),
            guest: RangeList::new(),
            links: FxHashMap::default(),
        }
    }

    fn view(&self, guest: bool) -> &RangeList<VirtualRegion> {
        if guest {
            &self.guest
        } else {
            &self.host
        }
    }

    fn view_mut(&mut self, guest: bool) -> &mut RangeList<VirtualRegion> {
        if guest {
            &mut self.guest
        } else {
            &mut self.host
        }
    }

    fn region(&self, r: RegionRef) -> Option<&VirtualRegion> {
        self.view(r.guest).get(r.address)
    }

    fn region_mut(&mut self, r: RegionRef) -> Option<&mut VirtualRegion> {
        self.view_mut(r.guest).get_mut(r.address)
    }

    /// Split the region containing `at`, linking the upper half to every
    /// handle of the original region.
    fn split_region(&mut self, guest: bool, at: u64) {
        if !self.view_mut(guest).split_at(at) {
            return;
        }

        trace!("split {} region at {:#x}", if guest { "guest" } else { "host" }, at);

        let upper = RegionRef { guest, address: at };
        let keys: Vec<HandleKey> = match self.region(upper) {
            Some(region) => region.handles.iter().map(|h| h.key()).collect(),
            None => return,
        };

        for key in keys {
            if let Some(refs) = self.links.get_mut(&key) {
                refs.push(upper);
            }
        }
    }

    /// Regions exactly covering `[address, address + size)` in one view,
    /// creating and splitting as needed
    fn regions_for(&mut self, address: u64, size: u64, guest: bool) -> Vec<RegionRef> {
        self.split_region(guest, address);
        self.split_region(guest, address + size);

        self.view_mut(guest)
            .get_or_add(address, size, |a, s| VirtualRegion::new(a, s, guest))
            .into_iter()
            .map(|address| RegionRef { guest, address })
            .collect()
    }
}

/// Parameters of a handle being created
pub(crate) struct HandleSpec {
    pub address: u64,
    pub size: u64,
    pub id: i32,
    pub flags: RegionFlags,
    pub dirty: DirtyBit,
    pub parent_dirty: Option<Arc<AtomicBool>>,

    /// Handle being replaced. Its dirty flag is read under the same lock
    /// hold that attaches the new handle, so no write falls in between.
    pub inherit: Option<Arc<HandleCore>>,
}

pub(crate) struct TrackingInner {
    memory_manager: Arc<dyn VirtualMemoryManager>,
    invalid_access_handler: Option<InvalidAccessHandler>,
    config: TrackingConfig,
    stats: TrackingStats,
    next_key: AtomicU64,
    pub(crate) state: Mutex<TrackingState>,
}

impl TrackingInner {
    pub(crate) fn page_size(&self) -> u64 {
        self.config.page_size
    }

    /// Run `f` against the stats if they are enabled
    #[inline]
    pub(crate) fn record(&self, f: impl FnOnce(&TrackingStats)) {
        if self.config.stats_enabled {
            f(&self.stats);
        }
    }

    /// Apply the region's required protection if it differs from the last
    /// applied one. Returns `true` if protection changed.
    pub(crate) fn update_protection(&self, state: &mut TrackingState, r: RegionRef) -> bool {
        let Some(region) = state.region_mut(r) else {
            return false;
        };

        let permission = region.required_permission();
        if region.last_permission == Some(permission) {
            return false;
        }

        region.last_permission = Some(permission);
        trace!(
            "protect {:#x}+{:#x} {} (guest {})",
            region.address(),
            region.size(),
            permission,
            region.guest()
        );
        self.memory_manager.tracking_reprotect(
            region.address(),
            region.size(),
            permission,
            region.guest(),
        );
        self.record(|s| s.record_protection_change());
        true
    }

    /// Update every region a handle is attached to. Returns `true` if any
    /// protection changed.
    pub(crate) fn update_handle_protection(&self, state: &mut TrackingState, key: HandleKey) -> bool {
        let refs = state.links.get(&key).cloned().unwrap_or_default();

        let mut changed = false;
        for r in refs {
            changed |= self.update_protection(state, r);
        }
        changed
    }

    /// Remove a handle from its regions, dropping regions left empty
    pub(crate) fn detach_handle(&self, state: &mut TrackingState, key: HandleKey) {
        let refs = state.links.remove(&key).unwrap_or_default();

        for r in refs {
            let empty = match state.region_mut(r) {
                Some(region) => {
                    region.remove_handle(key);
                    region.handles.is_empty()
                }
                None => continue,
            };

            self.update_protection(state, r);

            if empty {
                state.view_mut(r.guest).remove(r.address);
            }
        }
    }

    /// Guest range a handle must cover so that accesses reported by their
    /// first byte still hit it
    fn unaligned_safe_region(&self, address: u64, size: u64) -> (u64, u64) {
        let page_size = self.page_size();
        if self.config.single_byte_guest_tracking && address >= page_size {
            (address - page_size, size + page_size)
        } else {
            (address, size)
        }
    }

    pub(crate) fn create_handle(self: &Arc<Self>, request: HandleSpec) -> RegionHandle {
        let (address, size) = page_align(request.address, request.size, self.page_size());
        let range = HandleRange::new(address, size, request.address, request.size);
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();

        let mapped = self.memory_manager.is_range_mapped(request.address, request.size);
        let dirty = match &request.inherit {
            Some(source) => mapped && source.is_dirty(),
            None => mapped,
        };
        request.dirty.set(dirty);

        let core = Arc::new(HandleCore::new(
            key,
            request.id,
            range,
            request.dirty,
            mapped,
            request.parent_dirty,
        ));

        let (guest_address, guest_size) = if request.flags.contains(RegionFlags::UNALIGNED_ACCESS) {
            self.unaligned_safe_region(address, size)
        } else {
            (address, size)
        };

        let mut refs = state.regions_for(address, size, false);
        refs.extend(state.regions_for(guest_address, guest_size, true));

        for r in &refs {
            if let Some(region) = state.region_mut(*r) {
                region.handles.push(Arc::clone(&core));
            }
        }
        state.links.insert(key, refs);

        if self.config.verbose {
            debug!(
                "tracking {:#x}+{:#x} (protected {:#x}+{:#x}, id {}, mapped {})",
                request.address, request.size, address, size, request.id, mapped
            );
        }

        RegionHandle::new(core, Arc::clone(self))
    }

    /// Forward a mapping change to a region. Only host regions notify their
    /// handles, so each handle sees the change once.
    fn region_mapping_changed(&self, region: &mut VirtualRegion, mapped: bool) {
        region.last_permission = None;

        if region.guest() {
            return;
        }

        for handle in &region.handles {
            let range = handle.range();
            if !mapped
                || self
                    .memory_manager
                    .is_range_mapped(range.real_address, range.real_size)
            {
                handle.signal_mapping_changed(mapped);
            }
        }
    }

    fn signal_region(
        &self,
        guard: &mut MutexGuard<'_, TrackingState>,
        r: RegionRef,
        address: u64,
        size: u64,
        write: bool,
        options: &EventOptions,
    ) {
        // Snapshot: the list may change while the lock is released for a
        // pre-action.
        let handles = match guard.region(r) {
            Some(region) => region.handles.clone(),
            None => return,
        };

        self.record(|s| s.record_signal());
        trace!(
            "signal {:#x}+{:#x} write {} to {} handles",
            address,
            size,
            write,
            handles.len()
        );

        let mut all_precise = true;
        for handle in &handles {
            if handle.is_disposed() || options.exempt_id == Some(handle.id()) {
                continue;
            }

            if options.precise {
                all_precise &= handle.signal_precise(self, guard, address, size, write);
            } else {
                handle.signal(self, guard, address, size, write);
            }
        }

        if !options.precise || !all_precise {
            self.update_protection(guard, r);
        }
    }
}

/// Write tracker over one virtual memory manager.
///
/// Cloning is cheap and yields another reference to the same tracker.
///
/// # Examples
///
/// ```rust,ignore
/// let tracking = MemoryTracking::new(memory_manager, TrackingConfig::default())?;
/// let handle = tracking.begin_tracking(0x10000, 0x2000, 0)?;
///
/// handle.reprotect(false);                        // clean, write protected
/// tracking.virtual_memory_event(0x10010, 4, true)?;
/// assert!(handle.dirty());
/// ```
#[derive(Clone)]
pub struct MemoryTracking {
    inner: Arc<TrackingInner>,
}

impl MemoryTracking {
    /// Create a tracker with no invalid access handler
    pub fn new(
        memory_manager: Arc<dyn VirtualMemoryManager>,
        config: TrackingConfig,
    ) -> Result<Self> {
        Self::with_invalid_access_handler(memory_manager, config, None)
    }

    /// Create a tracker that reports accesses to untracked, unmapped
    /// memory to `handler`
    pub fn with_invalid_access_handler(
        memory_manager: Arc<dyn VirtualMemoryManager>,
        config: TrackingConfig,
        handler: Option<InvalidAccessHandler>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(TrackingInner {
                memory_manager,
                invalid_access_handler: handler,
                config,
                stats: TrackingStats::new(),
                next_key: AtomicU64::new(0),
                state: Mutex::new(TrackingState::new()),
            }),
        })
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &TrackingStats {
        &self.inner.stats
    }

    pub fn page_size(&self) -> u64 {
        self.inner.page_size()
    }

    /// Track writes to `[address, address + size)`.
    ///
    /// Protection covers the enclosing pages. The handle starts dirty if the
    /// range is mapped.
    pub fn begin_tracking(&self, address: u64, size: u64, id: i32) -> Result<RegionHandle> {
        self.begin_tracking_with_flags(address, size, id, RegionFlags::empty())
    }

    pub fn begin_tracking_with_flags(
        &self,
        address: u64,
        size: u64,
        id: i32,
        flags: RegionFlags,
    ) -> Result<RegionHandle> {
        checked_end(address, size)?;

        let bitmap = Arc::new(ConcurrentBitmap::new(1, false));
        Ok(self.inner.create_handle(HandleSpec {
            address,
            size,
            id,
            flags,
            dirty: DirtyBit::new(bitmap, 0),
            parent_dirty: None,
            inherit: None,
        }))
    }

    /// Track a range as fixed granules.
    ///
    /// `seeds` are existing handles inside the range whose dirty state and
    /// pending pre-actions carry over to the granules they cover. They are
    /// consumed.
    pub fn begin_granular_tracking(
        &self,
        address: u64,
        size: u64,
        seeds: Vec<RegionHandle>,
        granularity: u64,
        id: i32,
    ) -> Result<MultiRegionHandle> {
        checked_end(address, size)?;
        self.validate_granularity(granularity)?;

        MultiRegionHandle::new(Arc::clone(&self.inner), address, size, seeds, granularity, id)
    }

    /// Track a range with handles created lazily and split on demand
    pub fn begin_smart_granular_tracking(
        &self,
        address: u64,
        size: u64,
        granularity: u64,
        id: i32,
    ) -> Result<SmartMultiRegionHandle> {
        checked_end(address, size)?;
        self.validate_granularity(granularity)?;

        let (address, size) = page_align(address, size, self.page_size());
        Ok(SmartMultiRegionHandle::new(
            Arc::clone(&self.inner),
            address,
            size,
            granularity,
            id,
        ))
    }

    fn validate_granularity(&self, granularity: u64) -> Result<()> {
        if granularity == 0 || granularity % self.page_size() != 0 {
            return Err(TrackingError::InvalidArgument(format!(
                "granularity {:#x} is not a non-zero multiple of the page size {:#x}",
                granularity,
                self.page_size()
            )));
        }
        Ok(())
    }

    /// The memory manager mapped `[va, va + size)`.
    ///
    /// Handles whose whole range is now mapped become mapped and dirty.
    /// Fully mapped regions forget their last protection, and every
    /// overlapping region has its protection updated.
    pub fn map(&self, va: u64, size: u64) {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if inner.config.verbose {
            debug!("map {:#x}+{:#x}", va, size);
        }

        for guest in [false, true] {
            let overlaps = state.view(guest).find_overlaps(va, size);
            for address in overlaps {
                let r = RegionRef { guest, address };

                let Some(region) = state.region_mut(r) else {
                    continue;
                };

                if inner
                    .memory_manager
                    .is_range_mapped(region.address(), region.size())
                {
                    inner.region_mapping_changed(region, true);
                }

                inner.update_protection(&mut state, r);
            }
        }
    }

    /// The memory manager unmapped `[va, va + size)`.
    ///
    /// Overlapping handles become unmapped and clean, and pending
    /// pre-actions are dropped on their next signal.
    pub fn unmap(&self, va: u64, size: u64) {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if inner.config.verbose {
            debug!("unmap {:#x}+{:#x}", va, size);
        }

        for guest in [false, true] {
            let overlaps = state.view(guest).find_overlaps(va, size);
            for address in overlaps {
                if let Some(region) = state.region_mut(RegionRef { guest, address }) {
                    inner.region_mapping_changed(region, false);
                }
            }
        }
    }

    /// Report a host access that hit a protected page
    pub fn virtual_memory_event(&self, address: u64, size: u64, write: bool) -> Result<()> {
        self.virtual_memory_event_with(address, size, write, EventOptions::default())
    }

    /// Report an access that hit a protected page.
    ///
    /// Every overlapping handle is signalled, then the protection of the
    /// touched regions is updated so the access can proceed.
    ///
    /// When no region overlaps the access but the memory is mapped, the page
    /// was protected by a region that has since gone away. Its protection is
    /// lifted and the access retried. If the memory is not mapped either,
    /// the invalid access handler is called and
    /// [`TrackingError::InvalidMemoryRegion`] returned.
    pub fn virtual_memory_event_with(
        &self,
        address: u64,
        size: u64,
        write: bool,
        options: EventOptions,
    ) -> Result<()> {
        let inner = &self.inner;
        let size = size.max(1);
        let page_size = inner.page_size();

        let mut state = inner.state.lock();
        let overlaps = state.view(options.guest).find_overlaps(address, size);

        if overlaps.is_empty() && !options.precise {
            if inner.memory_manager.is_range_mapped(address, size) {
                let page = align_down(address, page_size);
                warn!(
                    "no region for access at {:#x}+{:#x}, unprotecting page {:#x}",
                    address, size, page
                );
                inner.memory_manager.tracking_reprotect(
                    page,
                    page_size,
                    MemoryPermission::READ_AND_WRITE,
                    options.guest,
                );
                inner.record(|s| s.record_race_recovery());
                return Ok(());
            }

            drop(state);
            error!("invalid memory access at {:#x}+{:#x}", address, size);

            if let Some(handler) = &inner.invalid_access_handler {
                handler(address);
            }
            return Err(TrackingError::InvalidMemoryRegion { address, size });
        }

        let size = if options.guest && inner.config.single_byte_guest_tracking {
            size + page_size
        } else {
            size
        };

        for region in overlaps {
            let r = RegionRef {
                guest: options.guest,
                address: region,
            };
            inner.signal_region(&mut state, r, address, size, write, &options);
        }

        Ok(())
    }

    /// Number of host-view virtual regions
    pub fn region_count(&self) -> usize {
        self.inner.state.lock().host.len()
    }

    /// Number of guest-view virtual regions
    pub fn guest_region_count(&self) -> usize {
        self.inner.state.lock().guest.len()
    }
}

impl std::fmt::Debug for MemoryTracking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryTracking")
            .field("page_size", &self.inner.config.page_size)
            .field("regions", &state.host.len())
            .field("guest_regions", &state.guest.len())
            .field("handles", &state.links.len())
            .finish()
    }
}
