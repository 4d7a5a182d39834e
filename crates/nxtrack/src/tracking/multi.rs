//! Multi-Region Handle - Dense Granular Tracking
//!
//! Splits a range into fixed-size granules with one region handle each. The
//! granule dirty flags live in a single shared [`ConcurrentBitmap`], so a
//! query scans 64 granules per word and only visits the dirty ones.
//!
//! # Sequence Numbers
//!
//! A consumer that runs several overlapping queries per pass (one per draw,
//! for example) passes the pass number to
//! [`query_modified_sequenced`](MultiRegionHandle::query_modified_sequenced).
//! Each granule is then consumed at most once per pass:
//!
//! ```text
//! sequence bitmap:       granules already checked in this pass
//! dirty-checked bitmap:  granules found clean at their last check
//! ```
//!
//! A granule found dirty whose previous check also found it dirty was
//! rewritten between two consecutive checks, which feeds the volatility
//! heuristic.

use super::handle::DirtyBit;
use super::{HandleSpec, RegionHandle, TrackingInner};
use crate::bitmap::{end_mask, start_mask, Bitmap, ConcurrentBitmap, WORD_SHIFT};
use crate::error::{Result, TrackingError};
use crate::memory::{PreciseRegionSignal, RegionFlags, RegionSignal};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Coalesces adjacent dirty spans into single callbacks
#[derive(Debug, Default)]
pub(super) struct DirtyRun {
    start: u64,
    size: u64,
}

impl DirtyRun {
    pub fn push(&mut self, address: u64, size: u64, callback: &mut impl FnMut(u64, u64)) {
        if self.size != 0 && self.start + self.size == address {
            self.size += size;
            return;
        }

        self.flush(callback);
        self.start = address;
        self.size = size;
    }

    pub fn flush(&mut self, callback: &mut impl FnMut(u64, u64)) {
        if self.size != 0 {
            callback(self.start, self.size);
            self.size = 0;
        }
    }
}

/// Tracks a range as a dense array of granule handles
pub struct MultiRegionHandle {
    handles: Vec<RegionHandle>,
    address: u64,
    size: u64,
    granularity: u64,

    dirty_bitmap: Arc<ConcurrentBitmap>,
    sequence_number: u64,
    sequence_bitmap: Bitmap,
    dirty_checked_bitmap: Bitmap,
    unchecked_handles: usize,

    /// Set whenever any granule becomes dirty
    dirty: Arc<AtomicBool>,
}

impl MultiRegionHandle {
    pub(crate) fn new(
        tracking: Arc<TrackingInner>,
        address: u64,
        size: u64,
        mut seeds: Vec<RegionHandle>,
        granularity: u64,
        id: i32,
    ) -> Result<Self> {
        let end = address + size;
        if let Some(seed) = seeds
            .iter()
            .find(|s| s.real_address() < address || s.real_end_address() > end)
        {
            return Err(TrackingError::InvalidArgument(format!(
                "seed handle {:#x}+{:#x} lies outside {:#x}+{:#x}",
                seed.real_address(),
                seed.real_size(),
                address,
                size
            )));
        }
        seeds.sort_by_key(|s| s.real_address());

        let count = size.div_ceil(granularity) as usize;
        let dirty_bitmap = Arc::new(ConcurrentBitmap::new(count, true));
        let dirty = Arc::new(AtomicBool::new(true));

        let create = |index: usize, inherit: Option<&RegionHandle>| {
            tracking.create_handle(HandleSpec {
                address: address + index as u64 * granularity,
                size: granularity,
                id,
                flags: RegionFlags::empty(),
                dirty: DirtyBit::new(Arc::clone(&dirty_bitmap), index),
                parent_dirty: Some(Arc::clone(&dirty)),
                inherit: inherit.map(|seed| Arc::clone(seed.core())),
            })
        };

        let mut handles: Vec<RegionHandle> = Vec::with_capacity(count);

        for seed in seeds {
            let first = ((seed.real_address() - address) / granularity) as usize;
            let last = ((seed.real_end_address() - address) / granularity) as usize;

            while handles.len() < first {
                handles.push(create(handles.len(), None));
            }

            // Granules fully covered by the seed inherit its state.
            let seed_action = seed.pre_action();
            while handles.len() < last {
                let granule = create(handles.len(), Some(&seed));
                if let Some(action) = &seed_action {
                    granule.register_action(Arc::clone(action));
                }
                handles.push(granule);
            }

            // Detaching applies the protection the covered granules need.
            seed.dispose();
        }

        while handles.len() < count {
            handles.push(create(handles.len(), None));
        }

        Ok(Self {
            handles,
            address,
            size,
            granularity,
            dirty_bitmap,
            sequence_number: 0,
            sequence_bitmap: Bitmap::new(count),
            dirty_checked_bitmap: Bitmap::new(count),
            unchecked_handles: count,
            dirty,
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Whether any granule was dirtied since the last full query
    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// The granule handles in address order
    pub fn handles(&self) -> &[RegionHandle] {
        &self.handles
    }

    /// Inclusive granule index range intersecting the given range
    fn granule_range(&self, address: u64, size: u64) -> Option<(usize, usize)> {
        let start = address.max(self.address);
        let end = address
            .saturating_add(size)
            .min(self.address + self.size);

        if start >= end {
            return None;
        }

        let first = (start - self.address) / self.granularity;
        let last = (end - 1 - self.address) / self.granularity;
        Some((first as usize, last as usize))
    }

    /// Word-level mask of granules `[first, last]` within word `index`
    fn word_mask(index: usize, first: usize, last: usize) -> u64 {
        let mut mask = u64::MAX;
        if index == first >> WORD_SHIFT {
            mask &= start_mask(first);
        }
        if index == last >> WORD_SHIFT {
            mask &= end_mask(last);
        }
        mask
    }

    /// Report and reprotect every dirty granule, if any granule was dirtied
    /// since the last call
    pub fn query_modified_all(&self, callback: impl FnMut(u64, u64)) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }

        self.query_modified(self.address, self.size, callback);
    }

    /// Report and reprotect dirty granules intersecting the range.
    ///
    /// Adjacent dirty granules are reported as one span.
    pub fn query_modified(&self, address: u64, size: u64, mut callback: impl FnMut(u64, u64)) {
        let Some((first, last)) = self.granule_range(address, size) else {
            return;
        };

        if first == last {
            let handle = &self.handles[first];
            if handle.dirty() {
                handle.reprotect(false);
                callback(handle.real_address(), handle.real_size());
            }
            return;
        }

        let mut run = DirtyRun::default();

        for index in first >> WORD_SHIFT..=last >> WORD_SHIFT {
            let mut bits = self.dirty_bitmap.word(index) & Self::word_mask(index, first, last);

            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;

                let handle = &self.handles[(index << WORD_SHIFT) + bit];
                if handle.dirty() {
                    run.push(handle.real_address(), handle.real_size(), &mut callback);
                    handle.reprotect(false);
                }
            }
        }

        run.flush(&mut callback);
    }

    /// Like [`query_modified`](Self::query_modified), consuming each granule
    /// at most once per `sequence_number`
    pub fn query_modified_sequenced(
        &mut self,
        address: u64,
        size: u64,
        mut callback: impl FnMut(u64, u64),
        sequence_number: u64,
    ) {
        let Some((first, last)) = self.granule_range(address, size) else {
            return;
        };

        if sequence_number != self.sequence_number {
            if self.unchecked_handles != self.handles.len() {
                self.sequence_bitmap.clear_all();
                self.unchecked_handles = self.handles.len();
            }
            self.sequence_number = sequence_number;
        }

        if first == last {
            if self.sequence_bitmap.set(first) {
                self.unchecked_handles -= 1;

                let handle = &self.handles[first];
                if handle.dirty_or_volatile() {
                    handle.reprotect(false);
                    callback(handle.real_address(), handle.real_size());
                }
            }
            return;
        }

        if self.unchecked_handles == 0 {
            return;
        }

        let mut run = DirtyRun::default();

        for index in first >> WORD_SHIFT..=last >> WORD_SHIFT {
            let mask = Self::word_mask(index, first, last);
            let dirty_bits = self.dirty_bitmap.word(index);

            let unchecked = mask & !self.sequence_bitmap.word(index);
            let found_clean = !dirty_bits & unchecked;
            let mut bits = dirty_bits & unchecked;

            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let bit_value = 1u64 << bit;
                bits &= !bit_value;

                let consecutive = self.dirty_checked_bitmap.word(index) & bit_value == 0;

                let handle = &self.handles[(index << WORD_SHIFT) + bit];
                run.push(handle.real_address(), handle.real_size(), &mut callback);
                handle.reprotect_with(false, consecutive);

                *self.dirty_checked_bitmap.word_mut(index) &= !bit_value;
            }

            *self.dirty_checked_bitmap.word_mut(index) |= found_clean;
            *self.sequence_bitmap.word_mut(index) |= mask;
            self.unchecked_handles -= unchecked.count_ones() as usize;
        }

        run.flush(&mut callback);
    }

    /// Mark every granule intersecting the range dirty, including for the
    /// current sequence
    pub fn force_dirty(&mut self, address: u64, size: u64) {
        let Some((first, last)) = self.granule_range(address, size) else {
            return;
        };

        self.dirty.store(true, Ordering::Release);

        for index in first..=last {
            if self.sequence_bitmap.clear(index) {
                self.unchecked_handles += 1;
            }
            self.handles[index].force_dirty();
        }
    }

    /// Register `action` on every granule intersecting the range
    pub fn register_action(&self, address: u64, size: u64, action: RegionSignal) {
        if let Some((first, last)) = self.granule_range(address, size) {
            for handle in &self.handles[first..=last] {
                handle.register_action(Arc::clone(&action));
            }
        }
    }

    /// Register `action` as the precise action of every granule intersecting
    /// the range
    pub fn register_precise_action(&self, address: u64, size: u64, action: PreciseRegionSignal) {
        if let Some((first, last)) = self.granule_range(address, size) {
            for handle in &self.handles[first..=last] {
                handle.register_precise_action(Arc::clone(&action));
            }
        }
    }

    /// Stop tracking every granule
    pub fn dispose(self) {}
}

impl fmt::Debug for MultiRegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiRegionHandle")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("granularity", &self.granularity)
            .field("granules", &self.handles.len())
            .field("dirty", &self.dirty())
            .finish()
    }
}
