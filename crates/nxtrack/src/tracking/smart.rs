//! Smart Multi-Region Handle - Sparse Granular Tracking
//!
//! Tracks a range with as few handles as the queries allow. Nothing is
//! tracked until first queried; a query creates one handle spanning the
//! largest untracked stretch it touches, and existing handles are split at
//! granule boundaries when a later query only needs part of them.
//!
//! ```text
//! query [0, 4)        [ h0 .................... )
//! query [1, 2)        [ h0 )[ h1 )[ h2          )
//!                            ^^^^ reported
//! ```
//!
//! Slot `i` holds the handle starting at granule `i`, if any.

use super::handle::DirtyBit;
use super::multi::DirtyRun;
use super::{HandleSpec, RegionHandle, TrackingInner};
use crate::bitmap::ConcurrentBitmap;
use crate::memory::{PreciseRegionSignal, RegionFlags, RegionSignal};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Slot {
    handle: RegionHandle,
    /// Last sequence number this handle was consumed in
    sequence: Option<u64>,
}

/// Tracks a range with lazily created, variable-size handles
pub struct SmartMultiRegionHandle {
    tracking: Arc<TrackingInner>,
    slots: Vec<Option<Slot>>,
    address: u64,
    size: u64,
    granularity: u64,
    id: i32,
    dirty: Arc<AtomicBool>,
}

impl SmartMultiRegionHandle {
    pub(crate) fn new(
        tracking: Arc<TrackingInner>,
        address: u64,
        size: u64,
        granularity: u64,
        id: i32,
    ) -> Self {
        let count = size.div_ceil(granularity) as usize;

        Self {
            tracking,
            slots: (0..count).map(|_| None).collect(),
            address,
            size,
            granularity,
            id,
            dirty: Arc::new(AtomicBool::new(true)),
        }
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

    /// Whether any handle was dirtied since the last full query
    pub fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Live handles in address order
    pub fn handles(&self) -> impl Iterator<Item = &RegionHandle> {
        self.slots.iter().flatten().map(|slot| &slot.handle)
    }

    pub fn handle_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn granule_address(&self, index: usize) -> u64 {
        self.address + index as u64 * self.granularity
    }

    fn slot_end(&self, index: usize) -> u64 {
        self.slots[index]
            .as_ref()
            .map_or(0, |slot| slot.handle.real_end_address())
    }

    fn create_leaf(
        &self,
        address: u64,
        size: u64,
        inherit: Option<&RegionHandle>,
    ) -> RegionHandle {
        let bitmap = Arc::new(ConcurrentBitmap::new(1, false));
        self.tracking.create_handle(HandleSpec {
            address,
            size,
            id: self.id,
            flags: RegionFlags::empty(),
            dirty: DirtyBit::new(bitmap, 0),
            parent_dirty: Some(Arc::clone(&self.dirty)),
            inherit: inherit.map(|handle| Arc::clone(handle.core())),
        })
    }

    /// Replace the handle at `handle_index` by two handles meeting at
    /// granule `split_index`. Both inherit its dirty state, pending
    /// pre-action and sequence number.
    fn split_handle(&mut self, handle_index: usize, split_index: usize) {
        let Some(slot) = self.slots[handle_index].take() else {
            return;
        };

        let address = self.granule_address(handle_index);
        let low_size = (split_index - handle_index) as u64 * self.granularity;
        let high_size = slot.handle.real_end_address() - address - low_size;

        let low = self.create_leaf(address, low_size, Some(&slot.handle));
        let high = self.create_leaf(address + low_size, high_size, Some(&slot.handle));

        if let Some(action) = slot.handle.pre_action() {
            for leaf in [&low, &high] {
                leaf.register_action(Arc::clone(&action));
            }
        }

        // Disposed only now so the range is never left untracked. Detaching
        // applies the protection the new handles need.
        slot.handle.dispose();

        self.slots[handle_index] = Some(Slot {
            handle: low,
            sequence: slot.sequence,
        });
        self.slots[split_index] = Some(Slot {
            handle: high,
            sequence: slot.sequence,
        });
    }

    /// Make sure granule `start` is covered by a handle starting there,
    /// creating one that extends up to the next existing handle or past
    /// `last`.
    fn create_handle(&mut self, start: usize, last: usize) {
        let start_address = self.granule_address(start);

        for index in (0..start).rev() {
            let covers = match &self.slots[index] {
                Some(slot) => slot.handle.real_end_address() > start_address,
                None => continue,
            };

            if covers {
                self.split_handle(index, start);
                return;
            }
            break;
        }

        let end = (start + 1..=last)
            .find(|&index| self.slots[index].is_some())
            .unwrap_or(last + 1);

        let size = (end - start) as u64 * self.granularity;
        let handle = self.create_leaf(start_address, size, None);
        self.slots[start] = Some(Slot {
            handle,
            sequence: None,
        });
    }

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

    fn query(
        &mut self,
        address: u64,
        size: u64,
        sequence: Option<u64>,
        callback: &mut impl FnMut(u64, u64),
    ) {
        let Some((first, last)) = self.granule_range(address, size) else {
            return;
        };

        let end_address = self.granule_address(last + 1);
        let mut run = DirtyRun::default();
        let mut index = first;

        while index <= last {
            if self.slots[index].is_none() {
                self.create_handle(index, last);
            }

            if self.slot_end(index) > end_address {
                self.split_handle(index, last + 1);
            }

            let granularity = self.granularity;
            let Some(slot) = self.slots[index].as_mut() else {
                break;
            };

            let handle = &slot.handle;
            let step = ((handle.real_size() / granularity) as usize).max(1);
            let unseen = sequence.map_or(true, |s| slot.sequence != Some(s));

            if unseen && handle.dirty_or_volatile() {
                run.push(handle.real_address(), handle.real_size(), callback);
                handle.reprotect(false);
            } else {
                run.flush(callback);
            }

            if sequence.is_some() {
                slot.sequence = sequence;
            }

            index += step;
        }

        run.flush(callback);
    }

    /// Report and reprotect every dirty handle, if any handle was dirtied
    /// since the last call
    pub fn query_modified_all(&mut self, mut callback: impl FnMut(u64, u64)) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }

        self.query(self.address, self.size, None, &mut callback);
    }

    /// Report and reprotect dirty spans intersecting the range, creating and
    /// splitting handles so that they follow the range's granule bounds
    pub fn query_modified(&mut self, address: u64, size: u64, mut callback: impl FnMut(u64, u64)) {
        self.query(address, size, None, &mut callback);
    }

    /// Like [`query_modified`](Self::query_modified), consuming each handle
    /// at most once per `sequence_number`
    pub fn query_modified_sequenced(
        &mut self,
        address: u64,
        size: u64,
        mut callback: impl FnMut(u64, u64),
        sequence_number: u64,
    ) {
        self.query(address, size, Some(sequence_number), &mut callback);
    }

    /// Mark every existing handle intersecting the range dirty
    pub fn force_dirty(&self, address: u64, size: u64) {
        self.dirty.store(true, Ordering::Release);

        for handle in self.handles() {
            if handle.overlaps_with(address, size) {
                handle.force_dirty();
            }
        }
    }

    /// Register `action` on every existing handle. It is called with the
    /// whole protected span of the handle that fired.
    pub fn register_action(&self, action: RegionSignal) {
        for handle in self.handles() {
            let (address, size) = (handle.address(), handle.size());
            let action = Arc::clone(&action);
            handle.register_action(Arc::new(move |_, _| action(address, size)));
        }
    }

    /// Register `action` as the precise action of every existing handle,
    /// called with the handle's whole protected span
    pub fn register_precise_action(&self, action: PreciseRegionSignal) {
        for handle in self.handles() {
            let (address, size) = (handle.address(), handle.size());
            let action = Arc::clone(&action);
            handle.register_precise_action(Arc::new(move |_, _, write| {
                action(address, size, write)
            }));
        }
    }

    /// Stop tracking every handle
    pub fn dispose(self) {}
}

impl fmt::Debug for SmartMultiRegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartMultiRegionHandle")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("granularity", &self.granularity)
            .field("handles", &self.handle_count())
            .finish()
    }
}
