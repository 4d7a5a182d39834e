//! RangeList - ordered set of non-overlapping address ranges.
//!
//! Items are keyed by their start address. Because no two items overlap, the
//! start address identifies an item for its whole lifetime: splitting keeps
//! the lower half at the original key and inserts the upper half at the split
//! address.
//!
//! # Example
//!
//! ```
//! use nxtrack_util::{NonOverlappingRange, RangeList};
//!
//! #[derive(Debug)]
//! struct Span { address: u64, size: u64 }
//!
//! impl NonOverlappingRange for Span {
//!     fn address(&self) -> u64 { self.address }
//!     fn size(&self) -> u64 { self.size }
//!     fn split(&mut self, at: u64) -> Self {
//!         let upper = Span { address: at, size: self.end_address() - at };
//!         self.size = at - self.address;
//!         upper
//!     }
//! }
//!
//! let mut list = RangeList::new();
//! let covering = list.get_or_add(0x1000, 0x3000, |address, size| Span { address, size });
//! assert_eq!(covering, vec![0x1000]);
//! assert_eq!(list.find_overlaps(0x2000, 1), vec![0x1000]);
//! ```

use crate::error::RangeError;
use std::collections::BTreeMap;

/// Compute `address + size`, rejecting empty and overflowing ranges
pub fn checked_end(address: u64, size: u64) -> Result<u64, RangeError> {
    if size == 0 {
        return Err(RangeError::EmptyRange { address });
    }

    address
        .checked_add(size)
        .ok_or(RangeError::Overflow { address, size })
}

/// An address range that can live in a [`RangeList`]
pub trait NonOverlappingRange: Sized {
    /// Start address
    fn address(&self) -> u64;

    /// Size in bytes
    fn size(&self) -> u64;

    /// Exclusive end address
    fn end_address(&self) -> u64 {
        self.address() + self.size()
    }

    /// Check if this range intersects `[address, address + size)`
    fn overlaps_with(&self, address: u64, size: u64) -> bool {
        self.address() < address.saturating_add(size) && address < self.end_address()
    }

    /// Shrink `self` to `[address, split_address)` and return the
    /// `[split_address, end)` remainder.
    ///
    /// `split_address` is always strictly inside the range.
    fn split(&mut self, split_address: u64) -> Self;
}

/// Ordered container of non-overlapping ranges
pub struct RangeList<T> {
    items: BTreeMap<u64, T>,
}

impl<T: NonOverlappingRange> RangeList<T> {
    /// Create an empty list
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }

    /// Number of stored ranges
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the list holds no ranges
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert a range
    ///
    /// # Panics
    ///
    /// Panics if `item` overlaps a range already in the list.
    pub fn insert(&mut self, item: T) {
        let address = item.address();
        assert!(
            self.find_overlaps(address, item.size()).is_empty(),
            "range {:#x}..{:#x} overlaps an existing entry",
            address,
            item.end_address()
        );
        self.items.insert(address, item);
    }

    /// Remove the range starting at `address`
    pub fn remove(&mut self, address: u64) -> Option<T> {
        self.items.remove(&address)
    }

    /// Get the range starting at `address`
    pub fn get(&self, address: u64) -> Option<&T> {
        self.items.get(&address)
    }

    /// Get the range starting at `address` mutably
    pub fn get_mut(&mut self, address: u64) -> Option<&mut T> {
        self.items.get_mut(&address)
    }

    /// Iterate ranges in address order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// Start addresses of all ranges intersecting `[address, address + size)`,
    /// in ascending order
    pub fn find_overlaps(&self, address: u64, size: u64) -> Vec<u64> {
        let end = address.saturating_add(size);
        let mut result = Vec::new();

        if end <= address {
            return result;
        }

        if let Some((&start, item)) = self.items.range(..address).next_back() {
            if item.end_address() > address {
                result.push(start);
            }
        }

        result.extend(self.items.range(address..end).map(|(&start, _)| start));
        result
    }

    /// Split the range containing `address` so that a range begins exactly at
    /// `address`.
    ///
    /// Returns `true` if a split happened. Nothing happens when no range
    /// contains `address` or when a range already starts there.
    pub fn split_at(&mut self, address: u64) -> bool {
        let start = match self.items.range(..address).next_back() {
            Some((&start, item)) if item.end_address() > address => start,
            _ => return false,
        };

        let upper = match self.items.get_mut(&start) {
            Some(item) => item.split(address),
            None => return false,
        };
        self.items.insert(address, upper);
        true
    }

    /// Cover `[address, address + size)` exactly with ranges.
    ///
    /// Ranges straddling either edge are split at the edge, and every gap is
    /// filled with a range built by `create(gap_address, gap_size)`. Returns
    /// the start addresses of every range now covering the request, in order.
    pub fn get_or_add<F>(&mut self, address: u64, size: u64, mut create: F) -> Vec<u64>
    where
        F: FnMut(u64, u64) -> T,
    {
        let end = address.saturating_add(size);
        let mut result = Vec::new();

        if end <= address {
            return result;
        }

        self.split_at(address);
        self.split_at(end);

        let existing: Vec<(u64, u64)> = self
            .items
            .range(address..end)
            .map(|(&start, item)| (start, item.end_address()))
            .collect();

        let mut cursor = address;
        for (start, item_end) in existing {
            if start > cursor {
                self.items.insert(cursor, create(cursor, start - cursor));
                result.push(cursor);
            }
            result.push(start);
            cursor = item_end;
        }

        if cursor < end {
            self.items.insert(cursor, create(cursor, end - cursor));
            result.push(cursor);
        }

        result
    }
}

impl<T: NonOverlappingRange> Default for RangeList<T> {
    fn default() -> Self {
        Self::new()
    }
}
