//! Virtual Region - Protection Unit of the Tracked Address Space
//!
//! A virtual region is an address range whose pages share one protection
//! level. It keeps back-references to every region handle overlapping it and
//! derives the protection they jointly need.
//!
//! Regions within one view (host or guest) never overlap. When a new handle
//! only partially covers an existing region, the region is split so that
//! region boundaries follow handle boundaries:
//!
//! ```text
//! before:  [ region A ........................ )      handles: {h1}
//! new h2:               [ h2 ........ )
//! after:   [ A        )[ A'          )[ A''    )
//!           {h1}        {h1, h2}      {h1}
//! ```
//!
//! All fields are only touched with the tracking lock held.

use super::handle::{HandleCore, HandleKey};
use crate::memory::MemoryPermission;
use nxtrack_util::NonOverlappingRange;
use std::sync::Arc;

/// Stable reference to a virtual region
///
/// A region keeps its start address for its whole lifetime (splitting keeps
/// the lower half in place), and a region is only removed once no handle
/// refers to it, so `(view, address)` identifies it unambiguously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RegionRef {
    pub guest: bool,
    pub address: u64,
}

pub(crate) struct VirtualRegion {
    address: u64,
    size: u64,
    guest: bool,

    /// Handles overlapping this region. Not owning: a handle removes itself
    /// from every region on disposal.
    pub handles: Vec<Arc<HandleCore>>,

    /// Protection last applied through the memory manager. `None` when it
    /// has to be re-applied unconditionally.
    pub last_permission: Option<MemoryPermission>,
}

impl VirtualRegion {
    pub fn new(address: u64, size: u64, guest: bool) -> Self {
        Self {
            address,
            size,
            guest,
            handles: Vec::new(),
            last_permission: None,
        }
    }

    pub fn guest(&self) -> bool {
        self.guest
    }

    /// Protection satisfying every handle: the AND of their requirements
    pub fn required_permission(&self) -> MemoryPermission {
        let mut result = MemoryPermission::READ_AND_WRITE;

        for handle in &self.handles {
            result &= handle.required_permission();
            if result.is_empty() {
                break;
            }
        }

        result
    }

    /// Drop the back-reference to a handle
    pub fn remove_handle(&mut self, key: HandleKey) {
        self.handles.retain(|h| h.key() != key);
    }
}

impl NonOverlappingRange for VirtualRegion {
    fn address(&self) -> u64 {
        self.address
    }

    fn size(&self) -> u64 {
        self.size
    }

    /// The upper half inherits every handle and the last applied protection.
    /// Handles still need a link to the new half; the tracker adds it.
    fn split(&mut self, split_address: u64) -> Self {
        let upper = VirtualRegion {
            address: split_address,
            size: self.end_address() - split_address,
            guest: self.guest,
            handles: self.handles.clone(),
            last_permission: self.last_permission,
        };

        self.size = split_address - self.address;
        upper
    }
}
