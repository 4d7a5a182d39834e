//! Memory Collaborators - Permissions, Flags and the Virtual Memory Manager
//!
//! The tracking engine never touches page tables itself. It asks an external
//! [`VirtualMemoryManager`] whether ranges are mapped and tells it which
//! protection to apply, and reports genuinely invalid accesses through an
//! [`InvalidAccessHandler`].
//!
//! Callback types handed to region handles are defined here as well, since
//! they form the consumer-facing side of the same contract.

pub mod page;

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Memory access permissions applied to tracked pages.
    ///
    /// Combining the requirements of several handles is a bitwise AND: the
    /// strictest handle wins (`NONE` beats `READ` beats `READ_AND_WRITE`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u32 {
        const NONE    = 0;
        const READ    = 1;
        const WRITE   = 2;
        const EXECUTE = 4;

        const READ_AND_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl fmt::Display for MemoryPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Self::READ) { 'R' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'W' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'X' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

bitflags! {
    /// Options for creating region handles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegionFlags: u32 {
        /// The guest-facing protected range is widened one page backward, for
        /// memory managers that only report the first byte of an access.
        const UNALIGNED_ACCESS = 1;
    }
}

/// The virtual memory manager the tracked address space belongs to
///
/// Implementations apply protection to host pages (or to the guest page
/// table when `guest` is set) and answer mapping queries. Both calls are made
/// with the tracking lock held and must not call back into the tracker.
pub trait VirtualMemoryManager: Send + Sync {
    /// Check if every page in `[address, address + size)` is mapped
    fn is_range_mapped(&self, address: u64, size: u64) -> bool;

    /// Apply `permission` to `[address, address + size)`
    fn tracking_reprotect(&self, address: u64, size: u64, permission: MemoryPermission, guest: bool);
}

/// Called with the faulting address right before an invalid access is
/// reported as an error
pub type InvalidAccessHandler = Arc<dyn Fn(u64) + Send + Sync>;

/// One-shot action run before the next access to a handle's range.
///
/// Receives the accessed `(address, size)` clamped to the handle's range.
pub type RegionSignal = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Action run on precise accesses with `(address, size, write)`.
///
/// Returning `true` means the access was fully handled and the default dirty
/// tracking is skipped.
pub type PreciseRegionSignal = Arc<dyn Fn(u64, u64, bool) -> bool + Send + Sync>;

/// Persistent action run each time a handle turns dirty from a write
pub type DirtyEvent = Arc<dyn Fn() + Send + Sync>;
