//! # nxtrack - Write Tracking for Emulated Memory
//!
//! nxtrack tracks which parts of a virtual address space have been written,
//! using page protection instead of instrumentation. It is meant for
//! emulators that keep host-side copies of guest memory (textures, buffers,
//! shader caches) and need to know when those copies went stale.
//!
//! ## Quick Start
//!
//! ```rust
//! use nxtrack::{MemoryPermission, MemoryTracking, TrackingConfig, VirtualMemoryManager};
//! use std::sync::Arc;
//!
//! struct FlatMemory;
//!
//! impl VirtualMemoryManager for FlatMemory {
//!     fn is_range_mapped(&self, _address: u64, _size: u64) -> bool {
//!         true
//!     }
//!
//!     fn tracking_reprotect(&self, _address: u64, _size: u64, _permission: MemoryPermission, _guest: bool) {}
//! }
//!
//! fn main() -> Result<(), nxtrack::TrackingError> {
//!     let tracking = MemoryTracking::new(Arc::new(FlatMemory), TrackingConfig::with_page_size(4096))?;
//!
//!     // Mapped memory starts out dirty.
//!     let handle = tracking.begin_tracking(0x10000, 0x2000, 0)?;
//!     assert!(handle.dirty());
//!
//!     // Consume the dirty state; the pages become read only.
//!     handle.reprotect(false);
//!     assert!(!handle.dirty());
//!
//!     // The memory manager reports the write fault.
//!     tracking.virtual_memory_event(0x10010, 4, true)?;
//!     assert!(handle.dirty());
//!
//!     handle.dispose();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   caller                          MemoryTracking
//!   ──────                          ──────────────
//!   RegionHandle ──────┐      host regions   [ r0 )[ r1 )[ r2    )
//!   MultiRegionHandle ─┼──▶   guest regions  [ g0       )[ g1    )
//!   SmartMultiRegion ──┘            │
//!                                   ▼
//!                        VirtualMemoryManager::tracking_reprotect
//!                                   ▲
//!   fault handler ── virtual_memory_event ──▶ signal handles, lift protection
//! ```
//!
//! ## Modules
//!
//! - [`tracking`]: the tracker, virtual regions and the three handle kinds
//! - [`bitmap`]: plain and atomic bitmaps backing dirty flags
//! - [`memory`]: permissions, flags, the memory manager trait and callbacks
//! - [`config`]: tracking configuration and validation
//! - [`error`]: error types for all tracking operations
//! - [`stats`]: tracking counters
//!
//! ## Thread Safety
//!
//! `MemoryTracking` and `RegionHandle` are `Send + Sync`. Fault reports may
//! arrive from any thread. Multi-region handles need `&mut self` for
//! sequenced queries and are meant to be driven by one consumer.

pub mod bitmap;
pub mod config;
pub mod error;
pub mod memory;
pub mod stats;
pub mod tracking;

pub use config::TrackingConfig;
pub use error::{Result, TrackingError};
pub use memory::{
    DirtyEvent, InvalidAccessHandler, MemoryPermission, PreciseRegionSignal, RegionFlags,
    RegionSignal, VirtualMemoryManager,
};
pub use stats::{StatsSnapshot, TrackingStats};
pub use tracking::{
    EventOptions, MemoryTracking, MultiRegionHandle, RegionHandle, SmartMultiRegionHandle,
    VolatilityState, CHECK_COUNT_FOR_INFREQUENT, VOLATILE_THRESHOLD,
};

/// nxtrack version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
