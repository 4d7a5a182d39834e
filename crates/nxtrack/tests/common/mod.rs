//! Shared fixtures for the tracking integration tests
//!
//! The mock memory manager treats every page as mapped unless a test unmaps
//! it, and records every protection change it is asked to apply.

#![allow(dead_code)]

use nxtrack::{MemoryPermission, MemoryTracking, Result, TrackingConfig, VirtualMemoryManager};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Page size used by every fixture
pub const PAGE_SIZE: u64 = 4096;

/// Size of the memory the tests work in
pub const MEMORY_SIZE: u64 = 0x8000;

/// One `tracking_reprotect` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionCall {
    pub address: u64,
    pub size: u64,
    pub permission: MemoryPermission,
    pub guest: bool,
}

/// ============================================================================
/// MOCK MEMORY MANAGER
/// ============================================================================

pub struct MockVirtualMemoryManager {
    page_size: u64,
    unmapped_pages: Mutex<BTreeSet<u64>>,
    protections: Mutex<Vec<ProtectionCall>>,
}

impl MockVirtualMemoryManager {
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            unmapped_pages: Mutex::new(BTreeSet::new()),
            protections: Mutex::new(Vec::new()),
        }
    }

    fn pages(&self, address: u64, size: u64) -> std::ops::Range<u64> {
        let first = address / self.page_size;
        let end = (address + size).div_ceil(self.page_size);
        first..end
    }

    pub fn set_unmapped(&self, address: u64, size: u64) {
        let mut unmapped = self.unmapped_pages.lock();
        for page in self.pages(address, size) {
            unmapped.insert(page);
        }
    }

    pub fn set_mapped(&self, address: u64, size: u64) {
        let mut unmapped = self.unmapped_pages.lock();
        for page in self.pages(address, size) {
            unmapped.remove(&page);
        }
    }

    pub fn protections(&self) -> Vec<ProtectionCall> {
        self.protections.lock().clone()
    }

    pub fn clear_protections(&self) {
        self.protections.lock().clear();
    }

    /// Last permission applied to a range starting at `address`
    pub fn last_protection(&self, address: u64, guest: bool) -> Option<MemoryPermission> {
        self.protections
            .lock()
            .iter()
            .rev()
            .find(|call| call.address == address && call.guest == guest)
            .map(|call| call.permission)
    }
}

impl VirtualMemoryManager for MockVirtualMemoryManager {
    fn is_range_mapped(&self, address: u64, size: u64) -> bool {
        let unmapped = self.unmapped_pages.lock();
        if unmapped.is_empty() {
            return true;
        }
        self.pages(address, size.max(1))
            .all(|page| !unmapped.contains(&page))
    }

    fn tracking_reprotect(&self, address: u64, size: u64, permission: MemoryPermission, guest: bool) {
        self.protections.lock().push(ProtectionCall {
            address,
            size,
            permission,
            guest,
        });
    }
}

/// ============================================================================
/// TRACKING FIXTURE
/// ============================================================================

pub struct TrackingFixture {
    pub memory: Arc<MockVirtualMemoryManager>,
    pub tracking: MemoryTracking,
}

impl TrackingFixture {
    pub fn new() -> Self {
        Self::with_config(TrackingConfig::with_page_size(PAGE_SIZE))
    }

    pub fn with_config(config: TrackingConfig) -> Self {
        let memory = Arc::new(MockVirtualMemoryManager::new(config.page_size));
        let tracking = MemoryTracking::new(memory.clone(), config)
            .expect("fixture config should be valid");

        Self { memory, tracking }
    }

    pub fn write(&self, address: u64, size: u64) -> Result<()> {
        self.tracking.virtual_memory_event(address, size, true)
    }

    pub fn read(&self, address: u64, size: u64) -> Result<()> {
        self.tracking.virtual_memory_event(address, size, false)
    }

    /// Unmap in both the mock and the tracker
    pub fn unmap(&self, address: u64, size: u64) {
        self.memory.set_unmapped(address, size);
        self.tracking.unmap(address, size);
    }

    /// Map in both the mock and the tracker
    pub fn map(&self, address: u64, size: u64) {
        self.memory.set_mapped(address, size);
        self.tracking.map(address, size);
    }
}

/// Run a query and collect the spans it reports
pub fn query_spans(query: impl FnOnce(&mut dyn FnMut(u64, u64))) -> Vec<(u64, u64)> {
    let mut spans = Vec::new();
    query(&mut |address, size| spans.push((address, size)));
    spans
}
