//! Region Handle Tests - Dirty Flags, Actions and Protection
//!
//! Single handles driven through `virtual_memory_event`, checking the dirty
//! flag, the one-shot pre-action, precise actions and the protection pushed
//! to the memory manager.

mod common;

use common::{TrackingFixture, PAGE_SIZE};
use nxtrack::{
    EventOptions, MemoryPermission, RegionFlags, RegionHandle, TrackingConfig, TrackingError,
};
use parking_lot::Mutex;
use quickcheck_macros::quickcheck;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Reprotect, write, and report whether the write dirtied the handle
fn single_write(fixture: &TrackingFixture, handle: &RegionHandle, address: u64, size: u64) -> bool {
    handle.reprotect(false);
    let _ = fixture.write(address, size);
    handle.dirty()
}

/// ============================================================================
/// DIRTY FLAG AND PRE-ACTION
/// ============================================================================

#[test]
fn test_single_region() {
    let fixture = TrackingFixture::new();
    let handle = fixture.tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap();

    let triggered = Arc::new(Mutex::new(None));
    let sink = triggered.clone();
    handle.register_action(Arc::new(move |address, size| {
        *sink.lock() = Some((address, size));
    }));

    assert!(handle.dirty(), "mapped handle starts dirty");

    handle.reprotect(false);
    assert!(!handle.dirty());

    // Unrelated page
    fixture.write(PAGE_SIZE * 2, 4).unwrap();
    fixture.read(PAGE_SIZE * 2, 4).unwrap();
    assert!(!handle.dirty());
    assert_eq!(*triggered.lock(), None);

    fixture.read(0, 4).unwrap();
    assert!(!handle.dirty(), "reads never dirty");
    assert_eq!(*triggered.lock(), Some((0, 4)));

    *triggered.lock() = None;
    fixture.write(0, 4).unwrap();
    assert!(handle.dirty());

    fixture.write(4, 4).unwrap();
    assert!(handle.dirty());
    assert_eq!(*triggered.lock(), None, "action fires once per registration");

    handle.reprotect(false);
    assert!(!handle.dirty());

    handle.dispose();
    assert_eq!(fixture.tracking.region_count(), 0);

    // No region left; like the unrelated accesses above, the write is
    // treated as a stale fault.
    fixture.write(0, 4).unwrap();
    assert_eq!(fixture.tracking.stats().snapshot().race_recoveries, 3);
}

#[test]
fn test_overlapping_regions() {
    let fixture = TrackingFixture::new();
    let all = fixture.tracking.begin_tracking(0, PAGE_SIZE * 16, 0).unwrap();
    all.reprotect(false);

    let triggered = Arc::new(Mutex::new(None));
    let register = |handle: &RegionHandle| {
        *triggered.lock() = None;
        let sink = triggered.clone();
        handle.register_action(Arc::new(move |address, size| {
            *sink.lock() = Some((address, size));
        }));
    };
    register(&all);

    let contained: Vec<RegionHandle> = (0..16)
        .map(|i| {
            let handle = fixture
                .tracking
                .begin_tracking(i * PAGE_SIZE, PAGE_SIZE, 0)
                .unwrap();
            handle.reprotect(false);
            handle
        })
        .collect();

    for i in 0..16u64 {
        assert!(!all.dirty());
        assert_eq!(*triggered.lock(), None);
        assert!(contained.iter().all(|h| !h.dirty()));

        fixture.write(i * PAGE_SIZE, 1).unwrap();

        assert!(all.dirty());
        assert_eq!(*triggered.lock(), Some((i * PAGE_SIZE, 1)));
        for (j, handle) in contained.iter().enumerate() {
            assert_eq!(handle.dirty(), j as u64 == i, "only handle {} is dirty", i);
        }

        register(&all);
        all.reprotect(false);
        contained[i as usize].reprotect(false);
    }
}

#[quickcheck]
fn prop_page_alignment(address: u16, size: u16) -> bool {
    let address = address as u64 + 1;
    let size = size as u64 + 1;

    let aligned_start = address / PAGE_SIZE * PAGE_SIZE;
    let aligned_end = (address + size).div_ceil(PAGE_SIZE) * PAGE_SIZE;

    let fixture = TrackingFixture::new();
    let handle = fixture.tracking.begin_tracking(address, size, 0).unwrap();

    let inside = single_write(&fixture, &handle, address, size)
        && single_write(&fixture, &handle, aligned_start, aligned_end - aligned_start)
        && single_write(&fixture, &handle, aligned_start, 1)
        && single_write(&fixture, &handle, aligned_end - 1, 1);

    let before = aligned_start > 0 && single_write(&fixture, &handle, aligned_start - 1, 1);
    let after = single_write(&fixture, &handle, aligned_end, 1);

    inside && !before && !after
}

#[test]
fn test_handle_geometry() {
    let fixture = TrackingFixture::new();
    let handle = fixture.tracking.begin_tracking(0x1100, 0x200, 5).unwrap();

    assert_eq!((handle.address(), handle.size()), (0x1000, PAGE_SIZE));
    assert_eq!((handle.real_address(), handle.real_size()), (0x1100, 0x200));
    assert_eq!(handle.real_end_address(), 0x1300);
    assert_eq!(handle.id(), 5);

    assert!(handle.range_equals(0x1100, 0x200));
    assert!(!handle.range_equals(0x1000, PAGE_SIZE));

    assert!(handle.overlaps_with(0x1fff, 1));
    assert!(handle.overlaps_with(0, 0x1001));
    assert!(!handle.overlaps_with(0x2000, 0x10));
    assert!(!handle.overlaps_with(0, 0x1000));
}

#[test]
fn test_begin_tracking_rejects_bad_ranges() {
    let fixture = TrackingFixture::new();

    assert!(matches!(
        fixture.tracking.begin_tracking(0x1000, 0, 0),
        Err(TrackingError::Range(_))
    ));
    assert!(matches!(
        fixture.tracking.begin_tracking(u64::MAX - 4, 0x10, 0),
        Err(TrackingError::Range(_))
    ));
}

/// ============================================================================
/// REGION BOOKKEEPING
/// ============================================================================

#[test]
fn test_dispose_handles() {
    let fixture = TrackingFixture::new();
    let tracking = &fixture.tracking;

    let handle = tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap();
    handle.reprotect(false);
    assert_eq!(tracking.region_count(), 1);

    handle.dispose();
    assert_eq!(tracking.region_count(), 0);

    // The small handle splits the big one's range in three.
    let small = tracking.begin_tracking(PAGE_SIZE, PAGE_SIZE, 0).unwrap();
    let big = tracking.begin_tracking(0, PAGE_SIZE * 4, 0).unwrap();
    assert_eq!(tracking.region_count(), 3);

    big.dispose();
    assert_eq!(tracking.region_count(), 1);

    drop(small);
    assert_eq!(tracking.region_count(), 0);
    assert_eq!(tracking.guest_region_count(), 0);
}

#[test]
fn test_split_region_keeps_both_handles_signalled() {
    let fixture = TrackingFixture::new();
    let big = fixture.tracking.begin_tracking(0, PAGE_SIZE * 4, 0).unwrap();
    big.reprotect(false);

    let small = fixture.tracking.begin_tracking(PAGE_SIZE * 2, PAGE_SIZE, 0).unwrap();
    small.reprotect(false);

    // Upper remainder of the split
    fixture.write(PAGE_SIZE * 3 + 8, 4).unwrap();
    assert!(big.dirty());
    assert!(!small.dirty());

    big.reprotect(false);
    fixture.write(PAGE_SIZE * 2, 4).unwrap();
    assert!(big.dirty());
    assert!(small.dirty());
}

/// ============================================================================
/// PROTECTION
/// ============================================================================

#[test]
fn test_read_and_write_protection() {
    let fixture = TrackingFixture::new();
    let handle = fixture.tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap();

    assert!(fixture.memory.protections().is_empty(), "no protection before first reprotect");
    assert!(handle.dirty());

    handle.reprotect(false);
    assert_eq!(fixture.memory.last_protection(0, false), Some(MemoryPermission::READ));

    let triggered = Arc::new(Mutex::new(None));
    let sink = triggered.clone();
    handle.register_action(Arc::new(move |address, size| {
        *sink.lock() = Some((address, size));
    }));
    assert_eq!(fixture.memory.last_protection(0, false), Some(MemoryPermission::NONE));
    assert!(!handle.dirty());

    // A read runs the action but keeps write protection.
    fixture.read(0, 4).unwrap();
    assert!(!handle.dirty());
    assert_eq!(*triggered.lock(), Some((0, 4)));
    assert_eq!(fixture.memory.last_protection(0, false), Some(MemoryPermission::READ));

    *triggered.lock() = None;

    fixture.write(0, 4).unwrap();
    assert!(handle.dirty());
    assert_eq!(
        fixture.memory.last_protection(0, false),
        Some(MemoryPermission::READ_AND_WRITE)
    );
    assert_eq!(*triggered.lock(), None);

    for call in fixture.memory.protections() {
        assert_eq!((call.address, call.size), (0, PAGE_SIZE));
    }

    handle.dispose();
}

#[test]
fn test_reprotect_as_dirty_keeps_pages_writable() {
    let fixture = TrackingFixture::new();
    let handle = fixture.tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap();

    handle.reprotect(true);
    assert!(handle.dirty());
    assert_eq!(
        fixture.memory.last_protection(0, false),
        Some(MemoryPermission::READ_AND_WRITE)
    );
}

#[test]
fn test_precise_action() {
    let fixture = TrackingFixture::new();
    let handle = fixture.tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap();
    let precise = EventOptions {
        precise: true,
        ..Default::default()
    };

    let precise_hit = Arc::new(Mutex::new(None));
    let sink = precise_hit.clone();
    handle.register_precise_action(Arc::new(move |address, size, write| {
        *sink.lock() = Some((address, size, write));
        true
    }));

    let read_hit = Arc::new(Mutex::new(None));
    let sink = read_hit.clone();
    handle.register_action(Arc::new(move |address, size| {
        *sink.lock() = Some((address, size));
    }));

    handle.reprotect(false);

    let tracking = &fixture.tracking;
    tracking.virtual_memory_event_with(0, 4, false, precise).unwrap();
    assert_eq!(*read_hit.lock(), None, "precise action consumed the access");
    assert_eq!(*precise_hit.lock(), Some((0, 4, false)));

    tracking.virtual_memory_event_with(0, 4, true, precise).unwrap();
    assert_eq!(*read_hit.lock(), None);
    assert!(!handle.dirty());
    assert_eq!(*precise_hit.lock(), Some((0, 4, true)));

    handle.reprotect(true);
    *precise_hit.lock() = None;

    tracking.virtual_memory_event_with(4, 4, true, precise).unwrap();
    assert_eq!(*precise_hit.lock(), Some((4, 4, true)), "runs even when dirty");

    handle.reprotect(false);
    let sink = precise_hit.clone();
    handle.register_precise_action(Arc::new(move |address, size, write| {
        *sink.lock() = Some((address, size, write));
        false
    }));

    tracking.virtual_memory_event_with(8, 4, true, precise).unwrap();
    assert_eq!(*read_hit.lock(), Some((8, 4)));
    assert!(handle.dirty());
    assert_eq!(*precise_hit.lock(), Some((8, 4, true)));
}

#[test]
fn test_precise_event_without_regions_is_ignored() {
    let fixture = TrackingFixture::new();
    let options = EventOptions {
        precise: true,
        ..Default::default()
    };

    fixture
        .tracking
        .virtual_memory_event_with(0x3000, 4, true, options)
        .unwrap();
    assert!(fixture.memory.protections().is_empty());
    assert_eq!(fixture.tracking.stats().snapshot().race_recoveries, 0);
}

/// ============================================================================
/// EVENT ROUTING
/// ============================================================================

#[test]
fn test_exempt_id_skips_own_handles() {
    let fixture = TrackingFixture::new();
    let own = fixture.tracking.begin_tracking(0, PAGE_SIZE, 7).unwrap();
    let other = fixture.tracking.begin_tracking(0, PAGE_SIZE, 8).unwrap();
    own.reprotect(false);
    other.reprotect(false);

    let options = EventOptions {
        exempt_id: Some(7),
        ..Default::default()
    };
    fixture
        .tracking
        .virtual_memory_event_with(0x10, 4, true, options)
        .unwrap();

    assert!(!own.dirty());
    assert!(other.dirty());
}

#[test]
fn test_untracked_mapped_access_is_recovered() {
    let fixture = TrackingFixture::new();

    fixture.write(0x7010, 4).unwrap();

    let calls = fixture.memory.protections();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].address, 0x7000);
    assert_eq!(calls[0].size, PAGE_SIZE);
    assert_eq!(calls[0].permission, MemoryPermission::READ_AND_WRITE);
    assert_eq!(fixture.tracking.stats().snapshot().race_recoveries, 1);
}

#[test]
fn test_untracked_unmapped_access_is_invalid() {
    let memory = Arc::new(common::MockVirtualMemoryManager::new(PAGE_SIZE));
    memory.set_unmapped(0x7000, PAGE_SIZE);

    let reported = Arc::new(Mutex::new(Vec::<u64>::new()));
    let sink = reported.clone();
    let tracking = nxtrack::MemoryTracking::with_invalid_access_handler(
        memory.clone(),
        TrackingConfig::with_page_size(PAGE_SIZE),
        Some(Arc::new(move |address: u64| sink.lock().push(address))),
    )
    .unwrap();

    let result = tracking.virtual_memory_event(0x7010, 4, true);
    assert!(matches!(
        result,
        Err(TrackingError::InvalidMemoryRegion {
            address: 0x7010,
            size: 4
        })
    ));
    assert_eq!(*reported.lock(), vec![0x7010]);
    assert!(memory.protections().is_empty());
}

#[test]
fn test_dirty_event_fires_on_clean_to_dirty() {
    let fixture = TrackingFixture::new();
    let handle = fixture.tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    handle.register_dirty_event(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    handle.reprotect(false);
    fixture.write(0, 4).unwrap();
    fixture.write(8, 4).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    handle.reprotect(false);
    fixture.write(0, 4).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn test_pre_action_snapshot() {
    let fixture = TrackingFixture::new();
    let handle = fixture.tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap();
    assert!(handle.pre_action().is_none());

    handle.register_action(Arc::new(|_, _| {}));
    assert!(handle.pre_action().is_some());

    fixture.read(0, 1).unwrap();
    assert!(handle.pre_action().is_none());
}

#[test]
fn test_action_registered_from_inside_action_survives() {
    let fixture = TrackingFixture::new();
    let handle = Arc::new(fixture.tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap());
    handle.reprotect(false);

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let weak = Arc::downgrade(&handle);
    handle.register_action(Arc::new(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = weak.upgrade() {
            let counter = counter.clone();
            handle.register_action(Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
    }));

    fixture.read(0, 4).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(handle.pre_action().is_some());

    fixture.read(0, 4).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert!(handle.pre_action().is_none());
}

/// ============================================================================
/// GUEST VIEW
/// ============================================================================

#[test]
fn test_unaligned_access_covers_previous_guest_page() {
    let config = TrackingConfig {
        single_byte_guest_tracking: true,
        ..TrackingConfig::with_page_size(PAGE_SIZE)
    };
    let fixture = TrackingFixture::with_config(config);
    let tracking = &fixture.tracking;

    let handle = tracking
        .begin_tracking_with_flags(PAGE_SIZE * 2, PAGE_SIZE, 0, RegionFlags::UNALIGNED_ACCESS)
        .unwrap();
    handle.reprotect(false);

    assert_eq!(tracking.region_count(), 1);
    assert_eq!(tracking.guest_region_count(), 1);
    assert_eq!(
        fixture.memory.last_protection(PAGE_SIZE, true),
        Some(MemoryPermission::READ)
    );

    // A host access to the previous page is not tracked.
    fixture.write(PAGE_SIZE * 2 - 1, 1).unwrap();
    assert!(!handle.dirty());

    // A guest access starting there may spill into the handle.
    let guest = EventOptions {
        guest: true,
        ..Default::default()
    };
    tracking
        .virtual_memory_event_with(PAGE_SIZE * 2 - 1, 1, true, guest)
        .unwrap();
    assert!(handle.dirty());
}

#[test]
fn test_stats_can_be_disabled() {
    let config = TrackingConfig {
        stats_enabled: false,
        ..TrackingConfig::with_page_size(PAGE_SIZE)
    };
    let fixture = TrackingFixture::with_config(config);
    let handle = fixture.tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap();

    handle.reprotect(false);
    fixture.write(0, 4).unwrap();
    fixture.write(0x5000, 4).unwrap();

    assert_eq!(fixture.tracking.stats().snapshot(), Default::default());
}

#[test]
fn test_stats_count_activity() {
    let fixture = TrackingFixture::new();
    let handle = fixture.tracking.begin_tracking(0, PAGE_SIZE, 0).unwrap();

    handle.reprotect(false);
    handle.register_action(Arc::new(|_, _| {}));
    fixture.read(0, 4).unwrap();

    let stats = fixture.tracking.stats().snapshot();
    assert_eq!(stats.actions_fired, 1);
    assert!(stats.signals >= 1);
    assert_eq!(
        stats.protection_changes as usize,
        fixture.memory.protections().len()
    );
}
