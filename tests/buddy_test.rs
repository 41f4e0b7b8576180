//! Integration tests for the buddy layer: conservation, coalescing,
//! watermark admission and the reclaim escalation ladder.

#![no_std]

extern crate alloc;
extern crate zoned_slab_allocator;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicUsize, Ordering};

use kspin::SpinNoIrq;
use zoned_slab_allocator::{
    AllocError, AllocPolicy, BuddyAllocator, MemoryBank, ReclaimHook, Watermarks, ZoneClass,
};

const PAGE_SIZE: usize = 0x1000;
const TEST_HEAP_SIZE: usize = 16 * 1024 * 1024;

fn alloc_test_heap(size: usize) -> (*mut u8, Layout) {
    let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc::alloc::alloc(layout) };
    assert!(!ptr.is_null(), "Failed to allocate test heap");
    (ptr, layout)
}

fn dealloc_test_heap(ptr: *mut u8, layout: Layout) {
    unsafe { alloc::alloc::dealloc(ptr, layout) };
}

fn single_zone(base: usize, size: usize, cpus: usize) -> BuddyAllocator {
    let mut a = BuddyAllocator::new(cpus);
    a.add_zone(MemoryBank {
        base,
        size,
        class: ZoneClass::Normal,
    })
    .unwrap();
    a
}

#[test]
fn test_full_coalescing_round_trip() {
    // A 1024-page zone seeds as one maximal run, splinters under a mixed
    // workload, and coalesces back to one maximal run when everything is
    // returned.
    let (ptr, layout) = alloc_test_heap(1024 * PAGE_SIZE);
    let a = single_zone(ptr as usize, 1024 * PAGE_SIZE, 1);

    {
        let zone = a.zone(0).unwrap().lock();
        assert_eq!(zone.free_pages(), 1024);
        assert_eq!(zone.free_run_count(10), 1);
    }

    let mut held = Vec::new();
    for order in [0usize, 3, 1, 5, 0, 2, 4, 0, 6] {
        let addr = a.allocate_pages(order, AllocPolicy::ATOMIC, 0).unwrap();
        held.push((addr, order));
    }
    assert!(a.free_page_total() < 1024);

    for &(addr, order) in held.iter().rev() {
        a.free_pages(addr, order, AllocPolicy::empty(), 0).unwrap();
    }
    a.drain_cpu(0).unwrap();

    let zone = a.zone(0).unwrap().lock();
    assert_eq!(zone.free_pages(), 1024);
    assert_eq!(zone.free_run_count(10), 1);
    for order in 0..10 {
        assert_eq!(zone.free_run_count(order), 0);
    }
    drop(zone);

    dealloc_test_heap(ptr, layout);
}

#[test]
fn test_conservation_under_mixed_load() {
    let (ptr, layout) = alloc_test_heap(TEST_HEAP_SIZE);
    let a = single_zone(ptr as usize, TEST_HEAP_SIZE, 1);
    let total = a.free_page_total();

    let mut held = Vec::new();
    for i in 0..200 {
        let order = i % 4;
        match a.allocate_pages(order, AllocPolicy::ATOMIC, 0) {
            Ok(addr) => held.push((addr, order)),
            Err(_) => break,
        }
        if i % 3 == 0 {
            if let Some((addr, order)) = held.pop() {
                a.free_pages(addr, order, AllocPolicy::empty(), 0).unwrap();
            }
        }
    }
    let outstanding: usize = held.iter().map(|&(_, o)| 1usize << o).sum();
    assert_eq!(a.free_page_total(), total - outstanding);

    for (addr, order) in held {
        a.free_pages(addr, order, AllocPolicy::empty(), 0).unwrap();
    }
    assert_eq!(a.free_page_total(), total);

    dealloc_test_heap(ptr, layout);
}

#[test]
fn test_no_double_ownership() {
    let (ptr, layout) = alloc_test_heap(TEST_HEAP_SIZE);
    let a = single_zone(ptr as usize, TEST_HEAP_SIZE, 1);

    let mut held = Vec::new();
    for i in 0..100 {
        let order = i % 3;
        let addr = a.allocate_pages(order, AllocPolicy::ATOMIC, 0).unwrap();
        held.push((addr, addr + (PAGE_SIZE << order)));
    }
    held.sort_unstable();
    for w in held.windows(2) {
        assert!(w[0].1 <= w[1].0, "overlapping runs handed out");
    }

    dealloc_test_heap(ptr, layout);
}

#[test]
fn test_watermark_admission() {
    // Scenario: min raised above the free-page count. Ordinary and atomic
    // requests bounce off the watermark; the emergency reserve does not.
    let (ptr, layout) = alloc_test_heap(TEST_HEAP_SIZE);
    let a = single_zone(ptr as usize, TEST_HEAP_SIZE, 1);

    let free = a.free_page_total();
    a.zone(0).unwrap().lock().watermarks = Watermarks {
        min: free * 2,
        low: free * 2 + 8,
        high: free * 2 + 16,
    };

    assert_eq!(
        a.allocate_pages(0, AllocPolicy::NORMAL, 0),
        Err(AllocError::NoMemory)
    );
    assert_eq!(
        a.allocate_pages(0, AllocPolicy::ATOMIC, 0),
        Err(AllocError::NoMemory)
    );
    // A refused request takes nothing.
    assert_eq!(a.free_page_total(), free);

    let addr = a
        .allocate_pages(0, AllocPolicy::EMERGENCY_RESERVE, 0)
        .unwrap();
    a.free_pages(addr, 0, AllocPolicy::empty(), 0).unwrap();

    dealloc_test_heap(ptr, layout);
}

#[test]
fn test_percpu_stash_bounds() {
    // Scenario: a tight order-0 loop never lets the stash occupancy pass
    // its high-water mark, and drained pages flow back to the free lists.
    let (ptr, layout) = alloc_test_heap(TEST_HEAP_SIZE);
    let a = single_zone(ptr as usize, TEST_HEAP_SIZE, 1);
    let total = a.free_page_total();

    let batch = (TEST_HEAP_SIZE / PAGE_SIZE / 1024).clamp(1, 32);
    let bound = 6 * batch + 2 * batch;

    for _ in 0..500 {
        let addr = a.allocate_pages(0, AllocPolicy::ATOMIC, 0).unwrap();
        a.free_pages(addr, 0, AllocPolicy::empty(), 0).unwrap();
        let resident = a.zone(0).unwrap().lock().percpu_resident(0);
        assert!(resident <= bound, "stash resident {} over bound {}", resident, bound);
    }

    assert_eq!(a.free_page_total(), total);
    a.drain_cpu(0).unwrap();
    assert_eq!(a.zone(0).unwrap().lock().percpu_resident(0), 0);
    assert_eq!(a.free_page_total(), total);

    dealloc_test_heap(ptr, layout);
}

#[test]
fn test_free_foreign_address_rejected() {
    let (ptr, layout) = alloc_test_heap(TEST_HEAP_SIZE);
    let a = single_zone(ptr as usize, TEST_HEAP_SIZE, 1);

    assert_eq!(
        a.free_pages(0xdead_0000, 0, AllocPolicy::empty(), 0),
        Err(AllocError::NotAllocated)
    );

    dealloc_test_heap(ptr, layout);
}

struct TestReclaimer {
    allocator: SpinNoIrq<Option<&'static BuddyAllocator>>,
    stash: SpinNoIrq<Vec<(usize, usize)>>,
    wakes: AtomicUsize,
    reclaims: AtomicUsize,
}

impl TestReclaimer {
    fn new() -> Self {
        Self {
            allocator: SpinNoIrq::new(None),
            stash: SpinNoIrq::new(Vec::new()),
            wakes: AtomicUsize::new(0),
            reclaims: AtomicUsize::new(0),
        }
    }
}

impl ReclaimHook for TestReclaimer {
    fn wake_reclaimer(&self, _zone_id: usize, _order: usize) {
        self.wakes.fetch_add(1, Ordering::Relaxed);
    }

    fn try_to_free_pages(&self, _policy: AllocPolicy) -> usize {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
        let allocator = self.allocator.lock().unwrap();
        let mut freed = 0;
        for _ in 0..4 {
            let Some((addr, order)) = self.stash.lock().pop() else {
                break;
            };
            allocator.free_pages(addr, order, AllocPolicy::empty(), 0).unwrap();
            freed += 1 << order;
        }
        freed
    }
}

#[test]
fn test_reclaim_escalation_order() {
    // Exhaust the zone into the hook's stash, then watch a blocking request
    // wake the background reclaimer and succeed through direct reclaim.
    let (ptr, _layout) = alloc_test_heap(TEST_HEAP_SIZE);

    let hook: &'static TestReclaimer = Box::leak(Box::new(TestReclaimer::new()));
    let mut a = Box::new(single_zone(ptr as usize, TEST_HEAP_SIZE, 1));
    a.set_reclaim_hook(hook);
    let a: &'static BuddyAllocator = Box::leak(a);
    *hook.allocator.lock() = Some(a);

    loop {
        match a.allocate_pages(5, AllocPolicy::ATOMIC, 0) {
            Ok(addr) => hook.stash.lock().push((addr, 5)),
            Err(_) => break,
        }
    }
    assert!(hook.stash.lock().len() > 4);

    let addr = a.allocate_pages(5, AllocPolicy::NORMAL, 0).unwrap();
    assert!(hook.wakes.load(Ordering::Relaxed) >= 1);
    assert!(hook.reclaims.load(Ordering::Relaxed) >= 1);
    a.free_pages(addr, 5, AllocPolicy::empty(), 0).unwrap();

    // The allocator and heap stay leaked: the hook holds them as 'static.
}

#[test]
fn test_cold_free_routes_to_cold_stash() {
    let (ptr, layout) = alloc_test_heap(TEST_HEAP_SIZE);
    let a = single_zone(ptr as usize, TEST_HEAP_SIZE, 1);

    let addr = a.allocate_pages(0, AllocPolicy::ATOMIC, 0).unwrap();
    a.free_pages(addr, 0, AllocPolicy::COLD, 0).unwrap();

    // The page sits in the cold stash: a hot request takes a different
    // frame, and the next cold request pops this one back.
    let hot = a.allocate_pages(0, AllocPolicy::ATOMIC, 0).unwrap();
    assert_ne!(hot, addr);
    let cold = a
        .allocate_pages(0, AllocPolicy::ATOMIC | AllocPolicy::COLD, 0)
        .unwrap();
    assert_eq!(cold, addr);

    a.free_pages(hot, 0, AllocPolicy::empty(), 0).unwrap();
    a.free_pages(cold, 0, AllocPolicy::COLD, 0).unwrap();
    a.drain_cpu(0).unwrap();
    assert_eq!(a.free_page_total(), TEST_HEAP_SIZE / PAGE_SIZE);

    dealloc_test_heap(ptr, layout);
}

#[test]
#[should_panic(expected = "double free")]
fn test_repeated_order0_free_panics() {
    let (ptr, _layout) = alloc_test_heap(TEST_HEAP_SIZE);
    let a = single_zone(ptr as usize, TEST_HEAP_SIZE, 1);

    let addr = a.allocate_pages(0, AllocPolicy::ATOMIC, 0).unwrap();
    a.free_pages(addr, 0, AllocPolicy::empty(), 0).unwrap();
    // The frame is parked in the stash; a second free must not hand two
    // stash entries for one frame to later allocations.
    a.free_pages(addr, 0, AllocPolicy::empty(), 0).unwrap();
}
