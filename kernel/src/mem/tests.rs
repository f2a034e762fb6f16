/// Unit tests for the heap manager and the kernel allocator.
///
/// Heap bounds are plain integers, so most tests run over made-up physical
/// addresses. The allocator tests write through the pointers they get back
/// and therefore run over a leaked host buffer.
/// Run with: cargo test -p ember-kernel --lib
use core::alloc::{GlobalAlloc, Layout};

use super::*;

const MIB: usize = 0x10_0000;
const BRK_MAX: usize = MIB;

fn fresh_heap() -> Box<Heap> {
    Box::new(Heap::new())
}

fn leaked_heap() -> &'static Heap {
    Box::leak(Box::new(Heap::new()))
}

/// A page-aligned host buffer of `size` bytes that lives for the whole run.
fn arena(size: usize) -> (usize, usize) {
    let buf: &'static mut [u8] = Vec::leak(vec![0u8; size + PAGE_SIZE]);
    let begin = align_up(buf.as_ptr() as usize, PAGE_SIZE).unwrap();
    (begin, begin + size)
}

// ---- init_heap ----

#[test]
fn init_sets_aligned_bounds_and_ready() {
    let pairs = [
        (0x20_0000, 0x800_0000),
        (0x10_0000, 0x10_0000 + BRK_MAX + PAGE_SIZE),
        (0x40_0000, 0x1_0000_0000),
        (0x7f_f000, 0x200_0000),
    ];
    for (free, end) in pairs {
        let heap = fresh_heap();
        assert!(!heap.heap_ready());

        let layout = heap.init_heap(free, end, BRK_MAX).unwrap();
        assert!(heap.heap_ready());
        assert_eq!(heap.heap_begin() % PAGE_SIZE, 0);
        assert!(heap.heap_begin() <= heap.heap_max());
        assert!(heap.heap_max() < heap.memory_end());
        assert_eq!(heap.heap_max(), end - 1);
        assert_eq!(layout.brk_end, layout.heap_begin + BRK_MAX);
        assert!(layout.mmap_end <= layout.heap_max);
    }
}

#[test]
fn unaligned_free_start_rounds_up() {
    let heap = fresh_heap();
    let layout = heap.init_heap(0x12_3456, 0x400_0000, BRK_MAX).unwrap();
    assert_eq!(layout.heap_begin, 0x12_4000);
    assert_eq!(heap.heap_begin(), 0x12_4000);
}

#[test]
fn memory_not_larger_than_brk_max_fails() {
    for extra in [0, 1, PAGE_SIZE, BRK_MAX] {
        let free = 0x20_0000;
        let end = free + BRK_MAX - extra;
        let heap = fresh_heap();
        let err = heap.init_heap(free, end, BRK_MAX).unwrap_err();
        assert!(
            matches!(err, HeapError::BrkOverflow { .. } | HeapError::InvalidRange { .. }),
            "{:?}",
            err
        );
        assert!(!heap.heap_ready());
    }
}

#[test]
fn exactly_brk_max_fails() {
    let heap = fresh_heap();
    assert_eq!(
        heap.init_heap(0x20_0000, 0x20_0000 + BRK_MAX, BRK_MAX),
        Err(HeapError::BrkOverflow { brk_end: 0x20_0000 + BRK_MAX, memory_end: 0x20_0000 + BRK_MAX })
    );
    assert!(!heap.heap_ready());
}

#[test]
fn rejects_bad_arguments() {
    let heap = fresh_heap();
    assert_eq!(heap.init_heap(0x1000, 0x800_0000, 0), Err(HeapError::InvalidBrkMax(0)));
    assert_eq!(heap.init_heap(0x1000, 0x800_0000, 0x1800), Err(HeapError::InvalidBrkMax(0x1800)));
    assert!(matches!(heap.init_heap(0x800_0000, 0x1000, BRK_MAX), Err(HeapError::InvalidRange { .. })));
    assert_eq!(heap.init_heap(usize::MAX - 10, usize::MAX, BRK_MAX), Err(HeapError::AddressOverflow));
    // Failed attempts don't consume the one-shot claim.
    assert!(heap.init_heap(0x20_0000, 0x800_0000, BRK_MAX).is_ok());
}

#[test]
fn second_init_is_refused() {
    let heap = fresh_heap();
    heap.init_heap(0x20_0000, 0x800_0000, BRK_MAX).unwrap();
    assert_eq!(heap.init_heap(0x20_0000, 0x800_0000, BRK_MAX), Err(HeapError::AlreadyInitialized));
    assert_eq!(heap.heap_begin(), 0x20_0000);
}

#[test]
fn plan_matches_init_without_claiming() {
    let plan = HeapLayout::plan(0x12_3456, 0x400_0000, BRK_MAX).unwrap();
    assert!(matches!(
        HeapLayout::plan(0x20_0000, 0x20_0000 + BRK_MAX, BRK_MAX),
        Err(HeapError::BrkOverflow { .. })
    ));

    let heap = fresh_heap();
    assert!(!heap.heap_ready());
    assert_eq!(heap.init_heap(0x12_3456, 0x400_0000, BRK_MAX), Ok(plan));
}

// ---- queries ----

#[test]
#[should_panic(expected = "heap used before init_heap")]
fn query_before_init_is_fatal() {
    let heap = fresh_heap();
    heap.heap_usage();
}

#[test]
fn avail_plus_usage_is_capacity() {
    let heap = fresh_heap();
    heap.init_heap(0x20_0000, 0x800_0000, BRK_MAX).unwrap();
    let capacity = heap.heap_max() - heap.heap_begin();

    assert_eq!(heap.heap_usage(), 0);
    assert_eq!(heap.heap_avail(), capacity);

    heap.sbrk(0x3000).unwrap();
    let a = heap.map_pages(5).unwrap();
    heap.map_pages(1).unwrap();
    assert_eq!(heap.heap_usage(), 0x3000 + 6 * PAGE_SIZE);
    assert_eq!(heap.heap_avail() + heap.heap_usage(), capacity);

    heap.unmap_pages(a, 5).unwrap();
    assert_eq!(heap.heap_usage(), 0x3000 + PAGE_SIZE);
    assert_eq!(heap.heap_avail() + heap.heap_usage(), capacity);
}

#[test]
fn usage_cannot_exceed_capacity() {
    // Page-aligned memory end: the last page is not handed out.
    let heap = fresh_heap();
    let layout = heap.init_heap(0x20_0000, 0x20_0000 + BRK_MAX + 4 * PAGE_SIZE, BRK_MAX).unwrap();
    assert_eq!(layout.mmap_end - layout.brk_end, 3 * PAGE_SIZE);

    heap.sbrk(BRK_MAX).unwrap();
    heap.map_pages(3).unwrap();
    assert_eq!(heap.map_pages(1), Err(AllocError::OutOfMemory));
    assert_eq!(heap.heap_avail(), PAGE_SIZE - 1);
}

#[test]
fn queries_are_idempotent() {
    let heap = fresh_heap();
    heap.init_heap(0x20_0000, 0x800_0000, BRK_MAX).unwrap();
    heap.sbrk(0x40).unwrap();
    heap.map_pages(2).unwrap();

    let first = (heap.heap_ready(), heap.heap_usage(), heap.heap_avail(), heap.heap_end(), heap.total_memuse());
    for _ in 0..4 {
        let again = (heap.heap_ready(), heap.heap_usage(), heap.heap_avail(), heap.heap_end(), heap.total_memuse());
        assert_eq!(first, again);
    }
}

#[test]
fn heap_end_tracks_page_high_water() {
    let heap = fresh_heap();
    let layout = heap.init_heap(0x20_0000, 0x800_0000, BRK_MAX).unwrap();
    assert_eq!(heap.heap_end(), layout.brk_end);

    let a = heap.map_pages(3).unwrap();
    let end = heap.heap_end();
    assert_eq!(end, layout.brk_end + 3 * PAGE_SIZE);
    heap.unmap_pages(a, 3).unwrap();
    assert_eq!(heap.heap_end(), end);
}

#[test]
fn total_memuse_counts_liveupdate_and_low_memory() {
    let heap = fresh_heap();
    heap.init_heap(0x20_0000, 0x800_0000, BRK_MAX).unwrap();
    heap.sbrk(0x100).unwrap();
    heap.set_liveupdate_size(0x4_0000);
    assert_eq!(heap.total_memuse(), 0x100 + 0x4_0000 + 0x20_0000);
}

#[test]
fn brk_syscall_semantics_through_heap() {
    let heap = fresh_heap();
    let layout = heap.init_heap(0x20_0000, 0x800_0000, BRK_MAX).unwrap();
    assert_eq!(heap.set_break(0), layout.heap_begin);
    assert_eq!(heap.set_break(layout.heap_begin + 0x2000), layout.heap_begin + 0x2000);
    assert_eq!(heap.set_break(layout.brk_end + 1), layout.heap_begin + 0x2000);
    assert_eq!(heap.heap_usage(), 0x2000);
}

#[test]
fn region_ops_before_init_fail_softly() {
    let heap = fresh_heap();
    assert_eq!(heap.sbrk(16), None);
    assert_eq!(heap.map_pages(1), Err(AllocError::NotReady));
}

// ---- KernelAllocator ----

fn allocator(arena_size: usize, brk_max: usize) -> (&'static Heap, KernelAllocator) {
    let heap = leaked_heap();
    let (begin, end) = arena(arena_size);
    heap.init_heap(begin, end, brk_max).unwrap();
    (heap, KernelAllocator::new(heap))
}

#[test]
fn alloc_before_ready_returns_null() {
    let heap = leaked_heap();
    let a = KernelAllocator::new(heap);
    let p = unsafe { a.alloc(Layout::from_size_align(32, 8).unwrap()) };
    assert!(p.is_null());
}

#[test]
fn small_allocations_come_from_pages() {
    let (heap, a) = allocator(64 * PAGE_SIZE, 16 * PAGE_SIZE);
    let layout = Layout::from_size_align(24, 8).unwrap();

    let p = unsafe { a.alloc(layout) };
    let q = unsafe { a.alloc(layout) };
    assert!(!p.is_null() && !q.is_null());
    assert_ne!(p, q);
    assert_eq!(p as usize % 16, 0);
    // One page chunk mapped, the brk region untouched.
    assert_eq!(heap.heap_usage(), PAGE_SIZE);
    assert_eq!(heap.brk_current(), heap.heap_begin());
    assert!(heap.heap_end() > p as usize);

    unsafe {
        p.write_bytes(0xAB, 24);
        q.write_bytes(0xCD, 24);
        assert_eq!(*p.add(23), 0xAB);
        a.dealloc(p, layout);
    }
    // Freed entry is reused before another page is mapped.
    let r = unsafe { a.alloc(layout) };
    assert_eq!(r, p);
}

#[test]
fn kernel_allocations_stay_out_of_application_brk() {
    let (heap, a) = allocator(64 * PAGE_SIZE, 16 * PAGE_SIZE);
    let layout = Layout::from_size_align(64, 8).unwrap();
    let b0 = heap.set_break(0);

    let first = heap.set_break(b0 + PAGE_SIZE);
    assert_eq!(first, b0 + PAGE_SIZE);
    let p = unsafe { a.alloc(layout) } as usize;
    let grown = heap.set_break(first + PAGE_SIZE);
    assert_eq!(grown, first + PAGE_SIZE);
    let q = unsafe { a.alloc(layout) } as usize;

    let app = b0..grown;
    assert!(!app.contains(&p), "kernel object {:#x} inside brk {:#x?}", p, app);
    assert!(!app.contains(&q), "kernel object {:#x} inside brk {:#x?}", q, app);

    // Shrinking the break hands nothing to the allocator either.
    heap.set_break(b0);
    for _ in 0..64 {
        let r = unsafe { a.alloc(layout) } as usize;
        assert!(r < b0 || r >= b0 + 16 * PAGE_SIZE);
    }
}

#[test]
fn large_allocations_map_and_unmap_pages() {
    let (heap, a) = allocator(64 * PAGE_SIZE, 16 * PAGE_SIZE);
    let layout = Layout::from_size_align(3 * PAGE_SIZE, 8).unwrap();

    let before = heap.heap_usage();
    let p = unsafe { a.alloc(layout) };
    assert!(!p.is_null());
    unsafe { p.write_bytes(0x5A, layout.size()) };
    assert_eq!(heap.heap_usage(), before + 4 * PAGE_SIZE);

    unsafe { a.dealloc(p, layout) };
    assert_eq!(heap.heap_usage(), before);
}

#[test]
fn over_aligned_allocation() {
    let (_heap, a) = allocator(64 * PAGE_SIZE, 16 * PAGE_SIZE);
    for align in [64, PAGE_SIZE, 4 * PAGE_SIZE] {
        let layout = Layout::from_size_align(100, align).unwrap();
        let p = unsafe { a.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0);
        unsafe {
            p.write_bytes(1, 100);
            a.dealloc(p, layout);
        }
    }
}

#[test]
fn largest_class_takes_a_page_per_entry() {
    let (heap, a) = allocator(32 * PAGE_SIZE, PAGE_SIZE);
    let layout = Layout::from_size_align(2048, 16).unwrap();

    // 2048 + header leaves room for one entry per chunk.
    let p = unsafe { a.alloc(layout) };
    let q = unsafe { a.alloc(layout) };
    assert!(!p.is_null() && !q.is_null());
    assert_eq!(heap.heap_usage(), 2 * PAGE_SIZE);
    assert!(heap.heap_end() > q as usize);
}

#[test]
fn exhaustion_returns_null() {
    let (_heap, a) = allocator(8 * PAGE_SIZE, PAGE_SIZE);
    let layout = Layout::from_size_align(64 * PAGE_SIZE, 8).unwrap();
    assert!(unsafe { a.alloc(layout) }.is_null());
}
