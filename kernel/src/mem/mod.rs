pub mod brk;
pub mod heap;
pub mod map;
pub mod mmap;
pub mod slab;

#[cfg(test)]
mod tests;

pub use brk::BrkRegion;
pub use heap::{Heap, HeapError, HeapLayout};
pub use map::{MemoryMap, MemoryMapError};
pub use mmap::{AllocError, MmapRegion};
pub use slab::KernelAllocator;

pub const PAGE_SIZE: usize = 4096;

/// Half-open address range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub begin: usize,
    pub end: usize,
}

impl MemoryRegion {
    pub const fn new(begin: usize, end: usize) -> Self {
        Self { begin, end }
    }

    pub const fn size(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    pub const fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

/// Round `addr` up to `align` (a power of two). `None` on overflow.
pub const fn align_up(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// The kernel heap. Lives in `.bss` and is brought up by `Machine::init`.
pub static HEAP: Heap = Heap::new();

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator::new(&HEAP);

/// Bytes in use across both heap regions.
pub fn heap_usage() -> usize {
    HEAP.heap_usage()
}

/// Bytes still available to the heap.
pub fn heap_avail() -> usize {
    HEAP.heap_avail()
}

/// High-water mark of the page region.
pub fn heap_end() -> usize {
    HEAP.heap_end()
}

pub fn heap_ready() -> bool {
    HEAP.heap_ready()
}

/// Heap usage plus the live-update reservation plus everything below the heap.
pub fn total_memuse() -> usize {
    HEAP.total_memuse()
}
