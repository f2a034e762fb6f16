/// Kernel heap manager.
///
/// Owns the address range between the first free byte after the image and
/// the end of physical memory, and splits it in two:
///
/// ```text
/// heap_begin            brk_end                     mmap_end   memory_end
///     |  brk (bump) region  |  mmap (page) region        |  ...  |
///     +---------------------+----------------------------+-------+
///      brk_max bytes          4 KiB pages, freeable
/// ```
///
/// The brk region belongs to the application's `brk(2)` alone. The mmap
/// region backs `mmap(2)` and every kernel allocation, so the two users
/// never move the same break.
///
/// Bounds are written once by `init_heap` and only read afterwards. `ready`
/// is stored last with `Release`; every reader checks it with `Acquire`.
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use super::brk::BrkRegion;
use super::mmap::{AllocError, MmapRegion};
use super::{align_down, align_up, MemoryRegion, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    AlreadyInitialized,
    /// `brk_max` is zero or not a whole number of pages.
    InvalidBrkMax(usize),
    /// `free_mem_begin` is not below `memory_end`.
    InvalidRange { free_mem_begin: usize, memory_end: usize },
    AddressOverflow,
    /// Physical memory ends inside the brk region.
    BrkOverflow { brk_end: usize, memory_end: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::AlreadyInitialized => write!(f, "heap already initialized"),
            HeapError::InvalidBrkMax(v) => write!(f, "invalid brk_max {:#x}", v),
            HeapError::InvalidRange { free_mem_begin, memory_end } => write!(
                f,
                "free memory {:#x} is not below memory end {:#x}",
                free_mem_begin, memory_end
            ),
            HeapError::AddressOverflow => write!(f, "heap bounds overflow the address space"),
            HeapError::BrkOverflow { brk_end, memory_end } => write!(
                f,
                "brk region end {:#x} exceeds physical memory end {:#x}",
                brk_end, memory_end
            ),
        }
    }
}

/// Where `init_heap` put everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLayout {
    pub heap_begin: usize,
    pub heap_max: usize,
    pub memory_end: usize,
    pub brk_end: usize,
    pub mmap_end: usize,
}

impl HeapLayout {
    /// Where `init_heap` would put the regions, without touching any heap.
    pub fn plan(free_mem_begin: usize, memory_end: usize, brk_max: usize) -> Result<Self, HeapError> {
        if brk_max == 0 || brk_max % PAGE_SIZE != 0 {
            return Err(HeapError::InvalidBrkMax(brk_max));
        }
        if free_mem_begin >= memory_end {
            return Err(HeapError::InvalidRange { free_mem_begin, memory_end });
        }

        let heap_begin = align_up(free_mem_begin, PAGE_SIZE).ok_or(HeapError::AddressOverflow)?;
        let heap_max = memory_end - 1;
        let brk_end = heap_begin.checked_add(brk_max).ok_or(HeapError::AddressOverflow)?;
        if brk_end >= memory_end {
            return Err(HeapError::BrkOverflow { brk_end, memory_end });
        }
        // Page region stops at or below heap_max so usage never exceeds
        // heap_max - heap_begin.
        let mmap_end = align_down(heap_max, PAGE_SIZE).max(brk_end);

        Ok(Self { heap_begin, heap_max, memory_end, brk_end, mmap_end })
    }

    pub fn brk_region(&self) -> MemoryRegion {
        MemoryRegion::new(self.heap_begin, self.brk_end)
    }

    pub fn mmap_region(&self) -> MemoryRegion {
        MemoryRegion::new(self.brk_end, self.mmap_end)
    }
}

pub struct Heap {
    brk: Mutex<BrkRegion>,
    mmap: Mutex<MmapRegion>,
    heap_begin: AtomicUsize,
    heap_max: AtomicUsize,
    memory_end: AtomicUsize,
    liveupdate_size: AtomicUsize,
    claimed: AtomicBool,
    ready: AtomicBool,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            brk: Mutex::new(BrkRegion::new()),
            mmap: Mutex::new(MmapRegion::new()),
            heap_begin: AtomicUsize::new(0),
            heap_max: AtomicUsize::new(0),
            memory_end: AtomicUsize::new(0),
            liveupdate_size: AtomicUsize::new(0),
            claimed: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        }
    }

    /// Bring up both regions over `[free_mem_begin, memory_end)`.
    ///
    /// `free_mem_begin` is rounded up to a page. Fails when memory ends at or
    /// before the end of the brk region; on failure the heap stays unready.
    pub fn init_heap(
        &self,
        free_mem_begin: usize,
        memory_end: usize,
        brk_max: usize,
    ) -> Result<HeapLayout, HeapError> {
        let layout = HeapLayout::plan(free_mem_begin, memory_end, brk_max)?;
        let HeapLayout { heap_begin, heap_max, brk_end, mmap_end, .. } = layout;

        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HeapError::AlreadyInitialized);
        }

        self.brk.lock().init(heap_begin, brk_max);
        self.mmap.lock().init(brk_end, mmap_end);

        self.heap_begin.store(heap_begin, Ordering::Relaxed);
        self.heap_max.store(heap_max, Ordering::Relaxed);
        self.memory_end.store(memory_end, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);

        log::info!(
            "heap: brk {:#x}..{:#x}, mmap {:#x}..{:#x}, memory end {:#x}",
            heap_begin,
            brk_end,
            brk_end,
            mmap_end,
            memory_end
        );

        Ok(layout)
    }

    pub fn heap_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn assert_ready(&self) {
        if !self.heap_ready() {
            panic!("heap used before init_heap");
        }
    }

    pub fn heap_begin(&self) -> usize {
        self.assert_ready();
        self.heap_begin.load(Ordering::Relaxed)
    }

    pub fn heap_max(&self) -> usize {
        self.assert_ready();
        self.heap_max.load(Ordering::Relaxed)
    }

    pub fn memory_end(&self) -> usize {
        self.assert_ready();
        self.memory_end.load(Ordering::Relaxed)
    }

    pub fn heap_usage(&self) -> usize {
        self.assert_ready();
        let brk = self.brk.lock().bytes_used();
        let mmap = self.mmap.lock().bytes_used();
        brk + mmap
    }

    pub fn heap_avail(&self) -> usize {
        let capacity = self.heap_max() - self.heap_begin();
        let usage = self.heap_usage();
        match capacity.checked_sub(usage) {
            Some(avail) => avail,
            None => panic!("heap usage {:#x} exceeds capacity {:#x}", usage, capacity),
        }
    }

    /// High-water mark of the page region. Never decreases.
    pub fn heap_end(&self) -> usize {
        self.assert_ready();
        self.mmap.lock().allocation_end()
    }

    pub fn total_memuse(&self) -> usize {
        self.heap_usage() + self.liveupdate_size.load(Ordering::Relaxed) + self.heap_begin()
    }

    pub fn liveupdate_size(&self) -> usize {
        self.liveupdate_size.load(Ordering::Relaxed)
    }

    pub fn set_liveupdate_size(&self, bytes: usize) {
        self.liveupdate_size.store(bytes, Ordering::Relaxed);
    }

    /// Current program break.
    pub fn brk_current(&self) -> usize {
        self.assert_ready();
        self.brk.lock().current()
    }

    pub fn sbrk(&self, increment: usize) -> Option<usize> {
        if !self.heap_ready() {
            return None;
        }
        self.brk.lock().sbrk(increment)
    }

    /// `brk(2)` semantics; see [`BrkRegion::set_break`].
    pub fn set_break(&self, addr: usize) -> usize {
        self.assert_ready();
        self.brk.lock().set_break(addr)
    }

    pub fn map_pages(&self, count: usize) -> Result<usize, AllocError> {
        if !self.heap_ready() {
            return Err(AllocError::NotReady);
        }
        self.mmap.lock().alloc_pages(count)
    }

    pub fn unmap_pages(&self, addr: usize, count: usize) -> Result<(), AllocError> {
        if !self.heap_ready() {
            return Err(AllocError::NotReady);
        }
        self.mmap.lock().free_pages(addr, count)
    }
}
