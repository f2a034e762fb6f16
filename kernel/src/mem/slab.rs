/// Kernel allocator, slab based, sitting on top of the heap regions.
///
/// Design:
/// - Fixed-size slab classes: 16, 32, 64, 128, 256, 512, 1024, 2048 bytes
/// - Slabs are carved from single pages of the page region; the brk region
///   belongs to the application's `brk(2)` and is never touched here
/// - Larger or over-aligned requests map pages directly and give them back
///   on free
/// - Each allocation has a hidden 16-byte header in front of the returned
///   pointer recording where it came from
///
/// Before the heap is ready every allocation returns null.
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use spin::Mutex;

use super::heap::Heap;
use super::PAGE_SIZE;

/// Allocation header, stored immediately before the returned pointer.
#[repr(C)]
struct AllocHeader {
    /// Slab: class size. Large: number of pages.
    size: usize,
    /// Slab: class index. Large: address of the first page (always >= PAGE_SIZE).
    tag: usize,
}

const HEADER_SIZE: usize = 16;
static_assertions::const_assert!(core::mem::size_of::<AllocHeader>() <= HEADER_SIZE);

/// Minimum alignment of every returned pointer.
const MIN_ALIGN: usize = 16;

const SLAB_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

struct FreeNode {
    next: *mut FreeNode,
}

struct SlabInner {
    free_lists: [*mut FreeNode; SLAB_CLASSES.len()],
}

unsafe impl Send for SlabInner {}

pub struct KernelAllocator {
    heap: &'static Heap,
    inner: Mutex<SlabInner>,
}

unsafe impl Sync for KernelAllocator {}

impl KernelAllocator {
    pub const fn new(heap: &'static Heap) -> Self {
        Self {
            heap,
            inner: Mutex::new(SlabInner { free_lists: [ptr::null_mut(); SLAB_CLASSES.len()] }),
        }
    }

    fn class_for_size(size: usize) -> Option<usize> {
        SLAB_CLASSES.iter().position(|&s| s >= size)
    }

    /// One page for a slab chunk.
    fn take_chunk(&self) -> Option<usize> {
        self.heap.map_pages(1).ok()
    }

    /// Split a fresh chunk into entries of `class` and push them on its list.
    fn refill_class(&self, inner: &mut SlabInner, class: usize) -> bool {
        let entry_size = SLAB_CLASSES[class] + HEADER_SIZE;
        let entries = PAGE_SIZE / entry_size;

        let base = match self.take_chunk() {
            Some(addr) => addr as *mut u8,
            None => return false,
        };

        for i in 0..entries {
            unsafe {
                let entry = base.add(i * entry_size);
                let header = entry as *mut AllocHeader;
                (*header).size = SLAB_CLASSES[class];
                (*header).tag = class;

                let node = entry.add(HEADER_SIZE) as *mut FreeNode;
                (*node).next = inner.free_lists[class];
                inner.free_lists[class] = node;
            }
        }
        true
    }

    fn alloc_large(&self, layout: Layout) -> *mut u8 {
        let offset = layout.align().max(HEADER_SIZE);
        let total = match layout.size().checked_add(offset) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        let pages = total.div_ceil(PAGE_SIZE);

        let base = match self.heap.map_pages(pages) {
            Ok(addr) => addr,
            Err(_) => return ptr::null_mut(),
        };

        // Round past the header up to the requested alignment.
        let user = (base + HEADER_SIZE + layout.align() - 1) & !(layout.align() - 1);
        unsafe {
            let header = (user - HEADER_SIZE) as *mut AllocHeader;
            (*header).size = pages;
            (*header).tag = base;
        }
        user as *mut u8
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !self.heap.heap_ready() {
            return ptr::null_mut();
        }

        let class = if layout.align() <= MIN_ALIGN {
            Self::class_for_size(layout.size().max(1))
        } else {
            None
        };

        let Some(class) = class else {
            return self.alloc_large(layout);
        };

        let mut inner = self.inner.lock();
        if inner.free_lists[class].is_null() && !self.refill_class(&mut inner, class) {
            return ptr::null_mut();
        }

        let node = inner.free_lists[class];
        inner.free_lists[class] = unsafe { (*node).next };
        node as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }

        let header = unsafe { &*(ptr.sub(HEADER_SIZE) as *const AllocHeader) };

        if header.tag >= PAGE_SIZE {
            let (base, pages) = (header.tag, header.size);
            if let Err(e) = self.heap.unmap_pages(base, pages) {
                log::error!("heap: bad large free at {:#x}: {}", ptr as usize, e);
            }
        } else {
            let class = header.tag;
            let mut inner = self.inner.lock();
            let node = ptr as *mut FreeNode;
            unsafe { (*node).next = inner.free_lists[class] };
            inner.free_lists[class] = node;
        }
    }
}
