/// Page (mmap) region, bitmap based.
///
/// Tracks 4 KiB pages of `[begin, end)` via a bitmap, one bit per page,
/// 0 = free. Hands out contiguous runs first-fit and takes them back
/// individually, which is what `mmap`/`munmap` and large kernel
/// allocations need.
///
/// The bitmap is stored inline and starts all-zero so the region can live in
/// a zero-initialized static.
use core::fmt;

use super::PAGE_SIZE;

/// Largest region we track: 4 GiB = 1M pages. Bitmap = 128 KiB.
pub const MAX_PAGES: usize = 1024 * 1024;
const BITMAP_WORDS: usize = MAX_PAGES / 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    OutOfMemory,
    InvalidSize,
    /// Address not page aligned or not inside the region.
    OutOfRange(usize),
    NotReady,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of heap pages"),
            AllocError::InvalidSize => write!(f, "invalid size"),
            AllocError::OutOfRange(addr) => write!(f, "address {:#x} outside the page region", addr),
            AllocError::NotReady => write!(f, "heap not initialized"),
        }
    }
}

pub struct MmapRegion {
    bitmap: [u64; BITMAP_WORDS],
    begin: usize,
    total_pages: usize,
    used_pages: usize,
    /// One past the highest page ever handed out.
    high_water: usize,
}

impl MmapRegion {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            begin: 0,
            total_pages: 0,
            used_pages: 0,
            high_water: 0,
        }
    }

    /// Manage `[begin, end)`. `begin` must be page aligned; a partial page
    /// at the end is not used. Regions above `MAX_PAGES` pages are clamped.
    pub fn init(&mut self, begin: usize, end: usize) {
        debug_assert_eq!(begin % PAGE_SIZE, 0);
        self.bitmap.fill(0);
        self.begin = begin;
        self.total_pages = (end.saturating_sub(begin) / PAGE_SIZE).min(MAX_PAGES);
        self.used_pages = 0;
        self.high_water = 0;
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    /// End of the managed pages.
    pub fn end(&self) -> usize {
        self.begin + self.total_pages * PAGE_SIZE
    }

    pub fn bytes_used(&self) -> usize {
        self.used_pages * PAGE_SIZE
    }

    pub fn free_count(&self) -> usize {
        self.total_pages - self.used_pages
    }

    pub fn total_count(&self) -> usize {
        self.total_pages
    }

    /// High-water mark: the end of the highest run ever allocated. Never
    /// moves down, even when that run is freed.
    pub fn allocation_end(&self) -> usize {
        self.begin + self.high_water * PAGE_SIZE
    }

    fn is_used(&self, page: usize) -> bool {
        self.bitmap[page / 64] & (1 << (page % 64)) != 0
    }

    /// Allocate `count` contiguous pages. Returns the address of the first.
    pub fn alloc_pages(&mut self, count: usize) -> Result<usize, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidSize);
        }
        if self.free_count() < count {
            return Err(AllocError::OutOfMemory);
        }

        let mut candidate = 0usize;
        while candidate + count <= self.total_pages {
            // Skip fully used words in one step.
            if candidate % 64 == 0 && self.bitmap[candidate / 64] == u64::MAX {
                candidate += 64;
                continue;
            }

            match (candidate..candidate + count).find(|&p| self.is_used(p)) {
                Some(used) => candidate = used + 1,
                None => {
                    for page in candidate..candidate + count {
                        self.bitmap[page / 64] |= 1 << (page % 64);
                    }
                    self.used_pages += count;
                    self.high_water = self.high_water.max(candidate + count);
                    return Ok(self.begin + candidate * PAGE_SIZE);
                }
            }
        }

        Err(AllocError::OutOfMemory)
    }

    /// Free `count` pages starting at `addr`. Pages already free are skipped.
    pub fn free_pages(&mut self, addr: usize, count: usize) -> Result<(), AllocError> {
        if addr < self.begin || (addr - self.begin) % PAGE_SIZE != 0 {
            return Err(AllocError::OutOfRange(addr));
        }
        let first = (addr - self.begin) / PAGE_SIZE;
        if first + count > self.total_pages {
            return Err(AllocError::OutOfRange(addr));
        }

        for page in first..first + count {
            if !self.is_used(page) {
                // Already free.
                continue;
            }
            self.bitmap[page / 64] &= !(1 << (page % 64));
            self.used_pages -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x20_0000;

    fn region(pages: usize) -> Box<MmapRegion> {
        let mut r = Box::new(MmapRegion::new());
        r.init(BASE, BASE + pages * PAGE_SIZE);
        r
    }

    #[test]
    fn first_fit_and_reuse() {
        let mut r = region(8);
        let a = r.alloc_pages(2).unwrap();
        let b = r.alloc_pages(3).unwrap();
        assert_eq!(a, BASE);
        assert_eq!(b, BASE + 2 * PAGE_SIZE);
        assert_eq!(r.bytes_used(), 5 * PAGE_SIZE);

        r.free_pages(a, 2).unwrap();
        assert_eq!(r.alloc_pages(1).unwrap(), BASE);
        assert_eq!(r.bytes_used(), 4 * PAGE_SIZE);
    }

    #[test]
    fn exhaustion_and_fragmentation() {
        let mut r = region(4);
        let a = r.alloc_pages(1).unwrap();
        let _b = r.alloc_pages(1).unwrap();
        let c = r.alloc_pages(1).unwrap();
        r.free_pages(a, 1).unwrap();
        r.free_pages(c, 1).unwrap();
        // Three free pages but no run of three.
        assert_eq!(r.alloc_pages(3), Err(AllocError::OutOfMemory));
        assert_eq!(r.alloc_pages(2).unwrap(), BASE + 2 * PAGE_SIZE);
        assert_eq!(r.alloc_pages(0), Err(AllocError::InvalidSize));
    }

    #[test]
    fn high_water_is_monotonic() {
        let mut r = region(16);
        assert_eq!(r.allocation_end(), BASE);
        let a = r.alloc_pages(4).unwrap();
        assert_eq!(r.allocation_end(), BASE + 4 * PAGE_SIZE);
        r.free_pages(a, 4).unwrap();
        assert_eq!(r.allocation_end(), BASE + 4 * PAGE_SIZE);
        r.alloc_pages(1).unwrap();
        assert_eq!(r.allocation_end(), BASE + 4 * PAGE_SIZE);
    }

    #[test]
    fn double_free_and_bad_addresses() {
        let mut r = region(4);
        let a = r.alloc_pages(1).unwrap();
        r.free_pages(a, 1).unwrap();
        r.free_pages(a, 1).unwrap();
        assert_eq!(r.bytes_used(), 0);
        assert_eq!(r.free_pages(BASE + 1, 1), Err(AllocError::OutOfRange(BASE + 1)));
        assert_eq!(r.free_pages(BASE - PAGE_SIZE, 1), Err(AllocError::OutOfRange(BASE - PAGE_SIZE)));
        assert!(r.free_pages(BASE + 3 * PAGE_SIZE, 2).is_err());
    }

    #[test]
    fn skips_full_words() {
        let mut r = region(200);
        r.alloc_pages(130).unwrap();
        assert_eq!(r.alloc_pages(2).unwrap(), BASE + 130 * PAGE_SIZE);
        assert_eq!(r.end(), BASE + 200 * PAGE_SIZE);
    }
}
