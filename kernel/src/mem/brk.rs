/// Bump (brk) region.
///
/// A single break pointer moving through `[begin, end)`. Allocations are
/// never returned individually; the break only moves back when the
/// application asks for it through `brk(2)`.
#[derive(Debug)]
pub struct BrkRegion {
    begin: usize,
    current: usize,
    end: usize,
}

impl BrkRegion {
    pub const fn new() -> Self {
        Self { begin: 0, current: 0, end: 0 }
    }

    /// Place the region at `begin` with room for `size` bytes. Returns its end.
    pub fn init(&mut self, begin: usize, size: usize) -> usize {
        self.begin = begin;
        self.current = begin;
        self.end = begin + size;
        self.end
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Current break.
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn bytes_used(&self) -> usize {
        self.current - self.begin
    }

    pub fn bytes_free(&self) -> usize {
        self.end - self.current
    }

    /// Move the break forward by `increment`. Returns the old break.
    pub fn sbrk(&mut self, increment: usize) -> Option<usize> {
        let old = self.current;
        let new = old.checked_add(increment)?;
        if new > self.end {
            return None;
        }
        self.current = new;
        Some(old)
    }

    /// `brk(2)`: move the break to `addr` if it lies inside the region.
    /// Always returns the break in effect afterwards; a request outside the
    /// region (including 0, the query form) leaves it unchanged.
    pub fn set_break(&mut self, addr: usize) -> usize {
        if addr >= self.begin && addr <= self.end {
            self.current = addr;
        }
        self.current
    }
}
