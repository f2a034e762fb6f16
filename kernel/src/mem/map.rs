/// Named map of reserved physical ranges.
///
/// Every range the kernel hands out (image, relocated symbols, brk and mmap
/// regions) is recorded here; an overlapping assignment is refused.
use core::fmt;

use super::MemoryRegion;

pub const MAX_ENTRIES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMapError {
    Full,
    /// `end` below `begin`.
    Inverted { name: &'static str, region: MemoryRegion },
    Overlap { name: &'static str, existing: &'static str },
}

impl fmt::Display for MemoryMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMapError::Full => write!(f, "memory map full ({} entries)", MAX_ENTRIES),
            MemoryMapError::Inverted { name, region } => write!(
                f,
                "region '{}' ends before it begins ({:#x}..{:#x})",
                name, region.begin, region.end
            ),
            MemoryMapError::Overlap { name, existing } => {
                write!(f, "region '{}' overlaps '{}'", name, existing)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub name: &'static str,
    pub region: MemoryRegion,
}

#[derive(Clone)]
pub struct MemoryMap {
    entries: [Option<MapEntry>; MAX_ENTRIES],
    len: usize,
}

impl MemoryMap {
    pub const fn new() -> Self {
        Self { entries: [None; MAX_ENTRIES], len: 0 }
    }

    /// Record `region` under `name`. Empty regions are accepted and not stored.
    pub fn assign(&mut self, name: &'static str, region: MemoryRegion) -> Result<(), MemoryMapError> {
        if region.end < region.begin {
            return Err(MemoryMapError::Inverted { name, region });
        }
        if region.is_empty() {
            return Ok(());
        }
        if let Some(existing) = self.iter().find(|e| e.region.overlaps(&region)) {
            return Err(MemoryMapError::Overlap { name, existing: existing.name });
        }
        if self.len == MAX_ENTRIES {
            return Err(MemoryMapError::Full);
        }

        self.entries[self.len] = Some(MapEntry { name, region });
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<MemoryRegion> {
        self.iter().find(|e| e.name == name).map(|e| e.region)
    }

    /// The entry containing `addr`, if any.
    pub fn at(&self, addr: usize) -> Option<MapEntry> {
        self.iter().find(|e| e.region.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = MapEntry> + '_ {
        self.entries[..self.len].iter().flatten().copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
