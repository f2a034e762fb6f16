/// Multiboot v1 information block decoder.
///
/// GRUB (and QEMU's `-kernel` loader) enters the kernel with
/// EAX = `BOOTLOADER_MAGIC` and EBX = physical address of this block.
/// We only read what the memory core needs: the upper memory bound, the
/// command line and module extents (they sit right after the kernel image
/// and must not be handed to the heap), and the BIOS memory map.
///
/// Layout (all little-endian u32):
///   0  flags        4  mem_lower    8  mem_upper   12 boot_device
///   16 cmdline      20 mods_count   24 mods_addr   28..44 syms
///   44 mmap_length  48 mmap_addr
use core::fmt;

use bitflags::bitflags;

use crate::{le32, le64};

/// Value passed in EAX by a multiboot-compliant loader.
pub const BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// Bytes of the info block we decode (up to and including mmap_addr).
pub const INFO_SIZE: usize = 52;

/// Size of one module descriptor.
pub const MODULE_SIZE: usize = 16;

/// Start of upper memory; `mem_upper` counts KiB from here.
const UPPER_MEMORY_BASE: usize = 0x10_0000;

bitflags! {
    /// Which fields of the info block the loader filled in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InfoFlags: u32 {
        const MEMORY      = 1 << 0;
        const BOOT_DEVICE = 1 << 1;
        const CMDLINE     = 1 << 2;
        const MODULES     = 1 << 3;
        const AOUT_SYMS   = 1 << 4;
        const ELF_SHDR    = 1 << 5;
        const MEMORY_MAP  = 1 << 6;
        const DRIVES      = 1 << 7;
        const CONFIG      = 1 << 8;
        const LOADER_NAME = 1 << 9;
        const APM         = 1 << 10;
        const VBE         = 1 << 11;
        const FRAMEBUFFER = 1 << 12;
    }
}

/// Module descriptor as laid out by the loader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultibootModule {
    pub mod_start: u32,
    pub mod_end: u32,
    pub string: u32,
    pub reserved: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<MultibootModule>(), MODULE_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultibootError {
    /// Buffer shorter than the fields we need.
    TooShort { len: usize, needed: usize },
    /// Neither the MEMORY flag nor a usable memory map entry above 1 MiB.
    NoMemoryInfo,
}

impl fmt::Display for MultibootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultibootError::TooShort { len, needed } => {
                write!(f, "multiboot structure truncated ({} of {} bytes)", len, needed)
            }
            MultibootError::NoMemoryInfo => write!(f, "multiboot info carries no memory bounds"),
        }
    }
}

/// The decoded subset of the multiboot information block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultibootInfo {
    pub flags: InfoFlags,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

impl MultibootInfo {
    /// Decode the info block from its raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, MultibootError> {
        if bytes.len() < INFO_SIZE {
            return Err(MultibootError::TooShort { len: bytes.len(), needed: INFO_SIZE });
        }

        Ok(Self {
            flags: InfoFlags::from_bits_truncate(le32(bytes, 0)),
            mem_lower: le32(bytes, 4),
            mem_upper: le32(bytes, 8),
            cmdline: le32(bytes, 16),
            mods_count: le32(bytes, 20),
            mods_addr: le32(bytes, 24),
            mmap_length: le32(bytes, 44),
            mmap_addr: le32(bytes, 48),
        })
    }

    /// End of physical memory according to `mem_upper`, or, when the loader
    /// only supplied a memory map, the end of the available range that
    /// starts at 1 MiB.
    pub fn memory_end(&self, memory_map: Option<&[u8]>) -> Result<usize, MultibootError> {
        if self.flags.contains(InfoFlags::MEMORY) {
            return Ok(UPPER_MEMORY_BASE + self.mem_upper as usize * 1024);
        }

        let map = match memory_map {
            Some(map) if self.flags.contains(InfoFlags::MEMORY_MAP) => map,
            _ => return Err(MultibootError::NoMemoryInfo),
        };

        memory_map_entries(map)
            .filter(|e| e.kind == MemoryKind::Available)
            .find(|e| e.base <= UPPER_MEMORY_BASE as u64 && e.end() > UPPER_MEMORY_BASE as u64)
            .map(|e| e.end() as usize)
            .ok_or(MultibootError::NoMemoryInfo)
    }

    /// (address, count) of the module table, when present.
    pub fn modules_location(&self) -> Option<(usize, usize)> {
        if self.flags.contains(InfoFlags::MODULES) && self.mods_count > 0 {
            Some((self.mods_addr as usize, self.mods_count as usize))
        } else {
            None
        }
    }

    /// (address, length) of the BIOS memory map, when present.
    pub fn memory_map_location(&self) -> Option<(usize, usize)> {
        if self.flags.contains(InfoFlags::MEMORY_MAP) && self.mmap_length > 0 {
            Some((self.mmap_addr as usize, self.mmap_length as usize))
        } else {
            None
        }
    }

    /// Physical address of the NUL-terminated command line, when present.
    pub fn cmdline_addr(&self) -> Option<usize> {
        if self.flags.contains(InfoFlags::CMDLINE) && self.cmdline != 0 {
            Some(self.cmdline as usize)
        } else {
            None
        }
    }
}

/// Decode a module table.
pub fn modules(bytes: &[u8]) -> impl Iterator<Item = MultibootModule> + '_ {
    bytes.chunks_exact(MODULE_SIZE).map(|chunk| MultibootModule {
        mod_start: le32(chunk, 0),
        mod_end: le32(chunk, 4),
        string: le32(chunk, 8),
        reserved: le32(chunk, 12),
    })
}

/// First byte after everything the loader placed past the kernel image:
/// the command line and every module.
pub fn free_begin<I>(image_end: usize, cmdline_end: Option<usize>, modules: I) -> usize
where
    I: IntoIterator<Item = MultibootModule>,
{
    let mut end = image_end;
    if let Some(cmd_end) = cmdline_end {
        end = end.max(cmd_end);
    }
    for module in modules {
        end = end.max(module.mod_end as usize);
    }
    end
}

/// BIOS memory region type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Available,
    Reserved,
    AcpiReclaimable,
    Nvs,
    BadRam,
    Other(u32),
}

impl From<u32> for MemoryKind {
    fn from(raw: u32) -> Self {
        match raw {
            1 => MemoryKind::Available,
            2 => MemoryKind::Reserved,
            3 => MemoryKind::AcpiReclaimable,
            4 => MemoryKind::Nvs,
            5 => MemoryKind::BadRam,
            other => MemoryKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Walk the BIOS memory map. Each entry is prefixed by its own size
/// (which does not count the size field itself); a truncated tail ends
/// the walk.
pub fn memory_map_entries(bytes: &[u8]) -> MemoryMapIter<'_> {
    MemoryMapIter { bytes, offset: 0 }
}

pub struct MemoryMapIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for MemoryMapIter<'a> {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<MemoryMapEntry> {
        // size(4) + base(8) + length(8) + type(4)
        if self.offset + 24 > self.bytes.len() {
            return None;
        }
        let at = self.offset;
        let size = le32(self.bytes, at) as usize;
        if size < 20 {
            return None;
        }
        let entry = MemoryMapEntry {
            base: le64(self.bytes, at + 4),
            length: le64(self.bytes, at + 12),
            kind: MemoryKind::from(le32(self.bytes, at + 20)),
        };
        self.offset = at + 4 + size;
        Some(entry)
    }
}
