/// Kernel symbol table: relocation at boot and address lookup afterwards.
///
/// The image carries its symbols in the `.elf_symbols` section as one blob:
///
/// ```text
/// 0   magic u32 ("ESYM")   4  entry count u32
/// 8   strtab size u32      12 reserved
/// 16  entries: Elf64_Sym x count (24 bytes each)
/// ..  string table
/// ```
///
/// The post-link step fills that section in place. At boot the blob is
/// copied to the start of free memory, the free pointer moves past it and
/// the copy is recorded in the memory map; the in-image bytes are not read
/// again. An image built without symbols carries an all-zero section and
/// relocation then consumes nothing.
use core::fmt;

use spin::Once;

use crate::mem::MemoryRegion;

pub const SYMBOLS_MAGIC: u32 = u32::from_le_bytes(*b"ESYM");
pub const HEADER_SIZE: usize = 16;
pub const ENTRY_SIZE: usize = 24;

/// Relocated tables are padded to this.
const RELOC_ALIGN: usize = 16;

/// `st_info` type of a function symbol.
const STT_FUNC: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolError {
    Truncated { len: usize, needed: usize },
    /// The table does not fit between the free pointer and the end of memory.
    NoRoom { needed: usize, free_begin: usize, memory_end: usize },
    Overflow,
}

impl fmt::Display for SymbolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolError::Truncated { len, needed } => {
                write!(f, "symbol section truncated ({} of {} bytes)", len, needed)
            }
            SymbolError::NoRoom { needed, free_begin, memory_end } => write!(
                f,
                "no room for {} bytes of symbols at {:#x} (memory ends at {:#x})",
                needed, free_begin, memory_end
            ),
            SymbolError::Overflow => write!(f, "symbol table size overflows"),
        }
    }
}

fn le32(b: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(raw)
}

fn le64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(raw)
}

/// Bytes of `section` that make up the table, or 0 if it holds none.
pub fn table_len(section: &[u8]) -> Result<usize, SymbolError> {
    if section.len() < HEADER_SIZE || le32(section, 0) != SYMBOLS_MAGIC {
        return Ok(0);
    }
    let count = le32(section, 4) as usize;
    let strtab = le32(section, 8) as usize;
    let needed = count
        .checked_mul(ENTRY_SIZE)
        .and_then(|n| n.checked_add(HEADER_SIZE + strtab))
        .ok_or(SymbolError::Overflow)?;
    if section.len() < needed {
        return Err(SymbolError::Truncated { len: section.len(), needed });
    }
    Ok(needed)
}

/// How many bytes relocating `section` to `free_begin` consumes.
/// Never lets the free pointer pass `memory_end`.
pub fn plan(section: &[u8], free_begin: usize, memory_end: usize) -> Result<usize, SymbolError> {
    let len = table_len(section)?;
    if len == 0 {
        return Ok(0);
    }
    let consumed = crate::mem::align_up(len, RELOC_ALIGN).ok_or(SymbolError::Overflow)?;
    match free_begin.checked_add(consumed) {
        Some(end) if end <= memory_end => Ok(consumed),
        _ => Err(SymbolError::NoRoom { needed: consumed, free_begin, memory_end }),
    }
}

/// Copy the table into `dst` (which must hold `table_len` bytes).
/// Returns the copied length.
pub fn relocate_into(section: &[u8], dst: &mut [u8]) -> Result<usize, SymbolError> {
    let len = table_len(section)?;
    if dst.len() < len {
        return Err(SymbolError::Truncated { len: dst.len(), needed: len });
    }
    dst[..len].copy_from_slice(&section[..len]);
    Ok(len)
}

/// A resolved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol<'a> {
    pub name: &'a str,
    pub addr: u64,
    pub offset: u64,
}

impl fmt::Display for Symbol<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.name, self.offset)
    }
}

#[derive(Clone, Copy)]
pub struct SymbolTable<'a> {
    entries: &'a [u8],
    strtab: &'a [u8],
}

impl<'a> SymbolTable<'a> {
    pub const fn empty() -> Self {
        Self { entries: &[], strtab: &[] }
    }

    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, SymbolError> {
        let len = table_len(bytes)?;
        if len == 0 {
            return Ok(Self::empty());
        }
        let count = le32(bytes, 4) as usize;
        let strtab_start = HEADER_SIZE + count * ENTRY_SIZE;
        Ok(Self {
            entries: &bytes[HEADER_SIZE..strtab_start],
            strtab: &bytes[strtab_start..len],
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len() / ENTRY_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn name_at(&self, off: usize) -> &'a str {
        let tail = self.strtab.get(off..).unwrap_or(&[]);
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        core::str::from_utf8(&tail[..end]).unwrap_or("<invalid>")
    }

    /// Function symbols as (name offset, value, size).
    fn functions(&self) -> impl Iterator<Item = (usize, u64, u64)> + 'a {
        self.entries
            .chunks_exact(ENTRY_SIZE)
            .filter(|e| e[4] & 0xf == STT_FUNC)
            .map(|e| (le32(e, 0) as usize, le64(e, 8), le64(e, 16)))
    }

    /// The function containing `addr`. Symbols without a size match the
    /// nearest one below.
    pub fn resolve(&self, addr: u64) -> Option<Symbol<'a>> {
        let mut best: Option<(usize, u64)> = None;
        for (name, value, size) in self.functions() {
            if value > addr {
                continue;
            }
            if size != 0 && addr - value >= size {
                continue;
            }
            if best.map_or(true, |(_, v)| value > v) {
                best = Some((name, value));
            }
        }
        best.map(|(name, value)| Symbol { name: self.name_at(name), addr: value, offset: addr - value })
    }

    /// Address of the function called `name`.
    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.functions().find(|&(off, _, _)| self.name_at(off) == name).map(|(_, v, _)| v)
    }
}

static SYMBOLS: Once<SymbolTable<'static>> = Once::new();

/// Publish the relocated table. Must run after `.bss` is zeroed.
pub fn install(region: MemoryRegion, table: SymbolTable<'static>) {
    SYMBOLS.call_once(|| table);
    log::debug!("symbols: {} entries at {:#x}..{:#x}", table.len(), region.begin, region.end);
}

/// Resolve `addr` against the installed table, if any.
pub fn resolve(addr: u64) -> Option<Symbol<'static>> {
    SYMBOLS.get().and_then(|t| t.resolve(addr))
}

/// Space the post-link step writes the table into.
#[cfg(target_os = "none")]
#[used]
#[link_section = ".elf_symbols"]
static RESERVED: [u8; crate::config::SYMBOLS_RESERVE] = [0; crate::config::SYMBOLS_RESERVE];

#[cfg(target_os = "none")]
extern "C" {
    static __elf_symbols_start: u8;
    static __elf_symbols_end: u8;
}

/// The running image's `.elf_symbols` section.
#[cfg(target_os = "none")]
pub fn image_section() -> &'static [u8] {
    // Keep the reservation linked; it is only read through the linker symbols.
    core::hint::black_box(core::ptr::addr_of!(RESERVED));
    let begin = unsafe { core::ptr::addr_of!(__elf_symbols_start) };
    let end = unsafe { core::ptr::addr_of!(__elf_symbols_end) } as usize;
    unsafe { core::slice::from_raw_parts(begin, end - begin as usize) }
}

/// Copy the image's table to `free_begin` and return where it landed.
///
/// # Safety
/// `[free_begin, memory_end)` is identity mapped RAM that nothing uses.
#[cfg(target_os = "none")]
pub unsafe fn relocate_image(free_begin: usize, memory_end: usize) -> Result<MemoryRegion, SymbolError> {
    let section = image_section();
    let consumed = plan(section, free_begin, memory_end)?;
    if consumed > 0 {
        let dst = unsafe { core::slice::from_raw_parts_mut(free_begin as *mut u8, consumed) };
        relocate_into(section, dst)?;
    }
    Ok(MemoryRegion::new(free_begin, free_begin + consumed))
}

/// Publish the table [`relocate_image`] wrote to `region`.
///
/// # Safety
/// `region` came from `relocate_image` and has not been reused.
#[cfg(target_os = "none")]
pub unsafe fn install_relocated(region: MemoryRegion) -> Result<(), SymbolError> {
    if region.is_empty() {
        return Ok(());
    }
    let bytes = unsafe { core::slice::from_raw_parts(region.begin as *const u8, region.size()) };
    install(region, SymbolTable::from_bytes(bytes)?);
    Ok(())
}
