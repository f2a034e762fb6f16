/// Device tree memory discovery.
///
/// Reads the root `#address-cells` / `#size-cells` and the `/memory` node's
/// `reg` property out of a flattened device tree blob. `reg` is an array of
/// big-endian 32-bit cells grouped into (address, size) pairs, each part
/// `#address-cells` / `#size-cells` cells wide.
///
/// Only one contiguous RAM span is supported. Adjacent ranges are merged;
/// a range that leaves a gap is not folded into the bound but reported
/// through [`DeviceMemory::discontiguous`] so the caller can flag it.
use core::fmt;

use fdt::Fdt;

use crate::be32;

pub const FDT_MAGIC: u32 = 0xD00D_FEED;
/// Bytes of header needed to learn `totalsize`.
pub const FDT_HEADER_SIZE: usize = 40;
/// Oldest layout whose header carries every field we read.
const FDT_MIN_VERSION: u32 = 16;
/// Newest layout we understand (`last_comp_version` must not exceed it).
const FDT_LAST_COMP_VERSION: u32 = 17;

/// Widest address or size we can fold into a u64.
pub const MAX_CELLS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtbError {
    /// Bad magic, unsupported version, or size fields that don't fit the buffer.
    BadHeader,
    MissingNode(&'static str),
    MissingProperty(&'static str),
    UnsupportedCells { address_cells: usize, size_cells: usize },
    /// `reg` length is not a whole number of (address, size) pairs.
    MalformedReg { len: usize },
    /// Every range in `reg` has size zero.
    NoMemory,
    /// base + size does not fit in 64 bits.
    RangeOverflow,
}

impl fmt::Display for DtbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DtbError::BadHeader => write!(f, "FDT header check failed"),
            DtbError::MissingNode(n) => write!(f, "device tree has no {} node", n),
            DtbError::MissingProperty(p) => write!(f, "device tree node lacks '{}'", p),
            DtbError::UnsupportedCells { address_cells, size_cells } => write!(
                f,
                "unsupported cell layout (address {}, size {})",
                address_cells, size_cells
            ),
            DtbError::MalformedReg { len } => write!(f, "malformed reg property ({} bytes)", len),
            DtbError::NoMemory => write!(f, "memory node describes no RAM"),
            DtbError::RangeOverflow => write!(f, "memory range overflows the address space"),
        }
    }
}

/// One decoded (address, size) pair plus the cell layout it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemoryDescriptor {
    pub address_cells: usize,
    pub size_cells: usize,
    pub base_address: u64,
    pub size: u64,
}

impl DeviceMemoryDescriptor {
    pub fn end(&self) -> Result<u64, DtbError> {
        self.base_address.checked_add(self.size).ok_or(DtbError::RangeOverflow)
    }
}

/// The RAM span the kernel will use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemory {
    /// First contiguous span (adjacent ranges already merged).
    pub span: DeviceMemoryDescriptor,
    /// Number of non-empty ranges in `reg`.
    pub ranges: usize,
    /// Some range did not continue the span and was left out.
    pub discontiguous: bool,
}

impl DeviceMemory {
    /// One past the last byte of the span.
    pub fn end(&self) -> u64 {
        // Checked while merging.
        self.span.base_address + self.span.size
    }
}

/// `totalsize` from a header, so the caller knows how much to map.
pub fn total_size(header: &[u8]) -> Result<usize, DtbError> {
    if header.len() < FDT_HEADER_SIZE || be32(header, 0) != FDT_MAGIC {
        return Err(DtbError::BadHeader);
    }
    Ok(be32(header, 4) as usize)
}

/// Validate magic and version before handing the blob to the parser.
/// Returns `totalsize`.
pub fn check_header(blob: &[u8]) -> Result<usize, DtbError> {
    if blob.len() < FDT_HEADER_SIZE {
        return Err(DtbError::BadHeader);
    }
    if be32(blob, 0) != FDT_MAGIC {
        return Err(DtbError::BadHeader);
    }
    let total_size = be32(blob, 4) as usize;
    let version = be32(blob, 20);
    let last_comp = be32(blob, 24);
    if version < FDT_MIN_VERSION || last_comp > FDT_LAST_COMP_VERSION {
        return Err(DtbError::BadHeader);
    }
    if total_size < FDT_HEADER_SIZE || total_size > blob.len() {
        return Err(DtbError::BadHeader);
    }
    Ok(total_size)
}

/// Find the RAM span in a device tree blob.
pub fn memory_from_blob(blob: &[u8]) -> Result<DeviceMemory, DtbError> {
    let total = check_header(blob)?;
    let fdt = Fdt::new(&blob[..total]).map_err(|_| DtbError::BadHeader)?;

    let cells = fdt.root().cell_sizes();
    let node = fdt.find_node("/memory").ok_or(DtbError::MissingNode("/memory"))?;
    let reg = node.property("reg").ok_or(DtbError::MissingProperty("reg"))?;

    decode_memory(reg.value, cells.address_cells, cells.size_cells)
}

/// Iterate the (address, size) pairs of a `reg` property.
pub fn reg_entries(
    reg: &[u8],
    address_cells: usize,
    size_cells: usize,
) -> Result<impl Iterator<Item = DeviceMemoryDescriptor> + '_, DtbError> {
    if address_cells == 0 || address_cells > MAX_CELLS || size_cells == 0 || size_cells > MAX_CELLS {
        return Err(DtbError::UnsupportedCells { address_cells, size_cells });
    }
    let pair_len = 4 * (address_cells + size_cells);
    if reg.is_empty() || reg.len() % pair_len != 0 {
        return Err(DtbError::MalformedReg { len: reg.len() });
    }

    Ok(reg.chunks_exact(pair_len).map(move |pair| {
        let (addr, size) = pair.split_at(4 * address_cells);
        DeviceMemoryDescriptor {
            address_cells,
            size_cells,
            base_address: read_cells(addr),
            size: read_cells(size),
        }
    }))
}

/// Fold big-endian cells into one value, most significant cell first.
fn read_cells(cells: &[u8]) -> u64 {
    (0..cells.len() / 4).fold(0u64, |acc, i| (acc << 32) | be32(cells, i * 4) as u64)
}

/// Decode a `/memory` `reg` property into one contiguous span.
pub fn decode_memory(reg: &[u8], address_cells: usize, size_cells: usize) -> Result<DeviceMemory, DtbError> {
    let mut span: Option<DeviceMemoryDescriptor> = None;
    let mut ranges = 0usize;
    let mut discontiguous = false;

    for entry in reg_entries(reg, address_cells, size_cells)? {
        if entry.size == 0 {
            continue;
        }
        let entry_end = entry.end()?;
        ranges += 1;

        match span.as_mut() {
            None => span = Some(entry),
            Some(s) => {
                let span_end = s.end()?;
                if entry.base_address == span_end {
                    s.size = entry_end - s.base_address;
                } else {
                    discontiguous = true;
                }
            }
        }
    }

    let span = span.ok_or(DtbError::NoMemory)?;
    Ok(DeviceMemory { span, ranges, discontiguous })
}
