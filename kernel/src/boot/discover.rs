/// Memory discovery: turn what the firmware left behind into the free
/// memory start and the end of physical memory.
///
/// Two encodings:
/// - PC: multiboot v1 info (magic `0x2BADB002`), or a soft-reset record
///   left by the previous kernel during a live update (magic `0xFEE1DEAD`)
/// - aarch64 virt: flattened device tree, `/memory` node
///
/// Reads go through [`PhysMemory`] so the same code runs over identity
/// mapped memory at boot and over plain buffers in tests. This runs before
/// `.bss` is cleared, so it doesn't log; the sequencer reports
/// [`MemorySource`] afterwards.
use ember_boot::devicetree::{self, FDT_HEADER_SIZE};
use ember_boot::multiboot::{self, MultibootInfo, BOOTLOADER_MAGIC, INFO_SIZE, MODULE_SIZE};
use ember_boot::softreset::{self, SoftResetRecord, RECORD_SIZE};

use super::{BootArgs, BootError, DiscoveredMemory, MemorySource};
use crate::config::KernelConfig;

/// Longest command line we scan for its terminator.
const CMDLINE_MAX: usize = 4096;

/// Read access to physical memory.
pub trait PhysMemory {
    /// Up to `len` bytes at `addr`. Shorter (possibly empty) when the range
    /// runs off readable memory.
    fn bytes(&self, addr: usize, len: usize) -> &[u8];
}

/// Physical memory as the boot code sees it: identity mapped.
#[cfg(target_os = "none")]
pub struct IdentityMapped;

#[cfg(target_os = "none")]
impl PhysMemory for IdentityMapped {
    fn bytes(&self, addr: usize, len: usize) -> &[u8] {
        if addr == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(addr as *const u8, len) }
    }
}

/// One past the NUL terminating the string at `addr`.
fn cstr_end(mem: &impl PhysMemory, addr: usize) -> usize {
    let bytes = mem.bytes(addr, CMDLINE_MAX);
    match bytes.iter().position(|&b| b == 0) {
        Some(n) => addr + n + 1,
        None => addr + bytes.len(),
    }
}

/// PC path: multiboot info, or a soft-reset record.
pub fn pc_memory(
    args: BootArgs,
    image_end: usize,
    mem: &impl PhysMemory,
) -> Result<DiscoveredMemory, BootError> {
    let magic = args.magic as u32;

    if args.magic <= u32::MAX as usize && magic == BOOTLOADER_MAGIC {
        let info = MultibootInfo::parse(mem.bytes(args.addr, INFO_SIZE))?;

        let memory_map = info.memory_map_location().map(|(addr, len)| mem.bytes(addr, len));
        let memory_end = info.memory_end(memory_map)?;

        let cmdline_end = info.cmdline_addr().map(|addr| cstr_end(mem, addr));
        let modules = info
            .modules_location()
            .map(|(addr, count)| multiboot::modules(mem.bytes(addr, count * MODULE_SIZE)))
            .into_iter()
            .flatten();
        let free_begin = multiboot::free_begin(image_end, cmdline_end, modules);

        return Ok(DiscoveredMemory {
            free_begin,
            memory_end,
            liveupdate_size: 0,
            source: MemorySource::Multiboot { mem_lower: info.mem_lower, mem_upper: info.mem_upper },
        });
    }

    if args.magic <= u32::MAX as usize && softreset::is_softreset_magic(magic) {
        let record = SoftResetRecord::parse(mem.bytes(args.addr, RECORD_SIZE))?;
        let high_mem = record.high_mem as usize;
        let area = record.liveupdate_loc as usize;

        // Keep the heap below the preserved live-update area.
        let memory_end = if record.liveupdate_size > 0 && area > image_end && area < high_mem {
            area
        } else {
            high_mem
        };

        return Ok(DiscoveredMemory {
            free_begin: image_end,
            memory_end,
            liveupdate_size: record.liveupdate_size as usize,
            source: MemorySource::SoftReset { high_mem, liveupdate_loc: area },
        });
    }

    Err(BootError::UnknownBootMagic(args.magic))
}

/// aarch64 virt path: the `/memory` node of the device tree at `args.addr`
/// (or the configured fallback when the loader passed 0).
pub fn dtb_memory(
    args: BootArgs,
    image_end: usize,
    config: &KernelConfig,
    mem: &impl PhysMemory,
) -> Result<DiscoveredMemory, BootError> {
    let fdt_addr = if args.addr == 0 { config.fdt_fallback } else { args.addr };

    let total = devicetree::total_size(mem.bytes(fdt_addr, FDT_HEADER_SIZE))?;
    let memory = devicetree::memory_from_blob(mem.bytes(fdt_addr, total))?;

    let span = memory.span;
    let memory_end = usize::try_from(memory.end()).map_err(|_| BootError::MemoryOutOfReach(memory.end()))?;
    let base = span.base_address as usize;
    Ok(DiscoveredMemory {
        free_begin: image_end.max(base),
        memory_end,
        liveupdate_size: 0,
        source: MemorySource::DeviceTree {
            addr: fdt_addr,
            address_cells: span.address_cells,
            size_cells: span.size_cells,
            ranges: memory.ranges,
            discontiguous: memory.discontiguous,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_boot::softreset::SOFT_RESET_MAGIC;

    /// Sparse fake physical memory: a few buffers at fixed addresses.
    struct FakeMemory {
        chunks: Vec<(usize, Vec<u8>)>,
    }

    impl FakeMemory {
        fn new() -> Self {
            Self { chunks: Vec::new() }
        }

        fn put(&mut self, addr: usize, data: Vec<u8>) {
            self.chunks.push((addr, data));
        }
    }

    impl PhysMemory for FakeMemory {
        fn bytes(&self, addr: usize, len: usize) -> &[u8] {
            for (base, data) in &self.chunks {
                if addr >= *base && addr < base + data.len() {
                    let off = addr - base;
                    let end = (off + len).min(data.len());
                    return &data[off..end];
                }
            }
            &[]
        }
    }

    fn info_block(flags: u32, mem_upper: u32, cmdline: u32, mods: (u32, u32)) -> Vec<u8> {
        let mut b = vec![0u8; INFO_SIZE];
        b[0..4].copy_from_slice(&flags.to_le_bytes());
        b[4..8].copy_from_slice(&640u32.to_le_bytes());
        b[8..12].copy_from_slice(&mem_upper.to_le_bytes());
        b[16..20].copy_from_slice(&cmdline.to_le_bytes());
        b[20..24].copy_from_slice(&mods.0.to_le_bytes());
        b[24..28].copy_from_slice(&mods.1.to_le_bytes());
        b
    }

    const IMAGE_END: usize = 0x18_0000;

    #[test]
    fn multiboot_memory_and_free_start() {
        let mut mem = FakeMemory::new();
        // MEMORY | CMDLINE | MODULES
        mem.put(0x9000, info_block(0x1 | 0x4 | 0x8, 127 * 1024, 0xA000, (1, 0xB000)));
        mem.put(0xA000, b"ember -v\0".to_vec());
        let mut module = Vec::new();
        for v in [0x20_0000u32, 0x24_3210, 0, 0] {
            module.extend_from_slice(&v.to_le_bytes());
        }
        mem.put(0xB000, module);

        let found = pc_memory(BootArgs { magic: 0x2BAD_B002, addr: 0x9000 }, IMAGE_END, &mem).unwrap();
        assert_eq!(found.memory_end, 0x10_0000 + 127 * 1024 * 1024);
        assert_eq!(found.free_begin, 0x24_3210);
        assert_eq!(found.liveupdate_size, 0);
        assert_eq!(found.source, MemorySource::Multiboot { mem_lower: 640, mem_upper: 127 * 1024 });
    }

    #[test]
    fn multiboot_without_modules_frees_from_image_end() {
        let mut mem = FakeMemory::new();
        mem.put(0x9000, info_block(0x1, 64 * 1024, 0, (0, 0)));
        let found = pc_memory(BootArgs { magic: 0x2BAD_B002, addr: 0x9000 }, IMAGE_END, &mem).unwrap();
        assert_eq!(found.free_begin, IMAGE_END);
        assert_eq!(found.memory_end, 0x10_0000 + 64 * 1024 * 1024);
    }

    #[test]
    fn multiboot_without_memory_info_fails() {
        let mut mem = FakeMemory::new();
        mem.put(0x9000, info_block(0x4, 0, 0xA000, (0, 0)));
        mem.put(0xA000, b"x\0".to_vec());
        let err = pc_memory(BootArgs { magic: 0x2BAD_B002, addr: 0x9000 }, IMAGE_END, &mem).unwrap_err();
        assert!(matches!(err, BootError::Multiboot(_)));
    }

    #[test]
    fn unreadable_info_block_fails() {
        let mem = FakeMemory::new();
        let err = pc_memory(BootArgs { magic: 0x2BAD_B002, addr: 0x9000 }, IMAGE_END, &mem).unwrap_err();
        assert!(matches!(err, BootError::Multiboot(_)));
    }

    #[test]
    fn soft_reset_record_bounds_memory() {
        let record = SoftResetRecord {
            liveupdate_loc: 0x3F00_0000,
            liveupdate_size: 0x40_0000,
            high_mem: 0x4000_0000,
        };
        let mut mem = FakeMemory::new();
        mem.put(0x7000, record.encode().to_vec());

        let args = BootArgs { magic: SOFT_RESET_MAGIC as usize, addr: 0x7000 };
        let found = pc_memory(args, IMAGE_END, &mem).unwrap();
        assert_eq!(found.free_begin, IMAGE_END);
        assert_eq!(found.memory_end, 0x3F00_0000);
        assert_eq!(found.liveupdate_size, 0x40_0000);
        assert_eq!(
            found.source,
            MemorySource::SoftReset { high_mem: 0x4000_0000, liveupdate_loc: 0x3F00_0000 }
        );
    }

    #[test]
    fn soft_reset_without_live_update_uses_high_mem() {
        let mut mem = FakeMemory::new();
        let args = BootArgs { magic: SOFT_RESET_MAGIC as usize, addr: 0x7000 };

        // Nothing preserved: the stale location is ignored.
        let record = SoftResetRecord { liveupdate_loc: 0x3F00_0000, liveupdate_size: 0, high_mem: 0x4000_0000 };
        mem.put(0x7000, record.encode().to_vec());
        let found = pc_memory(args, IMAGE_END, &mem).unwrap();
        assert_eq!(found.memory_end, 0x4000_0000);
        assert_eq!(found.liveupdate_size, 0);

        // An area outside image_end..high_mem doesn't bound the heap either.
        let record = SoftResetRecord { liveupdate_loc: 0x10_0000, liveupdate_size: 0x1000, high_mem: 0x4000_0000 };
        let mut mem = FakeMemory::new();
        mem.put(0x7000, record.encode().to_vec());
        let found = pc_memory(args, IMAGE_END, &mem).unwrap();
        assert_eq!(found.memory_end, 0x4000_0000);
        assert_eq!(found.liveupdate_size, 0x1000);
    }

    #[test]
    fn corrupt_soft_reset_record_fails() {
        let record = SoftResetRecord { liveupdate_loc: 0, liveupdate_size: 0, high_mem: 0x800_0000 };
        let mut raw = record.encode().to_vec();
        raw[24] ^= 0xFF;
        let mut mem = FakeMemory::new();
        mem.put(0x7000, raw);
        let args = BootArgs { magic: SOFT_RESET_MAGIC as usize, addr: 0x7000 };
        assert!(matches!(pc_memory(args, IMAGE_END, &mem), Err(BootError::SoftReset(_))));
    }

    #[test]
    fn unknown_magic_is_fatal() {
        let mem = FakeMemory::new();
        let args = BootArgs { magic: 0x1BAD_B002, addr: 0x9000 };
        assert!(matches!(pc_memory(args, IMAGE_END, &mem), Err(BootError::UnknownBootMagic(0x1BAD_B002))));
    }
}
