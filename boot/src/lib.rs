#![cfg_attr(not(test), no_std)]
// Boot crate: decoders for what firmware and bootloaders leave in memory.
//
// Everything here is a pure function over byte slices:
// 1. Multiboot v1 information block (PC path, GRUB / QEMU -kernel)
// 2. Soft-reset record written by a previous kernel before live update
// 3. Flattened device tree /memory node (aarch64 virt path)
//
// The kernel turns the firmware pointers into slices and calls in here, so
// all of it can be exercised on the host with hand-built buffers.

#[cfg(any(test, feature = "fdt-writer"))]
extern crate alloc;

pub mod devicetree;
#[cfg(any(test, feature = "fdt-writer"))]
pub mod fdt_writer;
pub mod multiboot;
pub mod softreset;

pub use devicetree::{DeviceMemory, DeviceMemoryDescriptor, DtbError};
pub use multiboot::{InfoFlags, MemoryKind, MemoryMapEntry, MultibootError, MultibootInfo, MultibootModule};
pub use softreset::{SoftResetError, SoftResetRecord};

/// Read a little-endian u32 at `offset`. Caller has checked the bounds.
#[inline]
pub(crate) fn le32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Read a little-endian u64 at `offset`. Caller has checked the bounds.
#[inline]
pub(crate) fn le64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Read a big-endian u32 at `offset` (device tree cells are big-endian).
#[inline]
pub(crate) fn be32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(raw)
}
