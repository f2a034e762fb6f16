/// Minimal flattened device tree writer.
///
/// Enough for a root node with properties and child nodes, which is all
/// the memory discovery tests need. Built for this crate's tests and, with
/// the `fdt-writer` feature, for the kernel's.
use alloc::vec::Vec;

use crate::devicetree::{FDT_HEADER_SIZE, FDT_MAGIC};

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

pub struct FdtWriter {
    structs: Vec<u8>,
    strings: Vec<u8>,
}

impl Default for FdtWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FdtWriter {
    pub fn new() -> Self {
        Self { structs: Vec::new(), strings: Vec::new() }
    }

    fn word(&mut self, w: u32) {
        self.structs.extend_from_slice(&w.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structs.len() % 4 != 0 {
            self.structs.push(0);
        }
    }

    pub fn begin(&mut self, name: &str) -> &mut Self {
        self.word(FDT_BEGIN_NODE);
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.word(FDT_END_NODE);
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let name_off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.word(FDT_PROP);
        self.word(value.len() as u32);
        self.word(name_off);
        self.structs.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_cells(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let value: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.prop(name, &value)
    }

    /// Close the structure block and lay out header, empty reservation
    /// map, structure block and strings.
    pub fn finish(&mut self) -> Vec<u8> {
        self.word(FDT_END);
        let rsvmap_off = FDT_HEADER_SIZE;
        let struct_off = rsvmap_off + 16;
        let strings_off = struct_off + self.structs.len();
        let total = strings_off + self.strings.len();

        let mut blob = Vec::with_capacity(total);
        for w in [
            FDT_MAGIC,
            total as u32,
            struct_off as u32,
            strings_off as u32,
            rsvmap_off as u32,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ] {
            blob.extend_from_slice(&w.to_be_bytes());
        }
        blob.extend_from_slice(&[0u8; 16]);
        blob.extend_from_slice(&self.structs);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

/// A QEMU `virt`-shaped tree with the given root cell sizes and `/memory`
/// `reg` cells.
pub fn virt_blob(address_cells: u32, size_cells: u32, reg: &[u32]) -> Vec<u8> {
    let mut b = FdtWriter::new();
    b.begin("")
        .prop_cells("#address-cells", &[address_cells])
        .prop_cells("#size-cells", &[size_cells])
        .prop("compatible", b"linux,dummy-virt\0")
        .begin("memory@40000000")
        .prop("device_type", b"memory\0")
        .prop_cells("reg", reg)
        .end()
        .begin("chosen")
        .end()
        .end();
    b.finish()
}
