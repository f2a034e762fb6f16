/// aarch64 support for the QEMU `virt` machine.
///
/// Memory comes from the device tree, the console is the PL011 and
/// syscalls arrive as `svc` through the vector table. The MMU stays off:
/// everything runs identity mapped at EL1.
pub mod start;
pub mod uart;
pub mod vectors;

use crate::boot::discover::{self, IdentityMapped};
use crate::boot::{bss, BootArgs, BootError, DiscoveredMemory, Platform};
use crate::config::KernelConfig;
use crate::machine::Machine;
use crate::mem::MemoryRegion;

use super::ImageStages;

/// Stop for good.
pub fn halt() -> ! {
    loop {
        unsafe { core::arch::asm!("msr daifset, #0xf", "wfi", options(nomem, nostack)) };
    }
}

/// Exception level the core is running at.
fn current_el() -> u64 {
    let el: u64;
    unsafe { core::arch::asm!("mrs {}, CurrentEL", out(reg) el, options(nomem, nostack)) };
    (el >> 2) & 0x3
}

pub struct VirtPlatform {
    image: ImageStages,
}

impl VirtPlatform {
    pub const fn new() -> Self {
        Self { image: ImageStages::new() }
    }
}

impl Default for VirtPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for VirtPlatform {
    const NAME: &'static str = "aarch64-virt";

    fn sanity_check(&mut self) -> Result<(), BootError> {
        match current_el() {
            1 => Ok(()),
            2 => Err(BootError::Sanity("entered at EL2, expected EL1")),
            _ => Err(BootError::Sanity("not running at EL1")),
        }
    }

    fn discover_memory(&mut self, args: BootArgs, config: &KernelConfig) -> Result<DiscoveredMemory, BootError> {
        discover::dtb_memory(args, bss::image_end(), config, &IdentityMapped)
    }

    fn image_region(&self) -> MemoryRegion {
        bss::image_region()
    }

    fn relocate_symbols(&mut self, free_begin: usize, memory_end: usize) -> Result<usize, BootError> {
        self.image.relocate_symbols(free_begin, memory_end)
    }

    unsafe fn zero_bss(&mut self, config: &KernelConfig) {
        unsafe { self.image.zero_bss(config) };
    }

    fn enable_syscalls(&mut self, machine: &'static Machine) -> Result<(), BootError> {
        unsafe { vectors::init(machine) };
        log::info!("exception vectors installed");
        Ok(())
    }

    fn enable_interrupts(&mut self) {
        unsafe { core::arch::asm!("msr daifclr, #0xf", options(nomem, nostack)) };
        log::info!("interrupts enabled");
    }
}
