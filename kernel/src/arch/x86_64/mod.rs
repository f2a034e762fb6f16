/// x86_64 PC support.
///
/// This module provides:
/// - Port I/O and MSR access
/// - Serial console (COM1)
/// - CPU feature checks for SANITY_CHECK
/// - GDT/TSS, IDT and PIC setup for ENABLE_INTERRUPTS
/// - The `syscall` entry for ENABLE_SYSCALLS
/// - The multiboot entry and 32-bit to long mode trampoline
pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod serial;
pub mod start;
pub mod syscall;

use crate::boot::discover::{self, IdentityMapped};
use crate::boot::{bss, BootArgs, BootError, DiscoveredMemory, Platform};
use crate::config::KernelConfig;
use crate::machine::Machine;
use crate::mem::MemoryRegion;

use super::ImageStages;

/// Stop for good: interrupts off, then `hlt` forever.
pub fn halt() -> ! {
    loop {
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

pub fn outb(port: u16, value: u8) {
    unsafe { core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)) };
}

pub fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe { core::arch::asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack, preserves_flags)) };
    value
}

/// Read a model-specific register.
#[inline(always)]
pub fn rdmsr(msr: u32) -> u64 {
    let (lo, hi): (u32, u32);
    unsafe {
        core::arch::asm!("rdmsr", in("ecx") msr, out("eax") lo, out("edx") hi, options(nostack, preserves_flags));
    }
    ((hi as u64) << 32) | lo as u64
}

/// Write a model-specific register.
///
/// # Safety
/// Writing the wrong MSR can change how the CPU executes everything after.
#[inline(always)]
pub unsafe fn wrmsr(msr: u32, value: u64) {
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nostack, preserves_flags),
        );
    }
}

/// Multiboot PC.
pub struct PcPlatform {
    image: ImageStages,
}

impl PcPlatform {
    pub const fn new() -> Self {
        Self { image: ImageStages::new() }
    }
}

impl Default for PcPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for PcPlatform {
    const NAME: &'static str = "x86_64-pc";

    fn sanity_check(&mut self) -> Result<(), BootError> {
        if !cpu::has_long_mode() {
            return Err(BootError::Sanity("CPU lacks long mode"));
        }
        if !cpu::has_sse2() {
            return Err(BootError::Sanity("CPU lacks SSE2"));
        }
        if !cpu::has_fxsr() {
            return Err(BootError::Sanity("CPU lacks FXSAVE/FXRSTOR"));
        }
        if !cpu::has_syscall() {
            return Err(BootError::Sanity("CPU lacks SYSCALL"));
        }
        Ok(())
    }

    fn discover_memory(&mut self, args: BootArgs, _config: &KernelConfig) -> Result<DiscoveredMemory, BootError> {
        discover::pc_memory(args, bss::image_end(), &IdentityMapped)
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
        unsafe { syscall::init(machine) };
        log::info!("syscall entry at {:#x}", syscall::entry_address());
        Ok(())
    }

    fn enable_interrupts(&mut self) {
        unsafe {
            gdt::init();
            pic::init();
            idt::init();
            core::arch::asm!("sti", options(nomem, nostack));
        }
        log::info!("interrupts enabled");
    }
}
