//! Ember kernel entry point.
//!
//! The architecture trampoline (`arch::*::start`) calls `kernel_start`
//! with the boot magic and the firmware pointer. From there the boot
//! sequencer takes the machine to RUNNING; this image then reports the
//! memory layout, exercises the heap once and exits.
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    extern crate alloc;

    use alloc::vec::Vec;
    use core::panic::PanicInfo;

    use ember_kernel::arch::{self, console, CurrentPlatform};
    use ember_kernel::boot::{self, BootArgs, Platform};
    use ember_kernel::{heap_avail, heap_end, heap_ready, heap_usage, serial_println};
    use ember_kernel::{KernelConfig, Machine, HEAP, MACHINE};

    /// Called by the architecture trampoline on the boot stack.
    ///
    /// # Safety
    /// Entered once, from the trampoline, before anything touched `.bss`.
    #[no_mangle]
    pub unsafe extern "C" fn kernel_start(magic: usize, addr: usize) -> ! {
        console::CONSOLE.lock().init();
        serial_println!("ember {} on {}", env!("CARGO_PKG_VERSION"), CurrentPlatform::NAME);

        let mut platform = CurrentPlatform::new();
        let args = BootArgs { magic, addr };
        match unsafe { boot::run(&mut platform, args, KernelConfig::DEFAULT, &MACHINE, &HEAP) } {
            Ok(machine) => run(machine),
            Err(e) => {
                serial_println!("[boot] fatal: {}", e);
                arch::halt()
            }
        }
    }

    fn run(machine: &'static Machine) -> ! {
        machine.with_memory_map(|map| {
            for entry in map.iter() {
                log::info!("{:<14} {:#012x}..{:#012x}", entry.name, entry.region.begin, entry.region.end);
            }
        });

        let scratch: Vec<u64> = (0..1024).collect();
        log::info!(
            "heap: {:#x} used, {:#x} available, page high water {:#x}",
            heap_usage(),
            heap_avail(),
            heap_end()
        );
        drop(scratch);

        arch::program_exit(0)
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        // The panicking code may have held the console.
        unsafe { console::CONSOLE.force_unlock() };
        serial_println!("!!! KERNEL PANIC !!!");
        serial_println!("{}", info);
        if heap_ready() {
            serial_println!("heap: {:#x} used, {:#x} available", heap_usage(), heap_avail());
        }
        arch::halt()
    }
}

/// Host builds have nothing to run; the library carries the tests.
#[cfg(not(target_os = "none"))]
fn main() {}
