/// Architecture support, bare-metal builds only.
///
/// Each architecture provides a console, a [`Platform`](crate::boot::Platform)
/// implementation exported as `CurrentPlatform`, `halt()`, and the
/// assembly entry that ends up in `kernel_start(magic, addr)`.
#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::{halt, serial as console, PcPlatform as CurrentPlatform};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64::{halt, uart as console, VirtPlatform as CurrentPlatform};

use crate::boot::{bss, symbols, BootError};
use crate::config::KernelConfig;
use crate::mem::MemoryRegion;

/// The image-related stages every platform shares.
pub(crate) struct ImageStages {
    symbols: MemoryRegion,
}

impl ImageStages {
    pub(crate) const fn new() -> Self {
        Self { symbols: MemoryRegion::new(0, 0) }
    }

    pub(crate) fn relocate_symbols(&mut self, free_begin: usize, memory_end: usize) -> Result<usize, BootError> {
        self.symbols = unsafe { symbols::relocate_image(free_begin, memory_end)? };
        Ok(self.symbols.size())
    }

    /// Zero `.bss`, then bring up what lives there.
    ///
    /// # Safety
    /// See [`bss::zero_bss`].
    pub(crate) unsafe fn zero_bss(&mut self, config: &KernelConfig) {
        unsafe { bss::zero_bss() };
        crate::logger::init(config.log_level);
        if let Err(e) = unsafe { symbols::install_relocated(self.symbols) } {
            log::warn!("symbol table unusable: {}", e);
        }
    }
}

/// The program called `exit`/`exit_group`: report and stop.
pub fn program_exit(status: i32) -> ! {
    let heap = &crate::mem::HEAP;
    if heap.heap_ready() {
        crate::serial_println!(
            "[ember] exit status {}, heap used {:#x} of {:#x}",
            status,
            heap.heap_usage(),
            heap.heap_usage() + heap.heap_avail()
        );
    } else {
        crate::serial_println!("[ember] exit status {}", status);
    }
    halt()
}

/// Print to the boot console.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        {
            use core::fmt::Write;
            let mut console = $crate::arch::console::CONSOLE.lock();
            let _ = write!(console, $($arg)*);
        }
    };
}

/// Print to the boot console with a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
