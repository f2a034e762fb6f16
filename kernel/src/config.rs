/// Kernel configuration, injected at startup.
///
/// Values are compile-time constants with build-time overrides:
/// - `EMBER_BRK_MAX`     size of the brk heap region (decimal or 0x-hex bytes)
/// - `EMBER_LOG`         error | warn | info | debug | trace
/// - `EMBER_TRACE_SYSCALLS` set to log every dispatched syscall
///
/// `build.rs` validates them and reruns when they change; `option_env!`
/// picks them up here.
use core::fmt;

use log::LevelFilter;

use crate::mem::PAGE_SIZE;

/// Default brk region size (1 MiB).
pub const DEFAULT_BRK_MAX: usize = 0x10_0000;

/// Where QEMU's aarch64 `virt` machine places the device tree when the
/// loader does not pass its address in x0.
pub const DEFAULT_FDT_ADDR: usize = 0x4000_0000;

/// Bytes set aside in the image for the symbol table (256 KiB).
pub const SYMBOLS_RESERVE: usize = 0x4_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Ceiling of the bump (brk) heap region. Must be a whole number of pages.
    pub brk_max: usize,
    /// Device tree address used when the boot register holds 0.
    pub fdt_fallback: usize,
    /// Maximum level passed to the `log` facade.
    pub log_level: LevelFilter,
    /// Log every syscall at debug level.
    pub trace_syscalls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    BrkMaxZero,
    BrkMaxUnaligned(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::BrkMaxZero => write!(f, "brk_max must be non-zero"),
            ConfigError::BrkMaxUnaligned(v) => {
                write!(f, "brk_max {:#x} is not a multiple of {:#x}", v, PAGE_SIZE)
            }
        }
    }
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        brk_max: match option_env!("EMBER_BRK_MAX") {
            Some(s) => parse_size(s),
            None => DEFAULT_BRK_MAX,
        },
        fdt_fallback: DEFAULT_FDT_ADDR,
        log_level: match option_env!("EMBER_LOG") {
            Some(s) => parse_level(s),
            None => LevelFilter::Info,
        },
        trace_syscalls: option_env!("EMBER_TRACE_SYSCALLS").is_some(),
    };

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brk_max == 0 {
            return Err(ConfigError::BrkMaxZero);
        }
        if self.brk_max % PAGE_SIZE != 0 {
            return Err(ConfigError::BrkMaxUnaligned(self.brk_max));
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Parse a byte count written as decimal or `0x` hex, `_` separators allowed.
/// A malformed value is a compile error when used in a const.
pub const fn parse_size(s: &str) -> usize {
    let bytes = s.as_bytes();
    let (radix, mut i) = if bytes.len() > 2 && bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X') {
        (16, 2)
    } else {
        (10, 0)
    };
    if i == bytes.len() {
        panic!("empty size");
    }

    let mut value: usize = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        if b == b'_' {
            continue;
        }
        let digit = match b {
            b'0'..=b'9' => (b - b'0') as usize,
            b'a'..=b'f' if radix == 16 => (b - b'a' + 10) as usize,
            b'A'..=b'F' if radix == 16 => (b - b'A' + 10) as usize,
            _ => panic!("invalid digit in size"),
        };
        value = match value.checked_mul(radix) {
            Some(v) => match v.checked_add(digit) {
                Some(v) => v,
                None => panic!("size overflows usize"),
            },
            None => panic!("size overflows usize"),
        };
    }
    value
}

const fn parse_level(s: &str) -> LevelFilter {
    match s.as_bytes() {
        b"off" => LevelFilter::Off,
        b"error" => LevelFilter::Error,
        b"warn" => LevelFilter::Warn,
        b"info" => LevelFilter::Info,
        b"debug" => LevelFilter::Debug,
        b"trace" => LevelFilter::Trace,
        _ => panic!("EMBER_LOG must be off|error|warn|info|debug|trace"),
    }
}
