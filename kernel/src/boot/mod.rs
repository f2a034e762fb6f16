/// Boot sequencer.
///
/// Brings the machine from the firmware hand-off to a running system in a
/// fixed order:
///
/// ```text
/// RESET -> SANITY_CHECK -> DISCOVER_MEMORY -> RELOCATE_SYMBOLS -> ZERO_BSS
///       -> CONSTRUCT_MACHINE -> HAL_INIT -> ENABLE_SYSCALLS -> ENABLE_INTERRUPTS -> RUNNING
/// ```
///
/// Stages only move forward and nothing is retried. The architecture
/// specific steps come from a [`Platform`]; everything else is portable.
/// Any error returned from here is fatal for the caller.
pub mod bss;
pub mod discover;
pub mod symbols;


use core::fmt;

use ember_boot::{DtbError, MultibootError, SoftResetError};

use crate::config::{ConfigError, KernelConfig};
use crate::machine::{Machine, MachineError, MachineSlot};
use crate::mem::{Heap, MemoryRegion};

pub use discover::PhysMemory;
pub use symbols::SymbolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootStage {
    Reset,
    SanityCheck,
    DiscoverMemory,
    RelocateSymbols,
    ZeroBss,
    ConstructMachine,
    HalInit,
    EnableSyscalls,
    EnableInterrupts,
    Running,
}

impl BootStage {
    pub fn next(self) -> Option<BootStage> {
        use BootStage::*;
        Some(match self {
            Reset => SanityCheck,
            SanityCheck => DiscoverMemory,
            DiscoverMemory => RelocateSymbols,
            RelocateSymbols => ZeroBss,
            ZeroBss => ConstructMachine,
            ConstructMachine => HalInit,
            HalInit => EnableSyscalls,
            EnableSyscalls => EnableInterrupts,
            EnableInterrupts => Running,
            Running => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            BootStage::Reset => "RESET",
            BootStage::SanityCheck => "SANITY_CHECK",
            BootStage::DiscoverMemory => "DISCOVER_MEMORY",
            BootStage::RelocateSymbols => "RELOCATE_SYMBOLS",
            BootStage::ZeroBss => "ZERO_BSS",
            BootStage::ConstructMachine => "CONSTRUCT_MACHINE",
            BootStage::HalInit => "HAL_INIT",
            BootStage::EnableSyscalls => "ENABLE_SYSCALLS",
            BootStage::EnableInterrupts => "ENABLE_INTERRUPTS",
            BootStage::Running => "RUNNING",
        }
    }
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracks the current stage and refuses anything but the next one.
#[derive(Debug)]
pub struct BootSequencer {
    stage: BootStage,
}

impl BootSequencer {
    pub const fn new() -> Self {
        Self { stage: BootStage::Reset }
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    pub fn advance(&mut self, to: BootStage) -> Result<(), BootError> {
        if self.stage.next() != Some(to) {
            return Err(BootError::OutOfOrder { from: self.stage, to });
        }
        // Nothing is logged until `.bss`, where the logger lives, has been cleared.
        if self.stage >= BootStage::ZeroBss {
            log::debug!("boot: {} -> {}", self.stage, to);
        }
        self.stage = to;
        Ok(())
    }
}

impl Default for BootSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// The two machine words the entry point receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootArgs {
    /// Multiboot or soft-reset magic on PC; unused (0) on aarch64.
    pub magic: usize,
    /// Info block, soft-reset record or device tree address.
    pub addr: usize,
}

/// Where DISCOVER_MEMORY found its answer. Kept for the log line printed
/// once the logger is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySource {
    Multiboot { mem_lower: u32, mem_upper: u32 },
    SoftReset { high_mem: usize, liveupdate_loc: usize },
    DeviceTree {
        addr: usize,
        address_cells: usize,
        size_cells: usize,
        /// `/memory` ranges in the `reg` property.
        ranges: usize,
        discontiguous: bool,
    },
}

impl fmt::Display for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySource::Multiboot { mem_lower, mem_upper } => {
                write!(f, "multiboot (lower {} KiB, upper {} KiB)", mem_lower, mem_upper)
            }
            MemorySource::SoftReset { high_mem, liveupdate_loc } => write!(
                f,
                "soft reset (high memory {:#x}, live update at {:#x})",
                high_mem, liveupdate_loc
            ),
            MemorySource::DeviceTree { addr, address_cells, size_cells, ranges, .. } => write!(
                f,
                "fdt @ {:#x} ({} ranges, address cells {}, size cells {})",
                addr, ranges, address_cells, size_cells
            ),
        }
    }
}

/// Result of DISCOVER_MEMORY, whatever the firmware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredMemory {
    pub free_begin: usize,
    pub memory_end: usize,
    /// Bytes a previous kernel preserved for live update.
    pub liveupdate_size: usize,
    pub source: MemorySource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    OutOfOrder { from: BootStage, to: BootStage },
    Config(ConfigError),
    /// Failed runtime sanity check (CPU feature, privilege level).
    Sanity(&'static str),
    UnknownBootMagic(usize),
    Multiboot(MultibootError),
    SoftReset(SoftResetError),
    DeviceTree(DtbError),
    /// Memory reported beyond what a pointer can address.
    MemoryOutOfReach(u64),
    NoFreeMemory { free_begin: usize, memory_end: usize },
    Symbols(SymbolError),
    SymbolsPastMemoryEnd { free_begin: usize, memory_end: usize },
    Machine(MachineError),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::OutOfOrder { from, to } => write!(f, "boot stage {} cannot follow {}", to, from),
            BootError::Config(e) => write!(f, "config: {}", e),
            BootError::Sanity(what) => write!(f, "sanity check failed: {}", what),
            BootError::UnknownBootMagic(m) => write!(f, "unknown boot magic {:#x}", m),
            BootError::Multiboot(e) => write!(f, "multiboot: {}", e),
            BootError::SoftReset(e) => write!(f, "soft reset: {}", e),
            BootError::DeviceTree(e) => write!(f, "device tree: {}", e),
            BootError::MemoryOutOfReach(end) => write!(f, "memory end {:#x} not addressable", end),
            BootError::NoFreeMemory { free_begin, memory_end } => write!(
                f,
                "free memory starts at {:#x}, past memory end {:#x}",
                free_begin, memory_end
            ),
            BootError::Symbols(e) => write!(f, "symbols: {}", e),
            BootError::SymbolsPastMemoryEnd { free_begin, memory_end } => write!(
                f,
                "relocated symbols end at {:#x}, past memory end {:#x}",
                free_begin, memory_end
            ),
            BootError::Machine(e) => write!(f, "machine: {}", e),
        }
    }
}

impl From<ConfigError> for BootError {
    fn from(e: ConfigError) -> Self {
        BootError::Config(e)
    }
}

impl From<MultibootError> for BootError {
    fn from(e: MultibootError) -> Self {
        BootError::Multiboot(e)
    }
}

impl From<SoftResetError> for BootError {
    fn from(e: SoftResetError) -> Self {
        BootError::SoftReset(e)
    }
}

impl From<DtbError> for BootError {
    fn from(e: DtbError) -> Self {
        BootError::DeviceTree(e)
    }
}

impl From<SymbolError> for BootError {
    fn from(e: SymbolError) -> Self {
        BootError::Symbols(e)
    }
}

impl From<MachineError> for BootError {
    fn from(e: MachineError) -> Self {
        BootError::Machine(e)
    }
}

/// What each architecture supplies to the sequencer.
pub trait Platform {
    const NAME: &'static str;

    /// Runtime checks the build can't prove (CPU features, privilege level).
    fn sanity_check(&mut self) -> Result<(), BootError>;

    fn discover_memory(
        &mut self,
        args: BootArgs,
        config: &KernelConfig,
    ) -> Result<DiscoveredMemory, BootError>;

    /// The loaded image, recorded as reserved in the memory map.
    fn image_region(&self) -> MemoryRegion;

    /// Copy the symbol table to `free_begin`. Returns the bytes consumed.
    fn relocate_symbols(&mut self, free_begin: usize, memory_end: usize) -> Result<usize, BootError>;

    /// Zero `.bss`, then bring up what lives in it: the logger and the
    /// relocated symbol table.
    ///
    /// # Safety
    /// Nothing in `.bss` may have been used yet.
    unsafe fn zero_bss(&mut self, config: &KernelConfig);

    fn enable_syscalls(&mut self, machine: &'static Machine) -> Result<(), BootError>;

    fn enable_interrupts(&mut self);
}

/// Run every stage up to RUNNING and return the machine.
///
/// # Safety
/// Called once per boot, on the boot processor, before anything has
/// touched a `.bss` static: the ZERO_BSS stage clears them all.
pub unsafe fn run<P: Platform>(
    platform: &mut P,
    args: BootArgs,
    config: KernelConfig,
    slot: &'static MachineSlot,
    heap: &'static Heap,
) -> Result<&'static Machine, BootError> {
    let mut seq = BootSequencer::new();
    config.validate()?;

    seq.advance(BootStage::SanityCheck)?;
    platform.sanity_check()?;

    seq.advance(BootStage::DiscoverMemory)?;
    let found = platform.discover_memory(args, &config)?;
    if found.free_begin >= found.memory_end {
        return Err(BootError::NoFreeMemory {
            free_begin: found.free_begin,
            memory_end: found.memory_end,
        });
    }

    seq.advance(BootStage::RelocateSymbols)?;
    let consumed = platform.relocate_symbols(found.free_begin, found.memory_end)?;
    let free_begin = match found.free_begin.checked_add(consumed) {
        Some(f) if f <= found.memory_end => f,
        _ => {
            return Err(BootError::SymbolsPastMemoryEnd {
                free_begin: found.free_begin.saturating_add(consumed),
                memory_end: found.memory_end,
            })
        }
    };

    seq.advance(BootStage::ZeroBss)?;
    unsafe { platform.zero_bss(&config) };
    log::info!("{}: booting, free memory {:#x}..{:#x}", P::NAME, free_begin, found.memory_end);
    log::info!("{}: memory from {}", P::NAME, found.source);
    if found.liveupdate_size > 0 {
        log::info!("{}: {:#x} bytes preserved for live update", P::NAME, found.liveupdate_size);
    }
    if let MemorySource::DeviceTree { discontiguous: true, .. } = found.source {
        log::warn!("{}: /memory has gaps; only memory up to {:#x} is used", P::NAME, found.memory_end);
    }

    seq.advance(BootStage::ConstructMachine)?;
    let reserved = [
        ("kernel image", platform.image_region()),
        ("symbols", MemoryRegion::new(found.free_begin, free_begin)),
    ];
    let machine = slot.create(free_begin, found.memory_end - free_begin, heap, config, &reserved)?;

    seq.advance(BootStage::HalInit)?;
    machine.init()?;
    heap.set_liveupdate_size(found.liveupdate_size);

    seq.advance(BootStage::EnableSyscalls)?;
    platform.enable_syscalls(machine)?;

    seq.advance(BootStage::EnableInterrupts)?;
    platform.enable_interrupts();

    seq.advance(BootStage::Running)?;
    log::info!("{}: running, heap {:#x} bytes free", P::NAME, heap.heap_avail());
    Ok(machine)
}
