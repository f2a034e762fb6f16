#![cfg_attr(not(test), no_std)]
#![cfg_attr(all(target_os = "none", target_arch = "x86_64"), feature(abi_x86_interrupt))]
// Ember kernel: early boot and memory core of a single-address-space unikernel.
//
// Portable modules (boot sequencing, heap, machine, threads, syscalls) are
// plain Rust and build for the host so `cargo test` exercises them directly.
// Hardware modules are only compiled for the bare-metal targets.

extern crate alloc;

pub mod boot;
pub mod config;
pub mod machine;
pub mod mem;
pub mod syscall;
pub mod thread;

#[cfg(target_os = "none")]
pub mod arch;
#[cfg(target_os = "none")]
pub mod logger;

pub use config::KernelConfig;
pub use machine::{machine, Machine, MachineError, MachineSlot, MACHINE};
pub use mem::{heap_avail, heap_end, heap_ready, heap_usage, total_memuse, Heap, HEAP};
