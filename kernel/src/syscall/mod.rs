/// System call dispatch.
///
/// The architecture trampolines save the caller's registers into a
/// [`SyscallFrame`] and hand it to [`SyscallContext::dispatch`]. Only the
/// memory and thread entry points live here; numbers nobody implements
/// are logged and answered with `-ENOSYS`.
///
/// `clone` and `exit` rewrite the frame, so the trampoline returns into
/// whichever thread is current afterwards. A parent's whole frame is kept
/// while its child runs and handed back on the child's `exit`.
pub mod errno;

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::mem::{Heap, PAGE_SIZE};
use crate::thread::{CloneFlags, CloneRequest, ThreadError, ThreadTable, Tid, TlsRegister};

use errno::{EFAULT, EINVAL, ENODEV, ENOMEM, ENOSYS};

/// Callee-saved registers: rbx, rbp, r12-r15.
#[cfg(target_arch = "x86_64")]
pub const PRESERVED: usize = 6;
/// Callee-saved registers: x19-x30.
#[cfg(target_arch = "aarch64")]
pub const PRESERVED: usize = 12;

/// Saved caller state. On x86_64 the field order is what the trampoline
/// pushes, lowest address first.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallFrame {
    pub nr: u64,
    pub args: [u64; 6],
    /// Instruction after the syscall.
    pub ip: u64,
    pub preserved: [u64; PRESERVED],
    pub flags: u64,
    pub sp: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<SyscallFrame>(), 80 + 8 * PRESERVED);
static_assertions::const_assert_eq!(core::mem::size_of::<SyscallFrame>() % 16, 0);

/// Linux syscall numbers for the build's architecture.
#[cfg(target_arch = "x86_64")]
pub mod nr {
    pub const MMAP: u64 = 9;
    pub const MUNMAP: u64 = 11;
    pub const BRK: u64 = 12;
    pub const CLONE: u64 = 56;
    pub const FORK: u64 = 57;
    pub const VFORK: u64 = 58;
    pub const EXIT: u64 = 60;
    pub const ARCH_PRCTL: u64 = 158;
    pub const SET_TID_ADDRESS: u64 = 218;
    pub const EXIT_GROUP: u64 = 231;

    /// clone(flags, stack, parent_tid, child_tid, tls)
    pub const CLONE_CHILD_TID_ARG: usize = 3;
    pub const CLONE_TLS_ARG: usize = 4;
}

#[cfg(target_arch = "aarch64")]
pub mod nr {
    pub const EXIT: u64 = 93;
    pub const EXIT_GROUP: u64 = 94;
    pub const SET_TID_ADDRESS: u64 = 96;
    pub const BRK: u64 = 214;
    pub const MUNMAP: u64 = 215;
    pub const CLONE: u64 = 220;
    pub const MMAP: u64 = 222;

    /// clone(flags, stack, parent_tid, tls, child_tid)
    pub const CLONE_TLS_ARG: usize = 3;
    pub const CLONE_CHILD_TID_ARG: usize = 4;
}

#[cfg(target_arch = "x86_64")]
mod arch_prctl {
    pub const SET_GS: u64 = 0x1001;
    pub const SET_FS: u64 = 0x1002;
    pub const GET_FS: u64 = 0x1003;
    pub const GET_GS: u64 = 0x1004;
}

const MAP_ANONYMOUS: u64 = 0x20;
const MAP_FIXED: u64 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Put this in the return register and go back to `frame.ip`.
    Return(i64),
    /// The process is done.
    Exit(i32),
}

struct Threads<T> {
    table: ThreadTable,
    tls: T,
    /// Frames of suspended parents.
    parked: BTreeMap<Tid, SyscallFrame>,
}

pub struct SyscallContext<T: TlsRegister> {
    heap: &'static Heap,
    threads: Mutex<Threads<T>>,
    trace: bool,
}

impl<T: TlsRegister> SyscallContext<T> {
    /// Needs a ready heap: the thread table allocates.
    pub fn new(heap: &'static Heap, tls: T, trace: bool) -> Self {
        let table = ThreadTable::new(tls.tls());
        Self { heap, threads: Mutex::new(Threads { table, tls, parked: BTreeMap::new() }), trace }
    }

    pub fn dispatch(&self, frame: &mut SyscallFrame) -> SyscallOutcome {
        if self.trace {
            log::debug!("syscall {} {:x?}", frame.nr, frame.args);
        }
        let a = frame.args;

        let ret = match frame.nr {
            nr::BRK => self.heap.set_break(a[0] as usize) as i64,
            nr::MMAP => self.mmap(a[0], a[1], a[3]),
            nr::MUNMAP => self.munmap(a[0], a[1]),
            nr::CLONE => self.clone(frame),
            nr::EXIT => return self.exit(frame),
            nr::EXIT_GROUP => return SyscallOutcome::Exit(a[0] as i32),
            nr::SET_TID_ADDRESS => self.threads.lock().table.set_tid_address(a[0] as usize) as i64,
            #[cfg(target_arch = "x86_64")]
            nr::ARCH_PRCTL => self.arch_prctl(a[0], a[1]),
            #[cfg(target_arch = "x86_64")]
            nr::FORK | nr::VFORK => -ENOSYS,
            other => {
                log::warn!("unimplemented syscall {} (args {:x?})", other, a);
                -ENOSYS
            }
        };
        SyscallOutcome::Return(ret)
    }

    fn mmap(&self, _addr: u64, len: u64, flags: u64) -> i64 {
        if len == 0 || flags & MAP_FIXED != 0 {
            return -EINVAL;
        }
        if flags & MAP_ANONYMOUS == 0 {
            return -ENODEV;
        }
        let pages = (len as usize).div_ceil(PAGE_SIZE);
        match self.heap.map_pages(pages) {
            Ok(addr) => {
                // Anonymous mappings read as zero.
                unsafe { core::ptr::write_bytes(addr as *mut u8, 0, pages * PAGE_SIZE) };
                addr as i64
            }
            Err(_) => -ENOMEM,
        }
    }

    fn munmap(&self, addr: u64, len: u64) -> i64 {
        if len == 0 {
            return -EINVAL;
        }
        let pages = (len as usize).div_ceil(PAGE_SIZE);
        match self.heap.unmap_pages(addr as usize, pages) {
            Ok(()) => 0,
            Err(_) => -EINVAL,
        }
    }

    fn clone(&self, frame: &mut SyscallFrame) -> i64 {
        let a = frame.args;
        let req = CloneRequest {
            flags: CloneFlags::from_bits_retain(a[0]),
            stack: a[1] as usize,
            parent_tid_ptr: a[2] as usize,
            child_tid_ptr: a[nr::CLONE_CHILD_TID_ARG] as usize,
            newtls: a[nr::CLONE_TLS_ARG] as usize,
            next_instr: frame.ip as usize,
            old_stack: frame.sp as usize,
        };

        let mut guard = self.threads.lock();
        let Threads { table, tls, parked } = &mut *guard;
        let parent = table.current_tid();
        match table.clone_thread(req, tls) {
            Ok(tid) => {
                parked.insert(parent, *frame);
                if req.flags.contains(CloneFlags::PARENT_SETTID) {
                    unsafe { store_tid(req.parent_tid_ptr, tid) };
                }
                if req.flags.contains(CloneFlags::CHILD_SETTID) {
                    unsafe { store_tid(req.child_tid_ptr, tid) };
                }
                // The child continues after the syscall on its own stack.
                frame.sp = req.stack as u64;
                0
            }
            Err(ThreadError::NoStack) => -EINVAL,
            Err(e) => {
                log::warn!("clone: {}", e);
                -ENOSYS
            }
        }
    }

    fn exit(&self, frame: &mut SyscallFrame) -> SyscallOutcome {
        let code = frame.args[0] as i32;
        let mut guard = self.threads.lock();
        let Threads { table, tls, parked } = &mut *guard;
        match table.exit_current(tls) {
            Ok(out) => {
                if out.clear_tid != 0 {
                    unsafe { store_tid(out.clear_tid, 0) };
                }
                if let Some(parent) = parked.remove(&out.parent) {
                    *frame = parent;
                }
                frame.ip = out.resume.ip as u64;
                frame.sp = out.resume.stack as u64;
                SyscallOutcome::Return(out.child as i64)
            }
            Err(ThreadError::MainThreadExit) => SyscallOutcome::Exit(code),
            Err(e) => panic!("exit: {}", e),
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn arch_prctl(&self, code: u64, addr: u64) -> i64 {
        let mut guard = self.threads.lock();
        match code {
            arch_prctl::SET_FS => {
                guard.tls.set_tls(addr as usize);
                0
            }
            arch_prctl::SET_GS => {
                if guard.tls.set_gs(addr as usize) {
                    0
                } else {
                    -EINVAL
                }
            }
            arch_prctl::GET_FS | arch_prctl::GET_GS => {
                panic!("arch_prctl: GET_FS/GET_GS not supported")
            }
            _ => {
                if addr == 0 {
                    -EFAULT
                } else {
                    -EINVAL
                }
            }
        }
    }

    pub fn current_tid(&self) -> u32 {
        self.threads.lock().table.current_tid()
    }
}

/// Write a tid into application memory.
///
/// # Safety
/// `ptr` is 0 or points at a writable u32.
unsafe fn store_tid(ptr: usize, tid: u32) {
    if ptr != 0 {
        unsafe { (ptr as *mut u32).write_volatile(tid) };
    }
}
