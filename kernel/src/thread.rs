/// Thread hand-off for `clone(2)`.
///
/// There is one CPU and no scheduler. Creating a thread suspends the
/// caller where the syscall would have returned, switches the TLS register
/// to the child, and continues on the child's stack. When the child exits,
/// the parent resumes from its saved point with the child's tid as the
/// `clone` result. Threads therefore nest like calls.
use alloc::collections::BTreeMap;
use core::fmt;

use bitflags::bitflags;

pub type Tid = u32;

/// The boot thread.
pub const MAIN_TID: Tid = 1;

bitflags! {
    /// Linux `clone` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        const VM             = 0x0000_0100;
        const FS             = 0x0000_0200;
        const FILES          = 0x0000_0400;
        const SIGHAND        = 0x0000_0800;
        const PIDFD          = 0x0000_1000;
        const PTRACE         = 0x0000_2000;
        const VFORK          = 0x0000_4000;
        const PARENT         = 0x0000_8000;
        const THREAD         = 0x0001_0000;
        const NEWNS          = 0x0002_0000;
        const SYSVSEM        = 0x0004_0000;
        const SETTLS         = 0x0008_0000;
        const PARENT_SETTID  = 0x0010_0000;
        const CHILD_CLEARTID = 0x0020_0000;
        const DETACHED       = 0x0040_0000;
        const UNTRACED       = 0x0080_0000;
        const CHILD_SETTID   = 0x0100_0000;
    }
}

/// Where a suspended thread continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub ip: usize,
    pub stack: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Suspended(ResumePoint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub tid: Tid,
    pub parent: Option<Tid>,
    pub flags: CloneFlags,
    pub stack: usize,
    /// Cleared (and futex-woken, once futexes exist) on exit.
    pub clear_tid: usize,
    pub tls: usize,
    pub state: ThreadState,
}

/// The CPU's thread pointer register (FS base on x86_64, TPIDR_EL0 on aarch64).
pub trait TlsRegister {
    fn tls(&self) -> usize;
    fn set_tls(&mut self, tls: usize);

    /// Secondary base register (GS on x86_64). `false` if there is none.
    fn set_gs(&mut self, _base: usize) -> bool {
        false
    }
}

/// Arguments of a `clone` call, already decoded from registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneRequest {
    pub flags: CloneFlags,
    /// Child stack pointer.
    pub stack: usize,
    pub parent_tid_ptr: usize,
    pub child_tid_ptr: usize,
    pub newtls: usize,
    /// Instruction following the syscall in the parent.
    pub next_instr: usize,
    /// Parent stack pointer at the syscall.
    pub old_stack: usize,
}

/// What the syscall layer does after a child exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub child: Tid,
    pub parent: Tid,
    pub resume: ResumePoint,
    /// Address to zero on behalf of the exited child, or 0.
    pub clear_tid: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// Anything that isn't a thread in our address space (fork-style clone).
    Unsupported(CloneFlags),
    NoStack,
    /// The boot thread has nothing to hand back to.
    MainThreadExit,
    ParentNotSuspended(Tid),
    NoSuchThread(Tid),
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::Unsupported(flags) => write!(f, "unsupported clone flags {:#x}", flags.bits()),
            ThreadError::NoStack => write!(f, "clone without a child stack"),
            ThreadError::MainThreadExit => write!(f, "main thread exit"),
            ThreadError::ParentNotSuspended(t) => write!(f, "parent thread {} is not suspended", t),
            ThreadError::NoSuchThread(t) => write!(f, "no thread {}", t),
        }
    }
}

pub struct ThreadTable {
    threads: BTreeMap<Tid, Thread>,
    current: Tid,
    next_tid: Tid,
}

impl ThreadTable {
    /// A table holding only the running main thread.
    pub fn new(main_tls: usize) -> Self {
        let mut threads = BTreeMap::new();
        threads.insert(
            MAIN_TID,
            Thread {
                tid: MAIN_TID,
                parent: None,
                flags: CloneFlags::empty(),
                stack: 0,
                clear_tid: 0,
                tls: main_tls,
                state: ThreadState::Running,
            },
        );
        Self { threads, current: MAIN_TID, next_tid: MAIN_TID + 1 }
    }

    pub fn current_tid(&self) -> Tid {
        self.current
    }

    pub fn current(&self) -> &Thread {
        // The current tid is always in the table.
        &self.threads[&self.current]
    }

    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Suspend the current thread at `(next_instr, old_stack)` and make a
    /// new one current, with its TLS loaded into `tls`.
    pub fn clone_thread(
        &mut self,
        req: CloneRequest,
        tls: &mut impl TlsRegister,
    ) -> Result<Tid, ThreadError> {
        if !req.flags.contains(CloneFlags::VM | CloneFlags::THREAD) {
            return Err(ThreadError::Unsupported(req.flags));
        }
        if req.stack == 0 {
            return Err(ThreadError::NoStack);
        }

        let parent_tid = self.current;
        let parent_tls = tls.tls();
        let parent = self
            .threads
            .get_mut(&parent_tid)
            .ok_or(ThreadError::NoSuchThread(parent_tid))?;
        parent.tls = parent_tls;
        parent.state = ThreadState::Suspended(ResumePoint { ip: req.next_instr, stack: req.old_stack });

        let tid = self.next_tid;
        self.next_tid += 1;

        let child_tls = if req.flags.contains(CloneFlags::SETTLS) { req.newtls } else { parent_tls };
        let clear_tid = if req.flags.contains(CloneFlags::CHILD_CLEARTID) { req.child_tid_ptr } else { 0 };
        self.threads.insert(
            tid,
            Thread {
                tid,
                parent: Some(parent_tid),
                flags: req.flags,
                stack: req.stack,
                clear_tid,
                tls: child_tls,
                state: ThreadState::Running,
            },
        );

        tls.set_tls(child_tls);
        self.current = tid;
        log::debug!("thread {} -> {} (stack {:#x}, tls {:#x})", parent_tid, tid, req.stack, child_tls);
        Ok(tid)
    }

    /// Retire the current thread and hand the CPU back to its parent.
    pub fn exit_current(&mut self, tls: &mut impl TlsRegister) -> Result<ExitOutcome, ThreadError> {
        let child = self.current;
        let parent_tid = self.current().parent.ok_or(ThreadError::MainThreadExit)?;

        let parent = self
            .threads
            .get_mut(&parent_tid)
            .ok_or(ThreadError::NoSuchThread(parent_tid))?;
        let resume = match parent.state {
            ThreadState::Suspended(point) => point,
            ThreadState::Running => return Err(ThreadError::ParentNotSuspended(parent_tid)),
        };
        parent.state = ThreadState::Running;
        tls.set_tls(parent.tls);

        let exited = self.threads.remove(&child).ok_or(ThreadError::NoSuchThread(child))?;
        self.current = parent_tid;
        log::debug!("thread {} exited, resuming {} at {:#x}", child, parent_tid, resume.ip);

        Ok(ExitOutcome { child, parent: parent_tid, resume, clear_tid: exited.clear_tid })
    }

    /// `set_tid_address(2)`: remember `ptr` for the current thread.
    pub fn set_tid_address(&mut self, ptr: usize) -> Tid {
        let current = self.current;
        if let Some(t) = self.threads.get_mut(&current) {
            t.clear_tid = ptr;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockTls {
        value: usize,
        writes: Vec<usize>,
    }

    impl TlsRegister for MockTls {
        fn tls(&self) -> usize {
            self.value
        }

        fn set_tls(&mut self, tls: usize) {
            self.value = tls;
            self.writes.push(tls);
        }
    }

    fn pthread_flags() -> CloneFlags {
        CloneFlags::VM
            | CloneFlags::FS
            | CloneFlags::FILES
            | CloneFlags::SIGHAND
            | CloneFlags::THREAD
            | CloneFlags::SYSVSEM
            | CloneFlags::SETTLS
            | CloneFlags::PARENT_SETTID
            | CloneFlags::CHILD_CLEARTID
    }

    fn request(next_instr: usize, newtls: usize) -> CloneRequest {
        CloneRequest {
            flags: pthread_flags(),
            stack: 0x7000_0000,
            parent_tid_ptr: 0x6000_0010,
            child_tid_ptr: 0x6000_0020,
            newtls,
            next_instr,
            old_stack: 0x7fff_f000,
        }
    }

    #[test]
    fn clone_saves_parent_resume_point_and_switches_tls() {
        let mut tls = MockTls { value: 0x1111, ..Default::default() };
        let mut table = ThreadTable::new(0x1111);

        let next_instr = 0x40_1234;
        let child = table.clone_thread(request(next_instr, 0xBEEF_0000), &mut tls).unwrap();

        let parent = table.get(MAIN_TID).unwrap();
        assert_eq!(
            parent.state,
            ThreadState::Suspended(ResumePoint { ip: next_instr, stack: 0x7fff_f000 })
        );
        assert_eq!(table.current_tid(), child);
        assert_eq!(table.current().tls, 0xBEEF_0000);
        assert_eq!(tls.value, 0xBEEF_0000);
        assert_eq!(table.current().clear_tid, 0x6000_0020);
    }

    #[test]
    fn exit_resumes_parent_with_its_tls() {
        let mut tls = MockTls { value: 0x1111, ..Default::default() };
        let mut table = ThreadTable::new(0x1111);
        let child = table.clone_thread(request(0x40_2000, 0x2222), &mut tls).unwrap();

        let out = table.exit_current(&mut tls).unwrap();
        assert_eq!(out.child, child);
        assert_eq!(out.parent, MAIN_TID);
        assert_eq!(out.resume, ResumePoint { ip: 0x40_2000, stack: 0x7fff_f000 });
        assert_eq!(out.clear_tid, 0x6000_0020);
        assert_eq!(tls.value, 0x1111);
        assert_eq!(table.current_tid(), MAIN_TID);
        assert_eq!(table.current().state, ThreadState::Running);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn nested_threads_unwind_in_order() {
        let mut tls = MockTls::default();
        let mut table = ThreadTable::new(0);
        let a = table.clone_thread(request(0x1000, 0xA), &mut tls).unwrap();
        let b = table.clone_thread(request(0x2000, 0xB), &mut tls).unwrap();
        assert_eq!(tls.value, 0xB);

        let out = table.exit_current(&mut tls).unwrap();
        assert_eq!((out.child, out.parent, out.resume.ip), (b, a, 0x2000));
        assert_eq!(tls.value, 0xA);

        let out = table.exit_current(&mut tls).unwrap();
        assert_eq!((out.child, out.parent, out.resume.ip), (a, MAIN_TID, 0x1000));
        assert_eq!(tls.writes, [0xA, 0xB, 0xA, 0]);
    }

    #[test]
    fn main_thread_cannot_hand_back() {
        let mut tls = MockTls::default();
        let mut table = ThreadTable::new(0);
        assert_eq!(table.exit_current(&mut tls), Err(ThreadError::MainThreadExit));
    }

    #[test]
    fn without_settls_child_inherits_tls() {
        let mut tls = MockTls { value: 0x5555, ..Default::default() };
        let mut table = ThreadTable::new(0x5555);
        let mut req = request(0x1000, 0xDEAD);
        req.flags.remove(CloneFlags::SETTLS);
        table.clone_thread(req, &mut tls).unwrap();
        assert_eq!(tls.value, 0x5555);
    }

    #[test]
    fn fork_style_and_stackless_clones_are_refused() {
        let mut tls = MockTls::default();
        let mut table = ThreadTable::new(0);

        let mut fork = request(0x1000, 0);
        fork.flags = CloneFlags::CHILD_SETTID | CloneFlags::CHILD_CLEARTID;
        assert!(matches!(table.clone_thread(fork, &mut tls), Err(ThreadError::Unsupported(_))));

        let mut no_stack = request(0x1000, 0);
        no_stack.stack = 0;
        assert_eq!(table.clone_thread(no_stack, &mut tls), Err(ThreadError::NoStack));

        // Neither attempt touched the table or the register.
        assert_eq!(table.len(), 1);
        assert_eq!(table.current().state, ThreadState::Running);
        assert!(tls.writes.is_empty());
    }

    #[test]
    fn set_tid_address_records_pointer() {
        let mut table = ThreadTable::new(0);
        assert_eq!(table.set_tid_address(0x9000), MAIN_TID);
        assert_eq!(table.current().clear_tid, 0x9000);
    }
}
