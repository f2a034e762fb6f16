/// `syscall` instruction entry.
///
/// The application runs in ring 0, so SYSCALL arrives on the caller's own
/// stack with RCX = return RIP and R11 = RFLAGS, and returns with a plain
/// jump instead of SYSRET. The trampoline steps over the 128-byte red
/// zone, aligns the stack and pushes a [`SyscallFrame`]; the dispatcher may
/// rewrite RIP/RSP in it (clone/exit), and the trampoline resumes wherever
/// the frame says.
use core::arch::global_asm;

use spin::Once;

use super::{gdt, rdmsr, wrmsr};
use crate::machine::Machine;
use crate::syscall::errno::ENOSYS;
use crate::syscall::{SyscallContext, SyscallFrame, SyscallOutcome};
use crate::thread::TlsRegister;

const IA32_EFER: u32 = 0xC000_0080;
const IA32_STAR: u32 = 0xC000_0081;
const IA32_LSTAR: u32 = 0xC000_0082;
const IA32_FMASK: u32 = 0xC000_0084;
const IA32_FS_BASE: u32 = 0xC000_0100;
const IA32_GS_BASE: u32 = 0xC000_0101;

const EFER_SCE: u64 = 1 << 0;

/// RFLAGS cleared on entry: TF, IF, DF, AC.
const SYSCALL_FLAG_MASK: u64 = (1 << 8) | (1 << 9) | (1 << 10) | (1 << 18);

/// FS base holds the thread pointer; GS base is available on request.
pub struct FsBase;

impl TlsRegister for FsBase {
    fn tls(&self) -> usize {
        rdmsr(IA32_FS_BASE) as usize
    }

    fn set_tls(&mut self, tls: usize) {
        unsafe { wrmsr(IA32_FS_BASE, tls as u64) };
    }

    fn set_gs(&mut self, base: usize) -> bool {
        unsafe { wrmsr(IA32_GS_BASE, base as u64) };
        true
    }
}

static CONTEXT: Once<SyscallContext<FsBase>> = Once::new();

extern "C" {
    fn ember_syscall_entry();
}

pub fn entry_address() -> usize {
    ember_syscall_entry as usize
}

/// Create the dispatcher and program the SYSCALL MSRs.
///
/// # Safety
/// Once, after HAL_INIT (the dispatcher allocates).
pub unsafe fn init(machine: &'static Machine) {
    CONTEXT.call_once(|| SyscallContext::new(machine.heap(), FsBase, machine.config().trace_syscalls));
    unsafe {
        wrmsr(IA32_STAR, (gdt::KERNEL_CS as u64) << 32);
        wrmsr(IA32_LSTAR, entry_address() as u64);
        wrmsr(IA32_FMASK, SYSCALL_FLAG_MASK);
        wrmsr(IA32_EFER, rdmsr(IA32_EFER) | EFER_SCE);
    }
}

#[no_mangle]
extern "C" fn ember_syscall(frame: &mut SyscallFrame) -> i64 {
    let Some(context) = CONTEXT.get() else {
        return -ENOSYS;
    };
    match context.dispatch(frame) {
        SyscallOutcome::Return(value) => value,
        SyscallOutcome::Exit(status) => crate::arch::program_exit(status),
    }
}

global_asm!(
    r#"
.section .text
.global ember_syscall_entry
ember_syscall_entry:
    leaq -128(%rsp), %rsp
    pushq %rax
    leaq 136(%rsp), %rax
    andq $-16, %rsp

    pushq %rax
    pushq %r11
    pushq %r15
    pushq %r14
    pushq %r13
    pushq %r12
    pushq %rbp
    pushq %rbx
    pushq %rcx
    pushq %r9
    pushq %r8
    pushq %r10
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq -136(%rax)

    movq %rsp, %rdi
    call ember_syscall

    addq $8, %rsp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %r10
    popq %r8
    popq %r9
    popq %rcx
    popq %rbx
    popq %rbp
    popq %r12
    popq %r13
    popq %r14
    popq %r15
    popfq
    popq %rsp
    jmpq *%rcx
"#,
    options(att_syntax)
);
