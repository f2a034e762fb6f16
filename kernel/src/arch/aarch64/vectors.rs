/// Exception vectors and the `svc` entry.
///
/// All sixteen vectors save the full register state into an
/// [`ExceptionContext`] on the current stack and call [`ember_exception`].
/// A synchronous SVC becomes a syscall; the dispatcher's view of the frame
/// is copied back, including a new SP and ELR when `clone` or `exit`
/// switched threads. Anything else prints a register dump and halts.
use core::arch::global_asm;

use spin::Once;

use crate::boot::symbols;
use crate::machine::Machine;
use crate::serial_println;
use crate::syscall::errno::ENOSYS;
use crate::syscall::{SyscallContext, SyscallFrame, SyscallOutcome, PRESERVED};
use crate::thread::TlsRegister;

/// Saved state, laid out as the common entry stores it.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct ExceptionContext {
    /// x0-x30
    pub gpr: [u64; 31],
    /// SP before the exception.
    pub sp: u64,
    pub elr: u64,
    pub spsr: u64,
    pub esr: u64,
    pub far: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<ExceptionContext>(), 288);

/// ESR_EL1 exception class of `svc` from AArch64.
const EC_SVC64: u64 = 0x15;

const KIND_NAMES: [&str; 4] = ["Synchronous", "IRQ", "FIQ", "SError"];
const ORIGIN_NAMES: [&str; 4] = ["EL1t", "EL1h", "EL0 (AArch64)", "EL0 (AArch32)"];

/// TPIDR_EL0 holds the thread pointer.
pub struct TpidrEl0;

impl TlsRegister for TpidrEl0 {
    fn tls(&self) -> usize {
        let value: u64;
        unsafe { core::arch::asm!("mrs {}, tpidr_el0", out(reg) value, options(nomem, nostack)) };
        value as usize
    }

    fn set_tls(&mut self, tls: usize) {
        unsafe { core::arch::asm!("msr tpidr_el0, {}", in(reg) tls as u64, options(nomem, nostack)) };
    }
}

static CONTEXT: Once<SyscallContext<TpidrEl0>> = Once::new();

extern "C" {
    static ember_vectors: u8;
}

/// Create the dispatcher and point VBAR_EL1 at the vectors.
///
/// # Safety
/// Once, after HAL_INIT (the dispatcher allocates).
pub unsafe fn init(machine: &'static Machine) {
    CONTEXT.call_once(|| SyscallContext::new(machine.heap(), TpidrEl0, machine.config().trace_syscalls));
    let base = unsafe { core::ptr::addr_of!(ember_vectors) } as u64;
    unsafe { core::arch::asm!("msr vbar_el1, {}", "isb", in(reg) base, options(nostack)) };
}

#[no_mangle]
extern "C" fn ember_exception(ctx: &mut ExceptionContext, kind: u64) {
    let ec = (ctx.esr >> 26) & 0x3f;
    if kind & 3 == 0 && ec == EC_SVC64 {
        svc(ctx);
        return;
    }
    fatal(ctx, kind)
}

fn svc(ctx: &mut ExceptionContext) {
    let Some(context) = CONTEXT.get() else {
        ctx.gpr[0] = (-ENOSYS) as u64;
        return;
    };

    let mut frame = SyscallFrame {
        nr: ctx.gpr[8],
        args: [ctx.gpr[0], ctx.gpr[1], ctx.gpr[2], ctx.gpr[3], ctx.gpr[4], ctx.gpr[5]],
        ip: ctx.elr,
        preserved: [0; PRESERVED],
        flags: ctx.spsr,
        sp: ctx.sp,
    };
    frame.preserved.copy_from_slice(&ctx.gpr[19..31]);

    match context.dispatch(&mut frame) {
        SyscallOutcome::Return(value) => {
            ctx.gpr[0] = value as u64;
            ctx.gpr[1..6].copy_from_slice(&frame.args[1..6]);
            ctx.gpr[8] = frame.nr;
            ctx.gpr[19..31].copy_from_slice(&frame.preserved);
            ctx.elr = frame.ip;
            ctx.spsr = frame.flags;
            ctx.sp = frame.sp;
        }
        SyscallOutcome::Exit(status) => crate::arch::program_exit(status),
    }
}

fn fatal(ctx: &ExceptionContext, kind: u64) -> ! {
    // The interrupted code may have held the console.
    unsafe { crate::arch::console::CONSOLE.force_unlock() };

    let name = KIND_NAMES[(kind & 3) as usize];
    let origin = ORIGIN_NAMES[((kind >> 2) & 3) as usize];
    serial_println!("!!! CPU EXCEPTION: {} from {} !!!", name, origin);
    serial_println!("  ESR:  {:#x} (EC {:#x})", ctx.esr, (ctx.esr >> 26) & 0x3f);
    match symbols::resolve(ctx.elr) {
        Some(sym) => serial_println!("  ELR:  {:#x} <{}>", ctx.elr, sym),
        None => serial_println!("  ELR:  {:#x}", ctx.elr),
    }
    serial_println!("  FAR:  {:#x}", ctx.far);
    serial_println!("  SPSR: {:#x}", ctx.spsr);
    serial_println!("  SP:   {:#x}", ctx.sp);
    for (i, pair) in ctx.gpr.chunks(2).enumerate() {
        match pair {
            [a, b] => serial_println!("  x{:<2} {:#018x}  x{:<2} {:#018x}", 2 * i, a, 2 * i + 1, b),
            [a] => serial_println!("  x{:<2} {:#018x}", 2 * i, a),
            _ => {}
        }
    }
    super::halt()
}

global_asm!(
    r#"
.macro VECTOR kind
    .balign 128
    sub sp, sp, #288
    stp x0, x1, [sp, #0]
    mov x0, #\kind
    b ember_exception_common
.endm

.section .text.vectors, "ax"
.balign 2048
.global ember_vectors
ember_vectors:
    VECTOR 0
    VECTOR 1
    VECTOR 2
    VECTOR 3
    VECTOR 4
    VECTOR 5
    VECTOR 6
    VECTOR 7
    VECTOR 8
    VECTOR 9
    VECTOR 10
    VECTOR 11
    VECTOR 12
    VECTOR 13
    VECTOR 14
    VECTOR 15

.section .text
ember_exception_common:
    mov x1, x0
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    stp x8, x9, [sp, #64]
    stp x10, x11, [sp, #80]
    stp x12, x13, [sp, #96]
    stp x14, x15, [sp, #112]
    stp x16, x17, [sp, #128]
    stp x18, x19, [sp, #144]
    stp x20, x21, [sp, #160]
    stp x22, x23, [sp, #176]
    stp x24, x25, [sp, #192]
    stp x26, x27, [sp, #208]
    stp x28, x29, [sp, #224]
    str x30, [sp, #240]
    add x2, sp, #288
    mrs x3, elr_el1
    stp x2, x3, [sp, #248]
    mrs x2, spsr_el1
    mrs x3, esr_el1
    stp x2, x3, [sp, #264]
    mrs x2, far_el1
    str x2, [sp, #280]

    mov x0, sp
    bl ember_exception

    ldp x0, x1, [sp, #256]
    msr elr_el1, x0
    msr spsr_el1, x1
    ldp x2, x3, [sp, #16]
    ldp x4, x5, [sp, #32]
    ldp x6, x7, [sp, #48]
    ldp x8, x9, [sp, #64]
    ldp x10, x11, [sp, #80]
    ldp x12, x13, [sp, #96]
    ldp x14, x15, [sp, #112]
    ldp x16, x17, [sp, #128]
    ldp x18, x19, [sp, #144]
    ldp x20, x21, [sp, #160]
    ldp x22, x23, [sp, #176]
    ldp x24, x25, [sp, #192]
    ldp x26, x27, [sp, #208]
    ldp x28, x29, [sp, #224]
    ldr x30, [sp, #240]
    ldr x0, [sp, #248]
    mov x1, sp
    mov sp, x0
    ldp x0, x1, [x1, #0]
    eret
"#
);
