/// Interrupt Descriptor Table (IDT) with exception handlers.
///
/// Every CPU exception is fatal: the handler prints the vector, the
/// interrupted frame and the function containing RIP (when the symbol
/// table was relocated), then halts.
/// - #DE (0), #DB (1), #NMI (2), #BP (3), #OF (4), #BR (5), #UD (6), #NM (7)
/// - #DF (8) on the IST1 stack
/// - #GP (13), #PF (14) with their error codes
/// - #MF (16), #AC (17), #XM (19)
///
/// PIC vectors 32-47 get a stub that acknowledges and returns.
use bitflags::bitflags;

use super::gdt;
use crate::boot::symbols;
use crate::serial_println;

/// Gate descriptor, 16 bytes in long mode.
#[repr(C)]
#[derive(Clone, Copy)]
struct Gate {
    offset_low: u16,
    selector: u16,
    /// IST slot in the low three bits, 0 = current stack.
    ist: u8,
    /// present | DPL 0 | 64-bit interrupt gate = 0x8E; 0 = not present.
    kind: u8,
    offset_mid: u16,
    offset_high: u32,
    _zero: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<Gate>(), 16);

const GATE_INTERRUPT: u8 = 0x8E;

impl Gate {
    const ABSENT: Gate = Gate {
        offset_low: 0,
        selector: 0,
        ist: 0,
        kind: 0,
        offset_mid: 0,
        offset_high: 0,
        _zero: 0,
    };

    fn interrupt(handler: usize, ist: u8) -> Self {
        let addr = handler as u64;
        Gate {
            offset_low: addr as u16,
            selector: gdt::KERNEL_CS,
            ist: ist & 0x7,
            kind: GATE_INTERRUPT,
            offset_mid: (addr >> 16) as u16,
            offset_high: (addr >> 32) as u32,
            _zero: 0,
        }
    }
}

#[repr(C, align(16))]
struct Idt([Gate; 256]);

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

bitflags! {
    /// #PF error code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultError: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED_BIT = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
        const PROTECTION_KEY = 1 << 5;
        const SHADOW_STACK = 1 << 6;
    }
}

static IDT: spin::Once<Idt> = spin::Once::new();

/// Fill and load the IDT.
///
/// # Safety
/// After `gdt::init`, since the double-fault gate uses its IST slot. Called once.
pub unsafe fn init() {
    let idt = IDT.call_once(|| {
        let mut gates = [Gate::ABSENT; 256];
        let plain: [(usize, usize); 13] = [
            (0, isr_de as usize),
            (1, isr_db as usize),
            (2, isr_nmi as usize),
            (3, isr_bp as usize),
            (4, isr_of as usize),
            (5, isr_br as usize),
            (6, isr_ud as usize),
            (7, isr_nm as usize),
            (13, isr_gp as usize),
            (14, isr_pf as usize),
            (16, isr_mf as usize),
            (17, isr_ac as usize),
            (19, isr_xm as usize),
        ];
        for (vector, handler) in plain {
            gates[vector] = Gate::interrupt(handler, 0);
        }
        gates[8] = Gate::interrupt(isr_df as usize, gdt::DOUBLE_FAULT_IST);

        let irq = super::pic::IRQ_BASE as usize;
        for gate in &mut gates[irq..irq + 16] {
            *gate = Gate::interrupt(isr_irq_stub as usize, 0);
        }
        Idt(gates)
    });

    let idtr = IdtPointer {
        limit: (core::mem::size_of::<Idt>() - 1) as u16,
        base: idt as *const Idt as u64,
    };
    unsafe { core::arch::asm!("lidt [{}]", in(reg) &idtr, options(readonly, nostack, preserves_flags)) };
}

/// Interrupt stack frame pushed by the CPU before our handler runs.
#[repr(C)]
pub struct InterruptFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

// ---- Exception handlers ----

extern "x86-interrupt" fn isr_de(frame: InterruptFrame) {
    fatal("Division by zero (#DE)", &frame, None);
}

extern "x86-interrupt" fn isr_db(frame: InterruptFrame) {
    fatal("Debug (#DB)", &frame, None);
}

extern "x86-interrupt" fn isr_nmi(frame: InterruptFrame) {
    fatal("Non-maskable interrupt (#NMI)", &frame, None);
}

extern "x86-interrupt" fn isr_bp(frame: InterruptFrame) {
    fatal("Breakpoint (#BP)", &frame, None);
}

extern "x86-interrupt" fn isr_of(frame: InterruptFrame) {
    fatal("Overflow (#OF)", &frame, None);
}

extern "x86-interrupt" fn isr_br(frame: InterruptFrame) {
    fatal("Bound range exceeded (#BR)", &frame, None);
}

extern "x86-interrupt" fn isr_ud(frame: InterruptFrame) {
    fatal("Invalid opcode (#UD)", &frame, None);
}

extern "x86-interrupt" fn isr_nm(frame: InterruptFrame) {
    fatal("Device not available (#NM)", &frame, None);
}

extern "x86-interrupt" fn isr_df(frame: InterruptFrame, error_code: u64) -> ! {
    fatal("Double fault (#DF)", &frame, Some(error_code));
}

extern "x86-interrupt" fn isr_gp(frame: InterruptFrame, error_code: u64) {
    fatal("General protection fault (#GP)", &frame, Some(error_code));
}

extern "x86-interrupt" fn isr_pf(frame: InterruptFrame, error_code: u64) {
    let cr2: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nostack, nomem));
        crate::arch::console::CONSOLE.force_unlock();
    }
    serial_println!("  Address: {:#x} ({:?})", cr2, PageFaultError::from_bits_truncate(error_code));
    fatal("Page fault (#PF)", &frame, Some(error_code));
}

extern "x86-interrupt" fn isr_mf(frame: InterruptFrame) {
    fatal("x87 floating point (#MF)", &frame, None);
}

extern "x86-interrupt" fn isr_ac(frame: InterruptFrame, error_code: u64) {
    fatal("Alignment check (#AC)", &frame, Some(error_code));
}

extern "x86-interrupt" fn isr_xm(frame: InterruptFrame) {
    fatal("SIMD floating point (#XM)", &frame, None);
}

extern "x86-interrupt" fn isr_irq_stub(_frame: InterruptFrame) {
    super::pic::send_eoi_both();
}

fn fatal(name: &str, frame: &InterruptFrame, error_code: Option<u64>) -> ! {
    // The faulting code may have held the console.
    unsafe { crate::arch::console::CONSOLE.force_unlock() };

    serial_println!("!!! CPU EXCEPTION: {} !!!", name);
    if let Some(code) = error_code {
        serial_println!("  Error code: {:#x}", code);
    }
    match symbols::resolve(frame.rip) {
        Some(sym) => serial_println!("  RIP:     {:#x} <{}>", frame.rip, sym),
        None => serial_println!("  RIP:     {:#x}", frame.rip),
    }
    serial_println!("  CS:      {:#x}", frame.cs);
    serial_println!("  RFLAGS:  {:#x}", frame.rflags);
    serial_println!("  RSP:     {:#x}", frame.rsp);
    serial_println!("  SS:      {:#x}", frame.ss);
    super::halt()
}
