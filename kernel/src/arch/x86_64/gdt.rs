/// Runtime GDT and TSS.
///
/// The trampoline's boot GDT only has code and data descriptors. This one
/// replaces it at ENABLE_INTERRUPTS and adds a TSS whose IST1 stack the
/// double-fault handler runs on, so a blown stack reports instead of
/// triple faulting. The application runs in ring 0 as well; there are no
/// user segments.
use core::cell::UnsafeCell;
use core::mem::size_of;

/// Kernel code segment selector. The boot GDT uses the same layout.
pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const TSS_SEL: u16 = 0x18;

/// IST slot used for double faults (1-based, as the IDT encodes it).
pub const DOUBLE_FAULT_IST: u8 = 1;

const DOUBLE_FAULT_STACK_SIZE: usize = 16 * 1024;

/// Access byte bits.
const PRESENT: u64 = 1 << 7;
const NON_SYSTEM: u64 = 1 << 4;
const EXECUTABLE: u64 = 1 << 3;
const READ_WRITE: u64 = 1 << 1;
/// System descriptor type: available 64-bit TSS.
const TSS_AVAILABLE: u64 = 0x9;
/// Flags nibble: 64-bit code segment.
const LONG_MODE: u64 = 1 << 1;

/// Build a flat segment descriptor from its access byte and flags nibble.
/// Base and limit are ignored in long mode.
const fn segment(access: u64, flags: u64) -> u64 {
    (access << 40) | (flags << 52)
}

/// The two descriptor words of a 64-bit TSS at `base`.
fn tss_descriptor(base: u64) -> [u64; 2] {
    let limit = (size_of::<Tss>() - 1) as u64;
    let low = (limit & 0xFFFF)
        | ((base & 0x00FF_FFFF) << 16)
        | ((PRESENT | TSS_AVAILABLE) << 40)
        | (((limit >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56);
    [low, base >> 32]
}

/// Long mode TSS. Only the IST slots are used.
#[repr(C, packed(4))]
struct Tss {
    _reserved0: u32,
    rsp: [u64; 3],
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    iopb_offset: u16,
}

static_assertions::const_assert_eq!(size_of::<Tss>(), 104);

#[repr(C, align(16))]
struct Tables {
    /// null, code, data, TSS (two slots)
    gdt: [u64; 5],
    tss: Tss,
    double_fault_stack: [u8; DOUBLE_FAULT_STACK_SIZE],
}

/// Written once during single-threaded boot, then only read by the CPU.
struct BootCell(UnsafeCell<Tables>);

unsafe impl Sync for BootCell {}

static TABLES: BootCell = BootCell(UnsafeCell::new(Tables {
    gdt: [
        0,
        segment(PRESENT | NON_SYSTEM | EXECUTABLE | READ_WRITE, LONG_MODE),
        segment(PRESENT | NON_SYSTEM | READ_WRITE, 0),
        0,
        0,
    ],
    tss: Tss {
        _reserved0: 0,
        rsp: [0; 3],
        _reserved1: 0,
        ist: [0; 7],
        _reserved2: 0,
        _reserved3: 0,
        iopb_offset: size_of::<Tss>() as u16,
    },
    double_fault_stack: [0; DOUBLE_FAULT_STACK_SIZE],
}));

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u64,
}

/// Load the GDT, reload CS/DS/ES/SS and the task register.
///
/// FS and GS are left alone: their bases may already hold the
/// application's TLS.
///
/// # Safety
/// Called once, after `.bss` is zeroed and before the IDT is loaded.
pub unsafe fn init() {
    let tables = unsafe { &mut *TABLES.0.get() };

    let stack_top = tables.double_fault_stack.as_ptr() as u64 + DOUBLE_FAULT_STACK_SIZE as u64;
    let mut ist = tables.tss.ist;
    ist[(DOUBLE_FAULT_IST - 1) as usize] = stack_top;
    tables.tss.ist = ist;

    let tss = tss_descriptor(core::ptr::addr_of!(tables.tss) as u64);
    tables.gdt[3..5].copy_from_slice(&tss);

    let gdtr = DescriptorPointer {
        limit: (size_of::<[u64; 5]>() - 1) as u16,
        base: tables.gdt.as_ptr() as u64,
    };

    unsafe {
        core::arch::asm!(
            "lgdt [{gdtr}]",
            "push {cs}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov ss, {ds:x}",
            "ltr {tss:x}",
            gdtr = in(reg) &gdtr,
            cs = in(reg) KERNEL_CS as u64,
            ds = in(reg) KERNEL_DS,
            tss = in(reg) TSS_SEL,
            tmp = lateout(reg) _,
            options(preserves_flags),
        );
    }
}
