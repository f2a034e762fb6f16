/// Entry on QEMU virt.
///
/// QEMU enters `_start` at EL1 with the MMU off and, when it passes one,
/// the device tree address in x0. Secondary cores park. The boot core
/// takes the boot stack (its own NOLOAD section, outside `.bss`), enables
/// FP/SIMD so the application may use it, and calls
/// `kernel_start(0, dtb)`.
use core::arch::global_asm;

global_asm!(
    r#"
.set BOOT_STACK_SIZE, 0x10000

.section .boot_stack, "aw", @nobits
.balign 16
boot_stack_bottom:
    .skip BOOT_STACK_SIZE
boot_stack_top:

.section .text.boot, "ax"
.global _start
_start:
    mrs x1, mpidr_el1
    and x1, x1, #0xff
    cbnz x1, 2f

    adrp x1, boot_stack_top
    add x1, x1, :lo12:boot_stack_top
    mov sp, x1

    /* CPACR_EL1.FPEN = 0b11 */
    mov x1, #(3 << 20)
    msr cpacr_el1, x1
    isb

    mov x1, x0
    mov x0, #0
    mov x29, #0
    bl kernel_start

2:
    wfe
    b 2b
"#
);
