/// Multiboot entry.
///
/// The loader enters `_start32` in 32-bit protected mode, paging off, with
/// the boot magic in EAX and the info pointer in EBX. The trampoline:
///
/// 1. stashes EAX/EBX at the top of the boot stack
/// 2. identity maps the first 4 GiB with 2 MiB pages
/// 3. turns on PAE, SSE (OSFXSR/OSXMMEXCPT), EFER.LME and paging
/// 4. far jumps into 64-bit code through a minimal GDT
/// 5. calls `kernel_start(magic, addr)`, which never returns
///
/// The boot stack and page tables live in their own NOLOAD sections, not
/// in `.bss`, because they are in use before ZERO_BSS runs.
///
/// The header uses the a.out kludge (flag 16) so loaders that only speak
/// ELF32 still load this ELF64 image at its link address.
use core::arch::global_asm;

global_asm!(
    r#"
.set MB_MAGIC, 0x1BADB002
.set MB_FLAGS, 0x00010003
.set BOOT_STACK_SIZE, 0x10000

.section .multiboot, "a"
.balign 4
multiboot_header:
    .long MB_MAGIC
    .long MB_FLAGS
    .long -(MB_MAGIC + MB_FLAGS)
    .long multiboot_header
    .long __image_start
    .long __load_end
    .long _end
    .long _start32

.section .boot_tables, "aw", @nobits
.balign 4096
boot_pml4:
    .skip 4096
boot_pdpt:
    .skip 4096
boot_pd:
    .skip 4096 * 4

.section .boot_stack, "aw", @nobits
.balign 16
boot_stack_bottom:
    .skip BOOT_STACK_SIZE
boot_stack_top:

.section .rodata.boot, "a"
.balign 16
boot_gdt:
    .quad 0
    .quad 0x00209A0000000000
    .quad 0x0000920000000000
boot_gdt_ptr:
    .word boot_gdt_ptr - boot_gdt - 1
    .long boot_gdt

.section .text.boot, "ax"
.code32
.global _start32
_start32:
    cli
    cld
    movl $boot_stack_top, %esp
    movl %eax, -8(%esp)
    movl %ebx, -4(%esp)

    /* zero PML4, PDPT and four PDs */
    movl $boot_pml4, %edi
    movl $(6 * 4096 / 4), %ecx
    xorl %eax, %eax
    rep stosl

    movl $boot_pdpt, %eax
    orl $0x3, %eax
    movl %eax, boot_pml4

    movl $boot_pd, %eax
    orl $0x3, %eax
    movl $boot_pdpt, %edi
    movl $4, %ecx
1:
    movl %eax, (%edi)
    addl $4096, %eax
    addl $8, %edi
    loop 1b

    /* 2048 x 2 MiB: present, writable, huge */
    movl $boot_pd, %edi
    movl $0x83, %eax
    movl $2048, %ecx
2:
    movl %eax, (%edi)
    addl $0x200000, %eax
    addl $8, %edi
    loop 2b

    movl $boot_pml4, %eax
    movl %eax, %cr3

    /* CR4: PAE | OSFXSR | OSXMMEXCPT */
    movl %cr4, %eax
    orl $((1 << 5) | (1 << 9) | (1 << 10)), %eax
    movl %eax, %cr4

    /* EFER.LME */
    movl $0xC0000080, %ecx
    rdmsr
    orl $(1 << 8), %eax
    wrmsr

    /* CR0: PG | MP | PE, clear EM */
    movl %cr0, %eax
    andl $~(1 << 2), %eax
    orl $((1 << 31) | (1 << 1) | (1 << 0)), %eax
    movl %eax, %cr0

    lgdt boot_gdt_ptr
    ljmp $0x08, $start64

.code64
start64:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movw %ax, %fs
    movw %ax, %gs

    movq $boot_stack_top, %rsp
    movl -8(%rsp), %edi
    movl -4(%rsp), %esi
    subq $16, %rsp
    xorl %ebp, %ebp
    call kernel_start

3:
    cli
    hlt
    jmp 3b
"#,
    options(att_syntax)
);
