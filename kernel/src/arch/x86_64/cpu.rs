/// CPU feature checks run at SANITY_CHECK.

/// CPUID with subleaf 0, as (eax, ebx, ecx, edx).
pub fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, 0) };
    (r.eax, r.ebx, r.ecx, r.edx)
}

/// Highest extended leaf, or 0 if there are none.
fn max_extended_leaf() -> u32 {
    let (eax, _, _, _) = cpuid(0x8000_0000);
    if eax >= 0x8000_0001 { eax } else { 0 }
}

fn extended_edx_bit(bit: u32) -> bool {
    if max_extended_leaf() == 0 {
        return false;
    }
    let (_, _, _, edx) = cpuid(0x8000_0001);
    edx & (1 << bit) != 0
}

/// CPUID.80000001H:EDX.LM[bit 29].
pub fn has_long_mode() -> bool {
    extended_edx_bit(29)
}

/// CPUID.80000001H:EDX.SYSCALL[bit 11].
pub fn has_syscall() -> bool {
    extended_edx_bit(11)
}

/// CPUID.01H:EDX.SSE2[bit 26].
pub fn has_sse2() -> bool {
    let (_, _, _, edx) = cpuid(1);
    edx & (1 << 26) != 0
}

/// CPUID.01H:EDX.FXSR[bit 24].
pub fn has_fxsr() -> bool {
    let (_, _, _, edx) = cpuid(1);
    edx & (1 << 24) != 0
}
