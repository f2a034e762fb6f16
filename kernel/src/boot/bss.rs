/// `.bss` zeroing.
///
/// Loaders that enter us through multiboot or a raw `-kernel` image do not
/// all clear `.bss`, so it is zeroed explicitly before any static is read.
/// The boot stack lives in its own section outside `.bss`.
use crate::mem::MemoryRegion;

/// Zero every byte of `region`.
///
/// # Safety
/// `region` must be writable memory that nothing live (stack, relocated
/// symbols, firmware data still needed) occupies.
pub unsafe fn zero_region(region: MemoryRegion) {
    if region.is_empty() {
        return;
    }
    unsafe { core::ptr::write_bytes(region.begin as *mut u8, 0, region.size()) };
}

#[cfg(target_os = "none")]
extern "C" {
    static __image_start: u8;
    static __bss_start: u8;
    static __bss_end: u8;
    static _end: u8;
}

/// `.bss` as laid out by the linker script.
#[cfg(target_os = "none")]
pub fn bss_region() -> MemoryRegion {
    let begin = unsafe { core::ptr::addr_of!(__bss_start) } as usize;
    let end = unsafe { core::ptr::addr_of!(__bss_end) } as usize;
    MemoryRegion::new(begin, end)
}

/// The loaded image, `.bss` and boot stack included.
#[cfg(target_os = "none")]
pub fn image_region() -> MemoryRegion {
    let begin = unsafe { core::ptr::addr_of!(__image_start) } as usize;
    MemoryRegion::new(begin, image_end())
}

/// First byte past the loaded image.
#[cfg(target_os = "none")]
pub fn image_end() -> usize {
    unsafe { core::ptr::addr_of!(_end) as usize }
}

/// Zero `.bss`.
///
/// # Safety
/// Runs once, before anything reads a static that lives in `.bss`.
#[cfg(target_os = "none")]
pub unsafe fn zero_bss() {
    unsafe { zero_region(bss_region()) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroes_exactly_the_region() {
        let mut buf = [0xAAu8; 64];
        let base = buf.as_mut_ptr() as usize;
        unsafe { zero_region(MemoryRegion::new(base + 8, base + 40)) };
        assert!(buf[..8].iter().all(|&b| b == 0xAA));
        assert!(buf[8..40].iter().all(|&b| b == 0));
        assert!(buf[40..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn empty_region_is_untouched() {
        let mut buf = [0x55u8; 16];
        let base = buf.as_mut_ptr() as usize;
        unsafe { zero_region(MemoryRegion::new(base + 4, base + 4)) };
        assert!(buf.iter().all(|&b| b == 0x55));
    }
}
