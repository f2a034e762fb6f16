/// Boot console on the QEMU virt PL011 (0x0900_0000), output only.
///
/// QEMU leaves the UART enabled at reset, so there is nothing to program
/// before writing.
use core::fmt;
use spin::Mutex;

const PL011_BASE: usize = 0x0900_0000;

/// Data register offset.
const DR: usize = 0x00;
/// Flag register offset.
const FR: usize = 0x18;
/// Flag: transmit FIFO full.
const FR_TXFF: u32 = 1 << 5;

pub static CONSOLE: Mutex<Pl011> = Mutex::new(Pl011::new(PL011_BASE));

pub struct Pl011 {
    base: usize,
}

impl Pl011 {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// The PL011 is already enabled at reset.
    pub fn init(&self) {}

    pub fn write_byte(&self, byte: u8) {
        let fr = (self.base + FR) as *const u32;
        let dr = (self.base + DR) as *mut u32;
        unsafe {
            while fr.read_volatile() & FR_TXFF != 0 {
                core::hint::spin_loop();
            }
            dr.write_volatile(byte as u32);
        }
    }
}

impl fmt::Write for Pl011 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}
