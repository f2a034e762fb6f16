/// Boot console on COM1 (0x3F8), output only.
///
/// Usable before `.bss` is zeroed: the port number keeps `CONSOLE` in
/// `.data`, and a zeroed lock is an unlocked one.
use core::fmt;
use spin::Mutex;

const COM1: u16 = 0x3F8;

/// Line status: transmit holding register empty.
const LSR_THRE: u8 = 0x20;

pub static CONSOLE: Mutex<Serial> = Mutex::new(Serial::new(COM1));

pub struct Serial {
    port: u16,
}

impl Serial {
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// 8N1 at 115200 baud, FIFOs on, interrupts off.
    pub fn init(&self) {
        super::outb(self.port + 1, 0x00); // Disable interrupts
        super::outb(self.port + 3, 0x80); // DLAB on
        super::outb(self.port, 0x01); // Divisor 1, low byte
        super::outb(self.port + 1, 0x00); // Divisor 1, high byte
        super::outb(self.port + 3, 0x03); // 8 bits, no parity, one stop bit
        super::outb(self.port + 2, 0xC7); // FIFO on, cleared, 14-byte threshold
        super::outb(self.port + 4, 0x03); // DTR/RTS
    }

    fn is_transmit_empty(&self) -> bool {
        super::inb(self.port + 5) & LSR_THRE != 0
    }

    pub fn write_byte(&self, byte: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        super::outb(self.port, byte);
    }
}

impl fmt::Write for Serial {
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
