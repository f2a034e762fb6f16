/// 8259 PIC: remap and mask.
///
/// The legacy PIC maps IRQ 0-7 to vectors 8-15, on top of CPU exceptions.
/// IRQs are remapped to 32-47 and all of them masked: no driver in this
/// kernel takes interrupts, and a stray one must not look like a fault.

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x11; // initialization + ICW4 needed
const ICW4_8086: u8 = 0x01;

const EOI: u8 = 0x20;

/// First vector of the master PIC after remapping.
pub const IRQ_BASE: u8 = 32;

/// Remap both PICs to [`IRQ_BASE`] and mask every line.
///
/// # Safety
/// Early boot, interrupts disabled.
pub unsafe fn init() {
    use super::outb;

    outb(PIC1_CMD, ICW1_INIT);
    io_wait();
    outb(PIC2_CMD, ICW1_INIT);
    io_wait();

    outb(PIC1_DATA, IRQ_BASE); // IRQ 0-7  -> 32-39
    io_wait();
    outb(PIC2_DATA, IRQ_BASE + 8); // IRQ 8-15 -> 40-47
    io_wait();

    outb(PIC1_DATA, 4); // slave on IRQ2
    io_wait();
    outb(PIC2_DATA, 2); // cascade identity
    io_wait();

    outb(PIC1_DATA, ICW4_8086);
    io_wait();
    outb(PIC2_DATA, ICW4_8086);
    io_wait();

    outb(PIC1_DATA, 0xFF);
    outb(PIC2_DATA, 0xFF);
}

/// Send End-of-Interrupt to both PICs.
pub fn send_eoi_both() {
    super::outb(PIC2_CMD, EOI);
    super::outb(PIC1_CMD, EOI);
}

/// Port 0x80 write as an I/O delay.
fn io_wait() {
    super::outb(0x80, 0);
}
