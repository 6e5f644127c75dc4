//! 8259A programmable interrupt controller pair.
//!
//! IRQ0-7 are remapped to vectors 0x20-0x27 on the master, IRQ8-15 to
//! 0x28-0x2F on the slave. After init only the timer line and the cascade
//! are unmasked; drivers open their own line when they register a handler.

use super::port::Port;

const PIC_M_CTRL: u16 = 0x20;
const PIC_M_DATA: u16 = 0x21;
const PIC_S_CTRL: u16 = 0xa0;
const PIC_S_DATA: u16 = 0xa1;

/// ICW1: edge-triggered, cascaded, ICW4 follows.
const ICW1_INIT: u8 = 0x11;
/// ICW4: 8086 mode, normal EOI.
const ICW4_8086: u8 = 0x01;
/// OCW2 end-of-interrupt command.
const OCW2_EOI: u8 = 0x20;

/// Vector the master PIC's IRQ0 is remapped to.
pub const IRQ_BASE_VECTOR: u8 = 0x20;
/// Vector of the slave PIC's first line (IRQ8).
pub const IRQ_SLAVE_VECTOR: u8 = 0x28;
/// One past the last PIC vector (IRQ15).
pub const IRQ_LIMIT_VECTOR: u8 = 0x30;

/// Program both chips and mask everything except IRQ0 and the cascade.
pub fn init() {
    let mut m_ctrl = Port::<u8>::new(PIC_M_CTRL);
    let mut m_data = Port::<u8>::new(PIC_M_DATA);
    let mut s_ctrl = Port::<u8>::new(PIC_S_CTRL);
    let mut s_data = Port::<u8>::new(PIC_S_DATA);

    // SAFETY: the ICW sequence below is the documented 8259A init
    // protocol; interrupts are still disabled during boot.
    unsafe {
        m_ctrl.write(ICW1_INIT);
        m_data.write(IRQ_BASE_VECTOR); // ICW2: IRQ0-7 -> 0x20-0x27
        m_data.write(0x04); // ICW3: slave on IR2
        m_data.write(ICW4_8086);

        s_ctrl.write(ICW1_INIT);
        s_data.write(IRQ_SLAVE_VECTOR); // ICW2: IRQ8-15 -> 0x28-0x2F
        s_data.write(0x02); // ICW3: cascade identity
        s_data.write(ICW4_8086);

        // Unmask IRQ0 (timer) and IRQ2 (cascade) only.
        m_data.write(0xfa);
        s_data.write(0xff);
    }
}

/// Unmask the PIC line feeding `vector` (0x20..0x30).
pub fn enable_line(vector: u8) {
    debug_assert!((IRQ_BASE_VECTOR..IRQ_LIMIT_VECTOR).contains(&vector));
    let irq = vector - IRQ_BASE_VECTOR;
    if irq < 8 {
        let mut data = Port::<u8>::new(PIC_M_DATA);
        // SAFETY: read-modify-write of the master mask register.
        unsafe {
            let mask = data.read();
            data.write(mask & !(1 << irq));
        }
    } else {
        let mut data = Port::<u8>::new(PIC_S_DATA);
        // SAFETY: read-modify-write of the slave mask register.
        unsafe {
            let mask = data.read();
            data.write(mask & !(1 << (irq - 8)));
        }
    }
}

/// Signal end-of-interrupt for `vector`.
///
/// Sent before the handler body runs so that a handler which switches
/// tasks (the timer tick) does not leave the controller waiting forever.
pub fn end_of_interrupt(vector: u8) {
    debug_assert!((IRQ_BASE_VECTOR..IRQ_LIMIT_VECTOR).contains(&vector));
    // SAFETY: OCW2 EOI writes; slave first on cascaded lines.
    unsafe {
        if vector >= IRQ_SLAVE_VECTOR {
            Port::<u8>::new(PIC_S_CTRL).write(OCW2_EOI);
        }
        Port::<u8>::new(PIC_M_CTRL).write(OCW2_EOI);
    }
}
