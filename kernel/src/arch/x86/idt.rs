//! Interrupt descriptor table and the vector stubs.
//!
//! Every vector gets a tiny asm stub that normalizes the stack (pushing a
//! zero where the CPU supplies no error code), records its vector number,
//! and funnels into one common trampoline. The trampoline saves the full
//! register file, switches to kernel data segments, and calls into the
//! vector-dispatch table in [`crate::irq`].

use core::arch::{asm, global_asm};

use lazy_static::lazy_static;

use super::pic;
use crate::irq::{self, IDT_ENTRIES};

/// A 32-bit interrupt gate.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    reserved: u8,
    attr: u8,
    offset_high: u16,
}

/// Present, DPL 0, 32-bit interrupt gate.
const GATE_ATTR_INTR_DPL0: u8 = 0x8e;

impl GateDescriptor {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            reserved: 0,
            attr: 0,
            offset_high: 0,
        }
    }

    fn interrupt_gate(selector: u16, handler: usize) -> Self {
        Self {
            offset_low: (handler & 0xffff) as u16,
            selector,
            reserved: 0,
            attr: GATE_ATTR_INTR_DPL0,
            offset_high: (handler >> 16) as u16,
        }
    }
}

/// Operand for `lidt`: 16-bit limit + 32-bit base.
#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

// Vector stubs. CPU exceptions 8, 10-14 and 17 push an error code; every
// other vector gets a zero pushed so the frame layout is uniform. The
// common trampoline leaves the vector number at [esp + 48] after its
// pushes (8 GP registers + 4 segment registers).
global_asm!(
    r#"
.macro isr num, has_err
    .text
isr_stub_\num:
    .if \has_err == 0
    push 0
    .endif
    push \num
    jmp isr_common
    .pushsection .rodata.isr_table, "a"
    .long isr_stub_\num
    .popsection
.endm

    .pushsection .rodata.isr_table, "a"
    .globl ISR_ENTRY_TABLE
ISR_ENTRY_TABLE:
    .popsection

    isr 0, 0
    isr 1, 0
    isr 2, 0
    isr 3, 0
    isr 4, 0
    isr 5, 0
    isr 6, 0
    isr 7, 0
    isr 8, 1
    isr 9, 0
    isr 10, 1
    isr 11, 1
    isr 12, 1
    isr 13, 1
    isr 14, 1
    isr 15, 0
    isr 16, 0
    isr 17, 1
    isr 18, 0
    isr 19, 0
    isr 20, 0
    isr 21, 0
    isr 22, 0
    isr 23, 0
    isr 24, 0
    isr 25, 0
    isr 26, 0
    isr 27, 0
    isr 28, 0
    isr 29, 0
    isr 30, 0
    isr 31, 0
    isr 32, 0
    isr 33, 0
    isr 34, 0
    isr 35, 0
    isr 36, 0
    isr 37, 0
    isr 38, 0
    isr 39, 0
    isr 40, 0
    isr 41, 0
    isr 42, 0
    isr 43, 0
    isr 44, 0
    isr 45, 0
    isr 46, 0
    isr 47, 0

    .text
isr_common:
    pushad
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov eax, [esp + 48]
    push eax
    call isr_dispatch
    add esp, 4
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd
"#
);

extern "C" {
    /// Stub entry addresses, one per vector, emitted by the asm above.
    static ISR_ENTRY_TABLE: [usize; IDT_ENTRIES];
}

/// C-ABI landing point for the common trampoline.
///
/// EOI goes out before the handler body: the timer handler may call
/// `schedule()` and not return to this frame for a long time, and the PIC
/// must not spend that time refusing further interrupts.
#[no_mangle]
extern "C" fn isr_dispatch(vector: u32) {
    let vector = vector as u8;
    if (pic::IRQ_BASE_VECTOR..pic::IRQ_LIMIT_VECTOR).contains(&vector) {
        pic::end_of_interrupt(vector);
    }
    irq::dispatch(vector);
}

lazy_static! {
    static ref IDT: [GateDescriptor; IDT_ENTRIES] = {
        let mut idt = [GateDescriptor::missing(); IDT_ENTRIES];
        for (vector, gate) in idt.iter_mut().enumerate() {
            // SAFETY: the asm block above defines exactly IDT_ENTRIES
            // table slots, each holding a stub address.
            let handler = unsafe { ISR_ENTRY_TABLE[vector] };
            *gate = GateDescriptor::interrupt_gate(super::SELECTOR_K_CODE, handler);
        }
        idt
    };
}

/// Build the IDT, load it, and program the PIC.
pub fn init() {
    let operand = DescriptorTablePointer {
        limit: (core::mem::size_of_val(&*IDT) - 1) as u16,
        base: IDT.as_ptr() as u32,
    };
    // SAFETY: the IDT is a static with 'static lifetime and every present
    // gate points at a stub from the table above.
    unsafe {
        asm!(
            "lidt [{}]",
            in(reg) &operand as *const DescriptorTablePointer,
            options(readonly, nostack, preserves_flags)
        )
    };

    pic::init();
}
