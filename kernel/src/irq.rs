//! Vectored interrupt dispatch.
//!
//! The architecture layer funnels every vector into [`dispatch`], which
//! indexes a flat handler table. Drivers install their handler with
//! [`register_handler`]; unclaimed vectors fall through to a default
//! handler that names the exception (or stays silent for the two spurious
//! PIC lines).

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::interrupts;
use crate::error::{KernelError, KernelResult};

/// Number of IDT slots: CPU exceptions 0x00-0x1F plus both PIC banks
/// 0x20-0x2F.
pub const IDT_ENTRIES: usize = 48;

/// Vector of the PIT tick (IRQ0).
pub const VECTOR_TIMER: u8 = 0x20;
/// Vector of the primary ATA channel (IRQ14).
pub const VECTOR_IDE0: u8 = 0x2e;
/// Vector of the secondary ATA channel (IRQ15).
pub const VECTOR_IDE1: u8 = 0x2f;

/// Spurious lines of the master/slave 8259A.
const VECTOR_SPURIOUS_MASTER: u8 = 0x27;
const VECTOR_SPURIOUS_SLAVE: u8 = 0x2f;

/// An interrupt handler; receives the vector that fired.
pub type InterruptHandler = fn(u8);

struct VectorTable(UnsafeCell<[InterruptHandler; IDT_ENTRIES]>);

// SAFETY: the table is written only via `register_handler`, which masks
// interrupts for the store; reads happen on the same single CPU.
unsafe impl Sync for VectorTable {}

static HANDLERS: VectorTable = VectorTable(UnsafeCell::new([default_handler; IDT_ENTRIES]));

/// Total interrupts dispatched (diagnostics).
static DISPATCH_COUNT: AtomicU64 = AtomicU64::new(0);
/// Spurious IRQ7/IRQ15 arrivals that were dropped.
static SPURIOUS_COUNT: AtomicU64 = AtomicU64::new(0);

/// Exception mnemonics for vectors 0-19, for the default handler's
/// diagnostics.
const EXCEPTION_NAMES: [&str; 20] = [
    "#DE Divide Error",
    "#DB Debug Exception",
    "NMI Interrupt",
    "#BP Breakpoint Exception",
    "#OF Overflow Exception",
    "#BR BOUND Range Exceeded Exception",
    "#UD Invalid Opcode Exception",
    "#NM Device Not Available Exception",
    "#DF Double Fault Exception",
    "Coprocessor Segment Overrun",
    "#TS Invalid TSS Exception",
    "#NP Segment Not Present",
    "#SS Stack Fault Exception",
    "#GP General Protection Exception",
    "#PF Page-Fault Exception",
    "Intel Reserved",
    "#MF x87 FPU Floating-Point Error",
    "#AC Alignment Check Exception",
    "#MC Machine-Check Exception",
    "#XF SIMD Floating-Point Exception",
];

/// Human-readable name for a vector.
pub fn vector_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("unknown")
}

fn default_handler(vector: u8) {
    // IRQ7 and IRQ15 arrive spuriously on the 8259A; drop them quietly.
    if vector == VECTOR_SPURIOUS_MASTER || vector == VECTOR_SPURIOUS_SLAVE {
        SPURIOUS_COUNT.fetch_add(1, Ordering::Relaxed);
        return;
    }
    crate::println!("int vector: {:#04x} ({})", vector, vector_name(vector));
}

/// Install `handler` for `vector`.
///
/// For PIC vectors this also unmasks the corresponding controller line,
/// so a driver's registration is what opens its interrupt.
pub fn register_handler(vector: u8, handler: InterruptHandler) -> KernelResult<()> {
    if vector as usize >= IDT_ENTRIES {
        return Err(KernelError::InvalidVector { vector });
    }
    interrupts::without_interrupts(|| {
        // SAFETY: interrupts are masked, so no dispatch is concurrently
        // reading the slot on this CPU.
        let table = unsafe { &mut *HANDLERS.0.get() };
        if table[vector as usize] != default_handler as InterruptHandler {
            return Err(KernelError::HandlerInstalled { vector });
        }
        table[vector as usize] = handler;
        Ok(())
    })?;

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    if (crate::arch::x86::pic::IRQ_BASE_VECTOR..crate::arch::x86::pic::IRQ_LIMIT_VECTOR)
        .contains(&vector)
    {
        crate::arch::x86::pic::enable_line(vector);
    }

    Ok(())
}

/// Route `vector` to its handler. Called from the interrupt trampoline
/// with interrupts masked.
pub fn dispatch(vector: u8) {
    debug_assert!((vector as usize) < IDT_ENTRIES);
    DISPATCH_COUNT.fetch_add(1, Ordering::Relaxed);
    // SAFETY: slot writes are interrupt-masked on this CPU, so the read
    // observes a complete function pointer.
    let handler = unsafe { (*HANDLERS.0.get())[vector as usize] };
    handler(vector);
}

/// Interrupts dispatched since boot.
pub fn dispatch_count() -> u64 {
    DISPATCH_COUNT.load(Ordering::Relaxed)
}

/// Spurious interrupts dropped since boot.
pub fn spurious_count() -> u64 {
    SPURIOUS_COUNT.load(Ordering::Relaxed)
}

/// Install the IDT and program the interrupt controller.
pub fn init() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::idt::init();
    log::info!("interrupt dispatch ready ({IDT_ENTRIES} vectors)");
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    static FIRED: AtomicU32 = AtomicU32::new(0);

    fn counting_handler(_vector: u8) {
        FIRED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn registered_handler_receives_dispatch() {
        register_handler(0x2a, counting_handler).unwrap();
        let before = FIRED.load(Ordering::Relaxed);
        dispatch(0x2a);
        dispatch(0x2a);
        assert_eq!(FIRED.load(Ordering::Relaxed), before + 2);
    }

    #[test]
    fn double_registration_is_rejected() {
        register_handler(0x2b, counting_handler).unwrap();
        assert_eq!(
            register_handler(0x2b, counting_handler),
            Err(KernelError::HandlerInstalled { vector: 0x2b })
        );
    }

    #[test]
    fn out_of_range_vector_is_rejected() {
        assert_eq!(
            register_handler(0x30, counting_handler),
            Err(KernelError::InvalidVector { vector: 0x30 })
        );
    }

    #[test]
    fn spurious_lines_stay_silent() {
        let before = spurious_count();
        dispatch(0x27);
        dispatch(0x2f);
        assert_eq!(spurious_count(), before + 2);
    }

    #[test]
    fn exception_names_cover_cpu_faults() {
        assert_eq!(vector_name(0), "#DE Divide Error");
        assert_eq!(vector_name(14), "#PF Page-Fault Exception");
        assert_eq!(vector_name(32), "unknown");
    }
}
