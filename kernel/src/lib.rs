//! Obsidian kernel core.
//!
//! The preemptive-multitasking core of a small IA-32 kernel: interrupt
//! dispatch, the two-pool page allocator and arena heap, the
//! priority-quantum scheduler, blocking synchronization primitives, and
//! the PIT/IDE drivers that exercise them. The boot loader, VGA text
//! output, filesystem, and user-mode process machinery live outside this
//! crate and meet it at narrow seams (`ConsoleSink`, `init_all`).

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Host builds (unit tests) get std and the system allocator so test code
// can allocate normally; the kernel's own heap only exists on bare metal.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// On bare metal the arena heap is the global allocator.
#[cfg(all(target_arch = "x86", target_os = "none", feature = "alloc"))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelHeap = mm::heap::KernelHeap;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bitmap;
pub mod drivers;
pub mod error;
pub mod ioqueue;
pub mod irq;
pub mod list;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod sync;

pub use error::{KernelError, KernelResult};

/// Bring every subsystem up, in dependency order: logging first so later
/// stages can report, interrupts before memory (page faults), memory
/// before threads (TCB pages), threads before the timer (the tick
/// handler schedules), and the disks last.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init_all() -> KernelResult<()> {
    logger::init();
    drivers::console::init();
    irq::init();
    mm::init();
    sched::init()?;
    drivers::timer::init()?;
    drivers::ide::init()?;
    log::info!("kernel core initialized");
    Ok(())
}
