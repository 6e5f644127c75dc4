//! IA-32 hardware support: port I/O, interrupt plumbing, paging control
//! registers, the context switch, and the TSS kernel-stack slot.

pub mod context;
pub mod idt;
pub mod interrupts;
pub mod pic;
pub mod port;
pub mod tss;

use core::arch::asm;

/// Kernel code segment selector installed by the loader's GDT.
pub const SELECTOR_K_CODE: u16 = 1 << 3;
/// Kernel data/stack segment selector.
pub const SELECTOR_K_DATA: u16 = 2 << 3;

/// Halt until the next interrupt.
#[inline]
pub fn halt() {
    // SAFETY: `hlt` only pauses the CPU; it resumes on the next interrupt.
    unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) };
}

/// Enable interrupts and halt in one step.
///
/// The `sti; hlt` pair is immune to the lost-wakeup window: `sti` takes
/// effect after the following instruction, so no interrupt can slip in
/// between the two.
#[inline]
pub fn enable_and_halt() {
    // SAFETY: see above; this is the canonical idle sequence.
    unsafe { asm!("sti", "hlt", options(nomem, nostack)) };
}

/// Load CR3 with the physical address of a page directory.
///
/// # Safety
///
/// `pgdir_phys` must be the physical address of a valid page directory
/// whose kernel half mirrors the shared kernel mappings.
#[inline]
pub unsafe fn load_page_directory(pgdir_phys: usize) {
    // SAFETY: caller guarantees the directory is valid; writing CR3 also
    // flushes non-global TLB entries, which is exactly what an address
    // space switch needs.
    unsafe { asm!("mov cr3, {}", in(reg) pgdir_phys, options(nostack, preserves_flags)) };
}

/// Invalidate the TLB entry covering `vaddr` after a PTE change.
#[inline]
pub fn invlpg(vaddr: usize) {
    // SAFETY: `invlpg` only drops a TLB entry; the next access re-walks
    // the page tables.
    unsafe { asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags)) };
}
