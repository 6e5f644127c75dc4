//! Kernel-stack context switch.
//!
//! Only the callee-saved registers travel through a switch; everything
//! else is already on the outgoing task's kernel stack, put there by the
//! interrupt trampoline or by the compiler at the `switch_to` call site.
//! The saved stack pointer lands in the TCB's first field, which is why
//! `TaskControlBlock` keeps `self_kstack` at offset zero.

use core::arch::global_asm;

use crate::sched::task::TaskControlBlock;

global_asm!(
    r#"
    .text
    .globl switch_to
switch_to:
    push esi
    push edi
    push ebx
    push ebp
    mov eax, [esp + 20]
    mov [eax], esp
    mov eax, [esp + 24]
    mov esp, [eax]
    pop ebp
    pop ebx
    pop edi
    pop esi
    ret
"#
);

extern "C" {
    /// Swap kernel stacks from `cur` to `next`.
    ///
    /// Returns when `cur` is scheduled again; for a task's first run the
    /// `ret` instead lands in the entry trampoline its thread frame was
    /// seeded with.
    pub fn switch_to(cur: *mut TaskControlBlock, next: *mut TaskControlBlock);
}
