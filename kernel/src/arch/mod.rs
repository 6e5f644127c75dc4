//! Architecture support.
//!
//! The kernel targets IA-32 protected mode; everything that touches
//! hardware lives in [`x86`] and compiles only for `x86`/`none`. Other
//! targets (the host running unit tests) get software stand-ins from
//! [`hosted`] so the architecture-independent logic stays exercisable.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub mod hosted;

pub mod interrupts {
    //! CPU interrupt-flag primitives.
    //!
    //! These are the only task-vs-IRQ synchronization mechanism in the
    //! kernel: short critical sections bracket themselves with
    //! `disable`/`restore`. Re-entering an already-disabled section leaves
    //! interrupts disabled on exit; there is no nesting counter.

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    use super::x86::interrupts as imp;

    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    use super::hosted::interrupts as imp;

    /// The two interrupt states the IF flag encodes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum IntrState {
        /// Interrupts masked.
        Off,
        /// Interrupts deliverable.
        On,
    }

    /// Read the current interrupt state.
    #[inline]
    pub fn get() -> IntrState {
        imp::get()
    }

    /// Enable interrupts, returning the prior state.
    #[inline]
    pub fn enable() -> IntrState {
        let old = imp::get();
        imp::enable();
        old
    }

    /// Disable interrupts, returning the prior state.
    #[inline]
    pub fn disable() -> IntrState {
        let old = imp::get();
        imp::disable();
        old
    }

    /// Restore a state previously returned by `enable`/`disable`.
    #[inline]
    pub fn set(state: IntrState) -> IntrState {
        match state {
            IntrState::On => enable(),
            IntrState::Off => disable(),
        }
    }

    /// Run `f` with interrupts disabled, restoring the prior state after.
    #[inline]
    pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
        let old = disable();
        let ret = f();
        set(old);
        ret
    }
}

/// Halt the CPU until the next interrupt.
#[inline]
pub fn halt() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::halt();
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    core::hint::spin_loop();
}

/// Atomically enable interrupts and halt; the idle task's whole body.
#[inline]
pub fn enable_and_halt() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::enable_and_halt();
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        interrupts::enable();
        core::hint::spin_loop();
    }
}
