//! Software stand-ins used when the crate is built for a hosted target
//! (unit tests on the developer machine).
//!
//! The interrupt flag becomes a thread-local bool so each test thread has
//! an isolated "CPU"; the current-task page becomes a leaked, page-aligned
//! allocation so `running_thread()` has something real to return.

use core::cell::Cell;

pub mod interrupts {
    use super::Cell;
    use crate::arch::interrupts::IntrState;

    std::thread_local! {
        /// Per-thread stand-in for the EFLAGS IF bit. Starts Off, like a
        /// freshly booted CPU.
        static IF_FLAG: Cell<bool> = const { Cell::new(false) };
    }

    pub fn get() -> IntrState {
        if IF_FLAG.with(|f| f.get()) {
            IntrState::On
        } else {
            IntrState::Off
        }
    }

    pub fn enable() {
        IF_FLAG.with(|f| f.set(true));
    }

    pub fn disable() {
        IF_FLAG.with(|f| f.set(false));
    }
}

/// One page-aligned, page-sized block standing in for a TCB page.
#[repr(C, align(4096))]
pub struct FakeTaskPage(pub [u8; 4096]);

std::thread_local! {
    static CURRENT_TASK_PAGE: &'static mut FakeTaskPage =
        std::boxed::Box::leak(std::boxed::Box::new(FakeTaskPage([0; 4096])));
}

/// Address of this thread's fake current-task page.
pub fn current_task_page() -> *mut u8 {
    CURRENT_TASK_PAGE.with(|p| &**p as *const FakeTaskPage as *mut u8)
}
