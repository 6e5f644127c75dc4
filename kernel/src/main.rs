//! Bare-metal entry point.
//!
//! The loader drops us here in protected mode with paging on and ESP at
//! the reserved boot stack. Everything interesting happens in
//! `init_all`; afterwards this thread becomes the adopted "main" task
//! and idles.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use obsidian_kernel::{arch, init_all, println};

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    println!("Obsidian kernel v{}", env!("CARGO_PKG_VERSION"));

    if let Err(err) = init_all() {
        panic!("init failed: {err}");
    }

    arch::interrupts::enable();
    loop {
        arch::halt();
    }
}

/// Panic = unrecoverable invariant violation: mask interrupts so nothing
/// scribbles over the report, print it, and stop.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    arch::interrupts::disable();
    println!("\n----------- kernel panic -----------");
    println!("{info}");
    loop {
        arch::halt();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("obsidian-kernel is a bare-metal image; build for an x86/none target");
}
