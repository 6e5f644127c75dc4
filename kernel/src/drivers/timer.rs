//! PIT (8253/8254) tick source and the scheduler's heartbeat.
//!
//! Channel 0 runs in rate-generator mode at 100 Hz. Each tick charges
//! the running task's quantum and, once it is spent, invokes the
//! scheduler; the tick handler is the only preemption point in the
//! kernel. The handler also audits the task's stack canary, because a
//! kernel stack that overflows does it quietly and this is the one code
//! path guaranteed to run regularly in every task's context.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernelResult;
use crate::irq::{self, VECTOR_TIMER};
use crate::sched::task::running_thread;
use crate::sched::{schedule, thread_yield, TaskStatus};

/// Tick rate the PIT is programmed for.
pub const TICK_FREQUENCY_HZ: u32 = 100;
/// The PIT's fixed input clock.
pub const PIT_INPUT_FREQUENCY_HZ: u32 = 1_193_180;
/// Counter reload value producing [`TICK_FREQUENCY_HZ`].
pub const PIT_DIVISOR: u16 = (PIT_INPUT_FREQUENCY_HZ / TICK_FREQUENCY_HZ) as u16;
/// Milliseconds covered by one tick.
pub const MS_PER_TICK: u32 = 1000 / TICK_FREQUENCY_HZ;

/// Ticks since the tick source came up.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Global tick count.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Ticks (rounded up) covering `ms` milliseconds.
pub const fn sleep_ticks_for_ms(ms: u32) -> u32 {
    ms.div_ceil(MS_PER_TICK)
}

/// Tick ISR: account time, enforce the quantum.
fn tick_handler(_vector: u8) {
    let cur = running_thread();
    assert!(
        cur.canary_ok(),
        "kernel stack overflow in task `{}`",
        cur.name()
    );

    cur.elapsed_ticks += 1;
    TICKS.fetch_add(1, Ordering::Relaxed);

    cur.ticks = cur.ticks.saturating_sub(1);
    if cur.ticks == 0 && cur.status == TaskStatus::Running {
        // Quantum spent; schedule() refills it when the task requeues.
        schedule();
    }
}

/// Spin-yield until `sleep_ticks` ticks have elapsed.
fn ticks_to_sleep(sleep_ticks: u32) {
    let start = ticks();
    while ticks() - start < u64::from(sleep_ticks) {
        thread_yield();
    }
}

/// Sleep at millisecond granularity (rounded up to whole ticks).
pub fn mtime_sleep(ms: u32) {
    let sleep_ticks = sleep_ticks_for_ms(ms);
    debug_assert!(sleep_ticks > 0);
    ticks_to_sleep(sleep_ticks);
}

/// Program channel 0 and hook the tick vector.
pub fn init() -> KernelResult<()> {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        use crate::arch::x86::port::Port;

        const PIT_CHANNEL0_PORT: u16 = 0x40;
        const PIT_COMMAND_PORT: u16 = 0x43;
        /// Channel 0, lobyte/hibyte access, mode 2 (rate generator).
        const PIT_MODE: u8 = 0b0011_0100;

        // SAFETY: documented PIT programming sequence, boot context.
        unsafe {
            Port::<u8>::new(PIT_COMMAND_PORT).write(PIT_MODE);
            let mut data = Port::<u8>::new(PIT_CHANNEL0_PORT);
            data.write((PIT_DIVISOR & 0xff) as u8);
            data.write((PIT_DIVISOR >> 8) as u8);
        }
    }

    irq::register_handler(VECTOR_TIMER, tick_handler)?;
    log::info!(
        "timer: PIT at {} Hz (divisor {})",
        TICK_FREQUENCY_HZ,
        PIT_DIVISOR
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_hits_one_hundred_hertz() {
        assert_eq!(PIT_DIVISOR, 11931);
        // The divisor must land within 1 Hz of the target rate.
        let actual = PIT_INPUT_FREQUENCY_HZ / PIT_DIVISOR as u32;
        assert!(actual.abs_diff(TICK_FREQUENCY_HZ) <= 1);
    }

    #[test]
    fn sleep_ticks_round_up() {
        assert_eq!(sleep_ticks_for_ms(10), 1);
        assert_eq!(sleep_ticks_for_ms(11), 2);
        assert_eq!(sleep_ticks_for_ms(500), 50);
        assert_eq!(sleep_ticks_for_ms(1), 1);
    }

    #[test]
    fn ms_per_tick_matches_rate() {
        assert_eq!(MS_PER_TICK, 10);
    }
}
