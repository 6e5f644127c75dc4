//! Blocking synchronization: counting semaphore and reentrant lock.
//!
//! The semaphore parks waiters on a FIFO list of their run-queue tags and
//! is the only place tasks block on each other; the lock is a binary
//! semaphore plus an owner pointer and a recursion count. Interior
//! mutability with interrupts masked stands in for the atomicity a
//! multiprocessor would need real spinlocks for; this kernel is
//! single-CPU by contract.

use core::cell::UnsafeCell;

use crate::arch::interrupts;
use crate::list::List;
use crate::sched::task::{running_thread, TaskControlBlock, TaskStatus};
use crate::sched::{thread_block, thread_unblock};

struct SemInner {
    value: u8,
    waiters: List,
}

/// Counting semaphore with FIFO wakeups.
pub struct Semaphore {
    inner: UnsafeCell<SemInner>,
}

// SAFETY: inner state is only touched with interrupts masked on a single
// CPU (each method disables them around its critical section).
unsafe impl Send for Semaphore {}
// SAFETY: see the Send rationale.
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(value: u8) -> Self {
        Self {
            inner: UnsafeCell::new(SemInner {
                value,
                waiters: List::new(),
            }),
        }
    }

    /// Interior access; callers hold interrupts off. Links the waiter
    /// list's sentinels on first use, now that the semaphore cannot move.
    fn inner(&self) -> &mut SemInner {
        debug_assert_eq!(interrupts::get(), interrupts::IntrState::Off);
        // SAFETY: interrupts are off and this is a single-CPU kernel, so
        // no other access can overlap.
        let inner = unsafe { &mut *self.inner.get() };
        if inner.waiters.needs_init() {
            inner.waiters.init();
        }
        inner
    }

    /// P operation: wait until a unit is available, then take it.
    ///
    /// The wait loops rather than assuming the wakeup handed anything
    /// over: a woken task must re-check before decrementing.
    pub fn down(&self) {
        let old = interrupts::disable();
        loop {
            let cur = running_thread();
            let inner = self.inner();
            if inner.value > 0 {
                inner.value -= 1;
                break;
            }
            debug_assert!(
                !inner.waiters.contains(&cur.general_tag),
                "task already waiting on this semaphore"
            );
            // SAFETY: cur is live and its general_tag unlinked (a task in
            // a wait list is not in the run queue).
            unsafe { inner.waiters.push_back(&mut cur.general_tag) };
            thread_block(TaskStatus::Blocked);
        }
        interrupts::set(old);
    }

    /// V operation: release one unit, waking the longest waiter first.
    pub fn up(&self) {
        let old = interrupts::disable();
        let inner = self.inner();
        debug_assert_eq!(inner.value, 0, "up on a semaphore that is not held");
        if !inner.waiters.is_empty() {
            let node = inner.waiters.pop_front();
            // SAFETY: only general_tags of live waiting TCBs are in the
            // waiter list.
            let waiter = unsafe { TaskControlBlock::from_general_tag(node) };
            thread_unblock(waiter);
        }
        inner.value += 1;
        debug_assert_eq!(inner.value, 1);
        interrupts::set(old);
    }

    /// Current count (diagnostics and invariant checks).
    pub fn value(&self) -> u8 {
        interrupts::without_interrupts(|| self.inner().value)
    }

    /// Number of parked waiters (diagnostics and invariant checks).
    pub fn waiter_count(&self) -> usize {
        interrupts::without_interrupts(|| self.inner().waiters.len())
    }

    #[cfg(test)]
    pub(crate) fn test_enqueue_waiter(&self, task: &mut TaskControlBlock) {
        interrupts::without_interrupts(|| {
            // SAFETY: test-fabricated task, tag unlinked.
            unsafe { self.inner().waiters.push_back(&mut task.general_tag) };
        });
    }
}

struct LockInner {
    holder: *mut TaskControlBlock,
    recursion: u32,
}

/// Reentrant mutex built on a binary semaphore.
///
/// The holding task may re-acquire freely; only its final release
/// performs the V operation. No priority inheritance.
pub struct Lock {
    sem: Semaphore,
    inner: UnsafeCell<LockInner>,
}

// SAFETY: holder/recursion are only touched with interrupts masked on a
// single CPU, or by the holding task itself.
unsafe impl Send for Lock {}
// SAFETY: see the Send rationale.
unsafe impl Sync for Lock {}

impl Lock {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
            inner: UnsafeCell::new(LockInner {
                holder: core::ptr::null_mut(),
                recursion: 0,
            }),
        }
    }

    fn holder(&self) -> *mut TaskControlBlock {
        // SAFETY: a single aligned pointer read; stale values are
        // harmless (it can only equal `running_thread()` if this task
        // set it, and only this task clears its own ownership).
        unsafe { (*self.inner.get()).holder }
    }

    pub fn acquire(&self) {
        let cur: *mut TaskControlBlock = running_thread();
        if self.holder() == cur {
            // SAFETY: only the holder mutates recursion.
            unsafe { (*self.inner.get()).recursion += 1 };
            return;
        }
        self.sem.down();
        interrupts::without_interrupts(|| {
            // SAFETY: interrupts masked; we just won the semaphore.
            let inner = unsafe { &mut *self.inner.get() };
            debug_assert!(inner.holder.is_null());
            debug_assert_eq!(inner.recursion, 0);
            inner.holder = cur;
            inner.recursion = 1;
        });
    }

    pub fn release(&self) {
        let cur: *mut TaskControlBlock = running_thread();
        assert!(self.holder() == cur, "release by non-holder");
        let fully_released = interrupts::without_interrupts(|| {
            // SAFETY: interrupts masked and we are the holder.
            let inner = unsafe { &mut *self.inner.get() };
            if inner.recursion > 1 {
                inner.recursion -= 1;
                return false;
            }
            debug_assert_eq!(inner.recursion, 1);
            inner.holder = core::ptr::null_mut();
            inner.recursion = 0;
            true
        });
        // The V operation comes after ownership is cleared, so the woken
        // task finds the lock free.
        if fully_released {
            self.sem.up();
        }
    }

    /// Whether the calling task holds this lock.
    pub fn held_by_current(&self) -> bool {
        self.holder() == running_thread() as *mut TaskControlBlock
    }

    /// Recursion depth (diagnostics and invariant checks).
    pub fn recursion(&self) -> u32 {
        interrupts::without_interrupts(|| {
            // SAFETY: interrupts masked single-CPU read.
            unsafe { (*self.inner.get()).recursion }
        })
    }

    /// Binary-semaphore value (diagnostics and invariant checks).
    pub fn sem_value(&self) -> u8 {
        self.sem.value()
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::scheduler::tests::{fabricated_task, serial};

    #[test]
    fn semaphore_up_down_counts() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.value(), 0);
        sem.up();
        assert_eq!(sem.value(), 1);
        assert_eq!(sem.waiter_count(), 0);
        sem.down(); // value 1: must not block
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn semaphore_value_positive_implies_no_waiters() {
        let sem = Semaphore::new(1);
        assert!(sem.value() > 0);
        assert_eq!(sem.waiter_count(), 0);
    }

    #[test]
    fn up_wakes_waiters_fifo() {
        let _guard = serial();
        let first = fabricated_task("waiter-1", TaskStatus::Blocked);
        let second = fabricated_task("waiter-2", TaskStatus::Blocked);

        let sem = Semaphore::new(0);
        sem.test_enqueue_waiter(first);
        sem.test_enqueue_waiter(second);
        assert_eq!(sem.waiter_count(), 2);

        sem.up();
        // Longest waiter released first, straight onto the ready queue.
        assert_eq!(first.status, TaskStatus::Ready);
        assert_eq!(second.status, TaskStatus::Blocked);
        assert_eq!(sem.waiter_count(), 1);
        assert_eq!(sem.value(), 1);

        sem.down();
        sem.up();
        assert_eq!(second.status, TaskStatus::Ready);
        assert_eq!(sem.waiter_count(), 0);

        // Drain the global ready list the wakeups populated.
        crate::sched::scheduler::tests::drain_ready_list();
    }

    #[test]
    fn lock_tracks_holder_and_recursion() {
        let lock = Lock::new();
        // Unheld: holder none <=> recursion 0 <=> sem value 1.
        assert!(!lock.held_by_current());
        assert_eq!(lock.recursion(), 0);
        assert_eq!(lock.sem_value(), 1);

        lock.acquire();
        assert!(lock.held_by_current());
        assert_eq!(lock.recursion(), 1);
        assert_eq!(lock.sem_value(), 0);

        // Reentry bumps the count without touching the semaphore.
        lock.acquire();
        lock.acquire();
        assert_eq!(lock.recursion(), 3);
        assert_eq!(lock.sem_value(), 0);

        lock.release();
        lock.release();
        assert!(lock.held_by_current());
        assert_eq!(lock.recursion(), 1);

        lock.release();
        assert!(!lock.held_by_current());
        assert_eq!(lock.recursion(), 0);
        assert_eq!(lock.sem_value(), 1);
    }

    #[test]
    #[should_panic(expected = "release by non-holder")]
    fn release_without_acquire_panics() {
        let lock = Lock::new();
        lock.release();
    }
}
