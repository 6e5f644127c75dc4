//! Bounded producer/consumer byte queue.
//!
//! Designed for exactly one producer (a device IRQ handler) and one
//! consumer (a worker thread), so instead of wait lists each side gets a
//! single waiter slot. `head` is the write cursor, `tail` the read
//! cursor; equal cursors mean empty and a full ring keeps one slot open
//! so the two states stay distinguishable. Callers enter with interrupts
//! already masked: the queue is shared with an IRQ handler and its state
//! changes must be atomic against it.

use core::cell::UnsafeCell;

use crate::arch::interrupts::{self, IntrState};
use crate::sched::task::{running_thread, TaskControlBlock, TaskStatus};
use crate::sched::{thread_block, thread_unblock};
use crate::sync::Lock;

/// Ring capacity in bytes (one slot stays open as the full marker).
pub const IOQ_BUF_SIZE: usize = 64;

struct IoQueueInner {
    buf: [u8; IOQ_BUF_SIZE],
    /// Write cursor.
    head: usize,
    /// Read cursor.
    tail: usize,
    /// The single parked producer, if any.
    producer: *mut TaskControlBlock,
    /// The single parked consumer, if any.
    consumer: *mut TaskControlBlock,
}

/// Blocking byte ring for one producer and one consumer.
pub struct IoQueue {
    /// Guards the waiter slots across the sleep/wake handshake.
    lock: Lock,
    inner: UnsafeCell<IoQueueInner>,
}

// SAFETY: all inner access happens with interrupts masked on a single
// CPU (asserted at every entry point).
unsafe impl Send for IoQueue {}
// SAFETY: see the Send rationale.
unsafe impl Sync for IoQueue {}

/// Next ring position after `pos`.
const fn next_pos(pos: usize) -> usize {
    (pos + 1) % IOQ_BUF_SIZE
}

impl IoQueue {
    pub const fn new() -> Self {
        Self {
            lock: Lock::new(),
            inner: UnsafeCell::new(IoQueueInner {
                buf: [0; IOQ_BUF_SIZE],
                head: 0,
                tail: 0,
                producer: core::ptr::null_mut(),
                consumer: core::ptr::null_mut(),
            }),
        }
    }

    fn inner(&self) -> &mut IoQueueInner {
        debug_assert_eq!(interrupts::get(), IntrState::Off);
        // SAFETY: interrupts are masked (asserted) on a single CPU.
        unsafe { &mut *self.inner.get() }
    }

    /// Whether the ring is full. Interrupts must be off.
    pub fn is_full(&self) -> bool {
        let inner = self.inner();
        next_pos(inner.head) == inner.tail
    }

    /// Whether the ring is empty. Interrupts must be off.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner();
        inner.head == inner.tail
    }

    /// Park the calling task in `slot` until the other side wakes it.
    fn wait(slot: &mut *mut TaskControlBlock) {
        debug_assert!(slot.is_null(), "second sleeper on a single-slot queue");
        *slot = running_thread();
        thread_block(TaskStatus::Blocked);
    }

    /// Wake and clear the task parked in `slot`.
    fn wakeup(slot: &mut *mut TaskControlBlock) {
        debug_assert!(!slot.is_null());
        // SAFETY: the slot holds a live parked TCB.
        thread_unblock(unsafe { &mut **slot });
        *slot = core::ptr::null_mut();
    }

    /// Take one byte, sleeping while the ring is empty. Interrupts must
    /// be off; they stay off across the internal sleep.
    pub fn getchar(&self) -> u8 {
        debug_assert_eq!(interrupts::get(), IntrState::Off);

        while self.is_empty() {
            // The lock spans only slot registration: the producer must
            // not observe a half-registered consumer.
            self.lock.acquire();
            Self::wait(&mut self.inner().consumer);
            self.lock.release();
        }

        let inner = self.inner();
        let byte = inner.buf[inner.tail];
        inner.tail = next_pos(inner.tail);

        if !inner.producer.is_null() {
            Self::wakeup(&mut inner.producer);
        }
        byte
    }

    /// Put one byte, sleeping while the ring is full. Interrupts must be
    /// off; they stay off across the internal sleep.
    pub fn putchar(&self, byte: u8) {
        debug_assert_eq!(interrupts::get(), IntrState::Off);

        while self.is_full() {
            self.lock.acquire();
            Self::wait(&mut self.inner().producer);
            self.lock.release();
        }

        let inner = self.inner();
        inner.buf[inner.head] = byte;
        inner.head = next_pos(inner.head);

        if !inner.consumer.is_null() {
            Self::wakeup(&mut inner.consumer);
        }
    }

    /// Bytes currently queued. Interrupts must be off.
    pub fn len(&self) -> usize {
        let inner = self.inner();
        (inner.head + IOQ_BUF_SIZE - inner.tail) % IOQ_BUF_SIZE
    }
}

impl Default for IoQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_interrupts_off(f: impl FnOnce()) {
        let old = interrupts::disable();
        f();
        interrupts::set(old);
    }

    #[test]
    fn next_pos_wraps() {
        assert_eq!(next_pos(0), 1);
        assert_eq!(next_pos(IOQ_BUF_SIZE - 1), 0);
    }

    #[test]
    fn starts_empty_not_full() {
        with_interrupts_off(|| {
            let q = IoQueue::new();
            assert!(q.is_empty());
            assert!(!q.is_full());
            assert_eq!(q.len(), 0);
        });
    }

    #[test]
    fn bytes_come_out_in_order() {
        with_interrupts_off(|| {
            let q = IoQueue::new();
            for b in 0..40u8 {
                q.putchar(b);
            }
            assert_eq!(q.len(), 40);
            for b in 0..40u8 {
                assert_eq!(q.getchar(), b);
            }
            assert!(q.is_empty());
        });
    }

    #[test]
    fn fills_at_capacity_minus_one() {
        with_interrupts_off(|| {
            let q = IoQueue::new();
            for b in 0..(IOQ_BUF_SIZE - 1) as u8 {
                q.putchar(b);
            }
            // One slot stays open as the full/empty disambiguator.
            assert!(q.is_full());
            assert_eq!(q.len(), IOQ_BUF_SIZE - 1);
            assert_eq!(q.getchar(), 0);
            assert!(!q.is_full());
        });
    }

    #[test]
    fn wraps_around_the_ring() {
        with_interrupts_off(|| {
            let q = IoQueue::new();
            // Advance the cursors most of the way, then cross the seam.
            for b in 0..(IOQ_BUF_SIZE - 8) as u8 {
                q.putchar(b);
                assert_eq!(q.getchar(), b);
            }
            for b in 100..116u8 {
                q.putchar(b);
            }
            for b in 100..116u8 {
                assert_eq!(q.getchar(), b);
            }
        });
    }
}
