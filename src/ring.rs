//! Bounded SPSC byte ring for console output.
//!
//! Two cursors advance modulo the backing capacity: the producer owns
//! `write_in`, the drain path owns `write_out`. The ring is empty iff the
//! cursors are equal and full when advancing `write_in` by one would make
//! them equal, so one backing byte is sacrificed and the usable capacity is
//! `len - 1`.
//!
//! # Memory ordering
//! The producer writes the byte, then publishes `write_in` with Release; the
//! consumer loads `write_in` with Acquire before reading, and publishes
//! `write_out` with Release after the bytes are delivered. With exactly one
//! producer and one consumer this is race-free without locks.
//!
//! # Safety and concurrency
//! This type is SPSC by design: exactly one producer and one consumer must be
//! active. The consumer side splits reading (`peek_with`) from cursor advance
//! (`release`) so the cursor only moves for bytes that were actually
//! delivered.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;
use axerrno::{AxResult, ax_err};

/// Fixed-capacity SPSC byte ring.
pub struct NotifyRing {
    slots: Box<[UnsafeCell<u8>]>,
    write_in: AtomicUsize,
    write_out: AtomicUsize,
}

// SAFETY: the SPSC discipline guarantees the producer only writes slots in
// [write_in, write_out) and the consumer only reads slots in
// [write_out, write_in); the atomic cursors order those accesses.
unsafe impl Sync for NotifyRing {}
unsafe impl Send for NotifyRing {}

impl NotifyRing {
    /// Create a ring with `capacity` backing bytes (`capacity - 1` usable).
    ///
    /// Allocation is fallible: on an exhausted heap the console degrades
    /// instead of aborting the runtime.
    pub fn try_new(capacity: usize) -> AxResult<Self> {
        if capacity < 2 {
            return ax_err!(InvalidInput, "ring needs at least one usable byte");
        }
        let mut slots = Vec::new();
        if slots.try_reserve_exact(capacity).is_err() {
            return ax_err!(NoMemory, "ring buffer allocation failed");
        }
        slots.resize_with(capacity, || UnsafeCell::new(0));
        Ok(Self {
            slots: slots.into_boxed_slice(),
            write_in: AtomicUsize::new(0),
            write_out: AtomicUsize::new(0),
        })
    }

    /// Usable capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Bytes currently buffered.
    #[inline]
    pub fn len(&self) -> usize {
        let len = self.slots.len();
        let input = self.write_in.load(Ordering::Acquire);
        let output = self.write_out.load(Ordering::Acquire);
        (input + len - output) % len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.write_in.load(Ordering::Acquire) == self.write_out.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        let len = self.slots.len();
        let next = (self.write_in.load(Ordering::Acquire) + 1) % len;
        next == self.write_out.load(Ordering::Acquire)
    }

    /// Producer side: append one byte. Returns `false` when full.
    #[inline]
    pub fn push(&self, byte: u8) -> bool {
        let len = self.slots.len();
        let input = self.write_in.load(Ordering::Relaxed);
        let next = (input + 1) % len;
        if next == self.write_out.load(Ordering::Acquire) {
            return false;
        }
        // SAFETY: the producer owns this slot until write_in is published.
        unsafe { *self.slots[input].get() = byte };
        self.write_in.store(next, Ordering::Release);
        true
    }

    /// Consumer side: visit up to `max` buffered bytes in FIFO order without
    /// advancing the cursor. Returns the number visited.
    pub fn peek_with(&self, max: usize, mut visit: impl FnMut(u8)) -> usize {
        let len = self.slots.len();
        let output = self.write_out.load(Ordering::Relaxed);
        let input = self.write_in.load(Ordering::Acquire);
        let avail = (input + len - output) % len;
        let n = avail.min(max);
        for i in 0..n {
            // SAFETY: slots in [write_out, write_in) belong to the consumer.
            visit(unsafe { *self.slots[(output + i) % len].get() });
        }
        n
    }

    /// Consumer side: advance past `n` delivered bytes.
    #[inline]
    pub fn release(&self, n: usize) {
        let len = self.slots.len();
        let output = self.write_out.load(Ordering::Relaxed);
        self.write_out.store((output + n) % len, Ordering::Release);
    }

    /// Discard everything currently buffered.
    ///
    /// Consumer-side operation: the cursor jumps to the producer's published
    /// position, so it is safe against a concurrent `push`.
    #[inline]
    pub fn reset(&self) {
        let input = self.write_in.load(Ordering::Acquire);
        self.write_out.store(input, Ordering::Release);
    }
}
