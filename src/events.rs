//! The shared pending-event bitset.
//!
//! `EventMask` is the only state shared between interrupt context and the
//! cooperative dispatcher, so every operation on it is a single lock-free
//! atomic access. Interrupt handlers only ever OR bits in; the dispatcher
//! takes bits out before servicing them, which means a re-trigger arriving
//! while a condition is being serviced is latched for the next pass instead
//! of being lost.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{MAX_INTERRUPT, MAX_TIMER};

/// Bit identities of the event categories.
///
/// Bits 6, 7 and everything above the timer range are reserved; the
/// dispatcher discards them without error.
pub mod bits {
    use super::{MAX_INTERRUPT, MAX_TIMER};

    /// A system message is queued.
    pub const SYS_MESSAGE: u32 = 1 << 0;
    /// One-time device startup is pending.
    pub const STARTUP: u32 = 1 << 1;
    /// The notification channel has buffered bytes to drain.
    pub const CHANNEL_DRAIN: u32 = 1 << 2;
    /// Script input is waiting for the main loop.
    pub const INPUT_AVAILABLE: u32 = 1 << 3;
    /// The UART has receive data or transmit capacity.
    pub const SERIAL_READY: u32 = 1 << 4;
    /// The bus peripheral finished a transaction.
    pub const PERIPHERAL_READY: u32 = 1 << 5;

    const INTERRUPT_SHIFT: u32 = 8;
    const TIMER_SHIFT: u32 = 16;

    /// All interrupt slot bits.
    pub const INTERRUPT_ALL: u32 = (((1u64 << MAX_INTERRUPT) - 1) as u32) << INTERRUPT_SHIFT;
    /// All timer slot bits.
    pub const TIMER_ALL: u32 = (((1u64 << MAX_TIMER) - 1) as u32) << TIMER_SHIFT;

    /// Every bit the dispatcher recognizes.
    pub const ALL_KNOWN: u32 = SYS_MESSAGE
        | STARTUP
        | CHANNEL_DRAIN
        | INPUT_AVAILABLE
        | SERIAL_READY
        | PERIPHERAL_READY
        | INTERRUPT_ALL
        | TIMER_ALL;

    /// The event bit of interrupt slot `slot`.
    #[inline]
    pub const fn interrupt(slot: usize) -> u32 {
        (1 << INTERRUPT_SHIFT) << slot
    }

    /// The event bit of timer slot `slot`.
    #[inline]
    pub const fn timer(slot: usize) -> u32 {
        (1 << TIMER_SHIFT) << slot
    }
}

/// The process-wide pending-event bitset.
///
/// Setters may run in interrupt context; the dispatcher is the only clearer.
#[derive(Default)]
pub struct EventMask(AtomicU32);

impl EventMask {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Latch `bits` as pending (atomic OR). Safe from interrupt context.
    ///
    /// Returns the previous mask value.
    #[inline]
    pub fn set(&self, bits: u32) -> u32 {
        self.0.fetch_or(bits, Ordering::Release)
    }

    /// Drop `bits` without servicing them.
    #[inline]
    pub fn clear(&self, bits: u32) {
        self.0.fetch_and(!bits, Ordering::Release);
    }

    /// Atomically claim whichever of `bits` are currently pending.
    ///
    /// The claimed bits are cleared in the mask and returned. A concurrent
    /// `set` of the same bit after the claim is preserved for a later take.
    #[inline]
    pub fn take(&self, bits: u32) -> u32 {
        self.0.fetch_and(!bits, Ordering::AcqRel) & bits
    }

    /// Claim every pending bit.
    #[inline]
    pub fn take_all(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }

    /// Current pending bits, without claiming them.
    #[inline]
    pub fn snapshot(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Whether any of `bits` is pending.
    #[inline]
    pub fn is_pending(&self, bits: u32) -> bool {
        self.snapshot() & bits != 0
    }
}

/// An immutable snapshot of event bits handed through one dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSet(u32);

impl EventSet {
    pub const EMPTY: EventSet = EventSet(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether any of `bits` is present.
    #[inline]
    pub const fn contains(&self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    /// This set with `bits` removed.
    #[inline]
    pub const fn without(&self, bits: u32) -> Self {
        Self(self.0 & !bits)
    }

    /// This set restricted to bits the dispatcher recognizes.
    #[inline]
    pub const fn known(&self) -> Self {
        Self(self.0 & bits::ALL_KNOWN)
    }
}
