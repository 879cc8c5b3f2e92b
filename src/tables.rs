//! Fixed-slot script-handler tables.
//!
//! Scripts attach handlers (a line number to run) to interrupt lines, timer
//! slots, the UART and the bus peripheral. The tables are arena-style fixed
//! arrays indexed by small slot handles: no allocation, O(1) lookup, and
//! every entry is a single atomic word so interrupt context can read it
//! without taking a lock.
//!
//! A line number of zero means the slot is inactive. An event bit for an
//! inactive slot is serviced as a no-op.

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use axerrno::{AxResult, ax_err};

use crate::config::{MAX_INTERRUPT, MAX_TIMER};

/// A hardware pin identity: pin group (port index) plus in-port bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinId(u8);

impl PinId {
    /// Pack a port index (`major`) and in-port bit number (`minor`).
    /// Both are truncated to their 4-bit fields.
    #[inline]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self(((major & 0x0f) << 4) | (minor & 0x0f))
    }

    #[inline]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// The pin group (hardware port index).
    #[inline]
    pub const fn major(&self) -> u8 {
        self.0 >> 4
    }

    /// The bit number within the port.
    #[inline]
    pub const fn minor(&self) -> u8 {
        self.0 & 0x0f
    }

    /// The port-register bit mask of this pin.
    #[inline]
    pub const fn mask(&self) -> u8 {
        1 << self.minor()
    }
}

/// Interrupt handler table: one `(line, pin)` entry per slot, packed into a
/// single atomic word so interrupt handlers can read entries tear-free.
pub struct InterruptTable {
    slots: [AtomicU32; MAX_INTERRUPT],
}

impl InterruptTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    #[inline]
    const fn pack(line: u16, pin: PinId) -> u32 {
        ((pin.raw() as u32) << 16) | line as u32
    }

    /// Attach a handler: run `line` when `pin` fires. Overwrites any previous
    /// registration in the slot.
    pub fn register(&self, slot: usize, line: u16, pin: PinId) -> AxResult {
        if slot >= MAX_INTERRUPT {
            return ax_err!(InvalidInput, "interrupt slot out of range");
        }
        if line == 0 {
            return ax_err!(InvalidInput, "line 0 cannot be a handler target");
        }
        debug!(
            "interrupt slot {} -> line {} (port {} bit {})",
            slot,
            line,
            pin.major(),
            pin.minor()
        );
        self.slots[slot].store(Self::pack(line, pin), Ordering::Release);
        Ok(())
    }

    /// Detach the handler in `slot`.
    pub fn clear(&self, slot: usize) -> AxResult {
        if slot >= MAX_INTERRUPT {
            return ax_err!(InvalidInput, "interrupt slot out of range");
        }
        self.slots[slot].store(0, Ordering::Release);
        Ok(())
    }

    /// The active registration in `slot`, or `None` if the slot is inactive.
    #[inline]
    pub fn entry(&self, slot: usize) -> Option<(u16, PinId)> {
        let packed = self.slots[slot].load(Ordering::Acquire);
        let line = packed as u16;
        if line == 0 {
            return None;
        }
        Some((line, PinId::from_raw((packed >> 16) as u8)))
    }

    /// The handler line of `slot`, if active.
    #[inline]
    pub fn line(&self, slot: usize) -> Option<u16> {
        self.entry(slot).map(|(line, _)| line)
    }

    /// Detach every handler.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Release);
        }
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer handler table: one line number per slot.
pub struct TimerTable {
    slots: [AtomicU16; MAX_TIMER],
}

impl TimerTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| AtomicU16::new(0)),
        }
    }

    /// Attach a handler: run `line` when timer `slot` expires.
    pub fn register(&self, slot: usize, line: u16) -> AxResult {
        if slot >= MAX_TIMER {
            return ax_err!(InvalidInput, "timer slot out of range");
        }
        if line == 0 {
            return ax_err!(InvalidInput, "line 0 cannot be a handler target");
        }
        debug!("timer slot {} -> line {}", slot, line);
        self.slots[slot].store(line, Ordering::Release);
        Ok(())
    }

    /// Detach the handler in `slot`.
    pub fn clear(&self, slot: usize) -> AxResult {
        if slot >= MAX_TIMER {
            return ax_err!(InvalidInput, "timer slot out of range");
        }
        self.slots[slot].store(0, Ordering::Release);
        Ok(())
    }

    /// The handler line of `slot`, if active.
    #[inline]
    pub fn line(&self, slot: usize) -> Option<u16> {
        match self.slots[slot].load(Ordering::Acquire) {
            0 => None,
            line => Some(line),
        }
    }

    /// Detach every handler.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Release);
        }
    }
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Read/write handler pair for a byte-stream peripheral (UART or bus).
#[derive(Default)]
pub struct IoHandlers {
    on_read: AtomicU16,
    on_write: AtomicU16,
}

impl IoHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read-handler line; 0 detaches it.
    pub fn set_on_read(&self, line: u16) {
        self.on_read.store(line, Ordering::Release);
    }

    /// Set the write-handler line; 0 detaches it.
    pub fn set_on_write(&self, line: u16) {
        self.on_write.store(line, Ordering::Release);
    }

    /// The `(on_read, on_write)` handler lines, `None` where detached.
    #[inline]
    pub fn lines(&self) -> (Option<u16>, Option<u16>) {
        let read = self.on_read.load(Ordering::Acquire);
        let write = self.on_write.load(Ordering::Acquire);
        (
            (read != 0).then_some(read),
            (write != 0).then_some(write),
        )
    }

    pub fn reset(&self) {
        self.on_read.store(0, Ordering::Release);
        self.on_write.store(0, Ordering::Release);
    }
}

/// All script-handler tables, shared between the dispatcher and the
/// interrupt router.
#[derive(Default)]
pub struct HandlerTables {
    pub interrupts: InterruptTable,
    pub timers: TimerTable,
    pub serial: IoHandlers,
    pub bus: IoHandlers,
}

impl HandlerTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detach every handler. Used when the script is erased or reset.
    pub fn reset_all(&self) {
        self.interrupts.reset();
        self.timers.reset();
        self.serial.reset();
        self.bus.reset();
        debug!("handler tables reset");
    }
}
