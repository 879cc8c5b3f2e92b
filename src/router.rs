//! Interrupt-to-event translation.
//!
//! Runs in interrupt context. The only shared-state mutation permitted here
//! is the atomic OR into the event mask plus the hardware flag acknowledge;
//! no script-engine calls, no blocking, no allocation, so interrupt latency
//! stays bounded by a handful of register and table reads.

use alloc::sync::Arc;

use crate::InterruptPort;
use crate::config::MAX_INTERRUPT;
use crate::events::{EventMask, bits};
use crate::tables::HandlerTables;

/// Translates raw pin-change signals into dispatcher-visible event bits.
#[derive(Clone)]
pub struct InterruptRouter {
    events: Arc<EventMask>,
    tables: Arc<HandlerTables>,
}

impl InterruptRouter {
    pub fn new(events: Arc<EventMask>, tables: Arc<HandlerTables>) -> Self {
        Self { events, tables }
    }

    /// Service a pin-change signal on pin group `port`.
    ///
    /// Reads the port's pending flags masked by its enable register,
    /// acknowledges the hardware flags, and latches the event bit of every
    /// registered interrupt slot whose pin matches the firing port and bit.
    /// A firing pin with no registered line is acknowledged but latches
    /// nothing (stale edge or unregistered pin).
    pub fn port_signal(&self, port: u8, pins: &dyn InterruptPort) {
        let pending = pins.pending() & pins.enabled();
        if pending == 0 {
            return;
        }
        pins.acknowledge(pending);

        for slot in 0..MAX_INTERRUPT {
            if let Some((_, pin)) = self.tables.interrupts.entry(slot) {
                if pin.major() == port && pending & pin.mask() != 0 {
                    self.events.set(bits::interrupt(slot));
                }
            }
        }
    }
}
