//! The cooperative event dispatcher.
//!
//! One dispatch pass services at most one pending event category and returns
//! the bits it did not handle, so the caller can re-poll and interleave other
//! work. Categories are serviced in a fixed priority order:
//!
//! 1. queued system message
//! 2. one-time device startup
//! 3. console channel drain
//! 4. script input (main loop)
//! 5. interrupt handlers (slot order)
//! 6. timer handlers (slot order; the delay slot runs in the background)
//! 7. serial read/write handlers
//! 8. bus-peripheral read/write handlers
//!
//! The order is not configurable, and there is no fairness guarantee beyond
//! it: a continuously re-triggering high-priority source can starve lower
//! categories. Unrecognized bits are discarded without error.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use axerrno::{AxResult, ax_err};
use spin::{Mutex, Once, RwLock};

use crate::channel::NotificationChannel;
use crate::config::{CoreConfig, DELAY_TIMER, MAX_INTERRUPT, MAX_TIMER};
use crate::events::{EventMask, EventSet, bits};
use crate::router::InterruptRouter;
use crate::subscription::{ConnectionMonitor, SubscriptionTable};
use crate::tables::HandlerTables;
use crate::{
    BusStatus, DispatchPump, LinkChange, LinkEndpoint, LinkTransport, ScriptEngine, SerialStatus,
    StatusObserver, TimerService,
};

/// An opaque queued system message. Drained and discarded by the dispatcher.
pub type SysMessage = Vec<u8>;

/// The console parts brought up during device startup.
struct ConsoleParts {
    channel: Arc<NotificationChannel>,
    monitor: ConnectionMonitor,
}

/// Builder for [`EventDispatcher`], wiring in the external collaborators.
pub struct DispatcherBuilder {
    config: CoreConfig,
    engine: Arc<dyn ScriptEngine>,
    link: Arc<dyn LinkTransport>,
    timers: Arc<dyn TimerService>,
    serial: Option<Arc<dyn SerialStatus>>,
    bus: Option<Arc<dyn BusStatus>>,
    observer: Option<Arc<dyn StatusObserver>>,
}

impl DispatcherBuilder {
    pub fn new(
        engine: Arc<dyn ScriptEngine>,
        link: Arc<dyn LinkTransport>,
        timers: Arc<dyn TimerService>,
    ) -> Self {
        Self {
            config: CoreConfig::default(),
            engine,
            link,
            timers,
            serial: None,
            bus: None,
            observer: None,
        }
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_serial(mut self, serial: Arc<dyn SerialStatus>) -> Self {
        self.serial = Some(serial);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn BusStatus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the dispatcher with the startup event already latched, so the
    /// first dispatch pass performs one-time device bring-up.
    pub fn build(self) -> Arc<EventDispatcher> {
        let core = Arc::new(EventDispatcher {
            config: self.config,
            events: Arc::new(EventMask::new()),
            tables: Arc::new(HandlerTables::new()),
            engine: self.engine,
            link: self.link,
            timers: self.timers,
            serial: self.serial,
            bus: self.bus,
            observer: RwLock::new(self.observer),
            console: Once::new(),
            messages: Mutex::new(VecDeque::new()),
            started: AtomicBool::new(false),
            me: Once::new(),
        });
        core.me.call_once(|| Arc::downgrade(&core));
        core.events.set(bits::STARTUP);
        core
    }
}

/// The cooperative core scheduler.
///
/// Owns the shared event mask and handler tables, and drives the script
/// engine and the notification channel from pending event bits.
pub struct EventDispatcher {
    config: CoreConfig,
    events: Arc<EventMask>,
    tables: Arc<HandlerTables>,
    engine: Arc<dyn ScriptEngine>,
    link: Arc<dyn LinkTransport>,
    timers: Arc<dyn TimerService>,
    serial: Option<Arc<dyn SerialStatus>>,
    bus: Option<Arc<dyn BusStatus>>,
    observer: RwLock<Option<Arc<dyn StatusObserver>>>,
    /// Console state, brought up once at startup; `None` inside means the
    /// allocation failed and the console is disabled for this session.
    console: Once<Option<ConsoleParts>>,
    messages: Mutex<VecDeque<SysMessage>>,
    started: AtomicBool,
    me: Once<Weak<EventDispatcher>>,
}

impl EventDispatcher {
    /// The shared pending-event mask.
    pub fn events(&self) -> &Arc<EventMask> {
        &self.events
    }

    /// The script-handler tables.
    pub fn tables(&self) -> &Arc<HandlerTables> {
        &self.tables
    }

    /// An interrupt router bound to this dispatcher's mask and tables.
    pub fn interrupt_router(&self) -> InterruptRouter {
        InterruptRouter::new(self.events.clone(), self.tables.clone())
    }

    /// Replace the connection-status observer hook.
    pub fn set_observer(&self, observer: Arc<dyn StatusObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Whether the console channel currently has a subscriber.
    pub fn console_enabled(&self) -> bool {
        self.console()
            .map(|parts| parts.channel.is_enabled())
            .unwrap_or(false)
    }

    /// Buffer one byte of script output for notification delivery.
    ///
    /// Discarded when no peer subscribes; blocks cooperatively (yielding into
    /// the dispatcher) while the buffer is full.
    pub fn console_write(&self, byte: u8) {
        if let Some(parts) = self.console() {
            parts.channel.write(byte);
        }
    }

    /// Queue a system message and latch its event bit.
    pub fn post_message(&self, msg: SysMessage) {
        self.messages.lock().push_back(msg);
        self.events.set(bits::SYS_MESSAGE);
    }

    /// Latch the expiry of timer `slot`.
    pub fn post_timer(&self, slot: usize) -> AxResult {
        if slot >= MAX_TIMER {
            return ax_err!(InvalidInput, "timer slot out of range");
        }
        self.events.set(bits::timer(slot));
        Ok(())
    }

    /// Latch the serial-ready condition.
    pub fn post_serial_ready(&self) {
        self.events.set(bits::SERIAL_READY);
    }

    /// Latch the bus-peripheral-ready condition.
    pub fn post_peripheral_ready(&self) {
        self.events.set(bits::PERIPHERAL_READY);
    }

    /// Claim every pending event bit and run one dispatch pass over them.
    ///
    /// Bits the pass did not service are latched back into the shared mask;
    /// bits set concurrently (e.g. by an interrupt) during the pass are
    /// untouched and picked up next time. Returns the unserviced bits.
    pub fn dispatch_pending(&self) -> EventSet {
        let taken = EventSet::from_raw(self.events.take_all());
        if taken.is_empty() {
            return EventSet::EMPTY;
        }
        let remaining = self.dispatch(taken);
        if !remaining.is_empty() {
            self.events.set(remaining.raw());
        }
        remaining
    }

    /// Service the highest-priority category present in `events` and return
    /// the rest.
    pub fn dispatch(&self, events: EventSet) -> EventSet {
        let events = events.known();
        if events.is_empty() {
            return EventSet::EMPTY;
        }

        if events.contains(bits::SYS_MESSAGE) {
            self.service_message();
            return events.without(bits::SYS_MESSAGE);
        }

        if events.contains(bits::STARTUP) {
            self.service_startup();
            return events.without(bits::STARTUP);
        }

        if events.contains(bits::CHANNEL_DRAIN) {
            if self.service_drain() {
                return events.without(bits::CHANNEL_DRAIN);
            }
            // Transient delivery failure: keep the bit, retry next pass.
            return events;
        }

        if events.contains(bits::INPUT_AVAILABLE) {
            self.engine.run_main_loop();
            return events.without(bits::INPUT_AVAILABLE);
        }

        let interrupts = events.raw() & bits::INTERRUPT_ALL;
        if interrupts != 0 {
            self.service_interrupts(interrupts);
            return events.without(interrupts);
        }

        let timers = events.raw() & bits::TIMER_ALL;
        if timers != 0 {
            self.service_timers(timers);
            return events.without(timers);
        }

        if events.contains(bits::SERIAL_READY) {
            self.service_serial();
            return events.without(bits::SERIAL_READY);
        }

        if events.contains(bits::PERIPHERAL_READY) {
            self.service_bus();
            return events.without(bits::PERIPHERAL_READY);
        }

        EventSet::EMPTY
    }

    fn console(&self) -> Option<&ConsoleParts> {
        self.console.get().and_then(|parts| parts.as_ref())
    }

    /// Drain one queued system message; re-latch the bit if more remain.
    fn service_message(&self) {
        let mut queue = self.messages.lock();
        if let Some(msg) = queue.pop_front() {
            trace!("system message discarded ({} bytes)", msg.len());
        }
        if !queue.is_empty() {
            self.events.set(bits::SYS_MESSAGE);
        }
    }

    /// One-time device bring-up. The event bit is cleared unconditionally by
    /// the caller; a second latch of the bit is a no-op here.
    fn service_startup(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = match self.me.get().and_then(Weak::upgrade) {
            Some(me) => me,
            None => return,
        };

        self.link.register_endpoint(me.clone());

        self.console.call_once(|| match self.build_console(me) {
            Ok(parts) => Some(parts),
            Err(err) => {
                warn!("console disabled for this session: {:?}", err);
                None
            }
        });

        self.engine.setup();
        debug!("device startup complete");
    }

    fn build_console(&self, me: Arc<EventDispatcher>) -> AxResult<ConsoleParts> {
        let channel = NotificationChannel::try_new(
            self.link.max_payload(),
            self.config.ring_multiplier,
            self.events.clone(),
        )?;
        channel.set_pump(me);
        let subs = SubscriptionTable::try_new(self.link.peer_slots())?;
        let monitor = ConnectionMonitor::new(
            subs,
            channel.clone(),
            self.engine.clone(),
            self.timers.clone(),
            self.events.clone(),
        );
        Ok(ConsoleParts { channel, monitor })
    }

    /// Returns `false` on a transient delivery failure (bytes retained).
    fn service_drain(&self) -> bool {
        let Some(parts) = self.console() else {
            return true;
        };
        match parts.channel.drain(&*self.link) {
            Ok(delivered) => {
                if delivered > 0 {
                    trace!("delivered {} console bytes", delivered);
                }
                true
            }
            Err(err) => {
                debug!("console drain deferred: {:?}", err);
                false
            }
        }
    }

    fn service_interrupts(&self, raw: u32) {
        for slot in 0..MAX_INTERRUPT {
            if raw & bits::interrupt(slot) == 0 {
                continue;
            }
            if let Some(line) = self.tables.interrupts.line(slot) {
                trace!("interrupt slot {} -> line {}", slot, line);
                self.engine.run_at_line(line, true);
            }
        }
    }

    fn service_timers(&self, raw: u32) {
        for slot in 0..MAX_TIMER {
            if raw & bits::timer(slot) == 0 {
                continue;
            }
            if let Some(line) = self.tables.timers.line(slot) {
                // The delay slot completes in the background so it cannot
                // preempt an in-progress interactive command.
                let foreground = slot != DELAY_TIMER;
                trace!("timer slot {} -> line {}", slot, line);
                self.engine.run_at_line(line, foreground);
            }
        }
    }

    fn service_serial(&self) {
        let Some(serial) = &self.serial else {
            return;
        };
        let (on_read, on_write) = self.tables.serial.lines();
        if let Some(line) = on_read {
            if serial.rx_available() > 0 {
                self.engine.run_at_line(line, true);
            }
        }
        if let Some(line) = on_write {
            if serial.tx_capacity() > 0 {
                self.engine.run_at_line(line, true);
            }
        }
    }

    fn service_bus(&self) {
        let Some(bus) = &self.bus else {
            return;
        };
        let (on_read, on_write) = self.tables.bus.lines();
        let available = bus.available_bytes();
        if let Some(line) = on_read {
            if available > 0 {
                self.engine.run_at_line(line, true);
            }
        }
        // An empty read buffer after completion means the prior operation
        // was a write: the bus is idle again.
        if let Some(line) = on_write {
            if available == 0 {
                self.engine.run_at_line(line, true);
            }
        }
    }

    fn notify_observer(&self, peer: usize, change: LinkChange) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.connection_status(peer, change);
        }
    }
}

impl DispatchPump for EventDispatcher {
    fn pump_once(&self) {
        let _ = self.dispatch_pending();
    }
}

impl LinkEndpoint for EventDispatcher {
    fn on_subscription_write(&self, peer: usize, notify_on: bool) {
        if let Some(parts) = self.console() {
            parts.monitor.subscription_write(peer, notify_on);
        }
    }

    fn on_console_input(&self, data: &[u8]) {
        let mut accepted = false;
        for &byte in data {
            accepted |= self.engine.consume_byte(byte);
        }
        if accepted {
            self.events.set(bits::INPUT_AVAILABLE);
        }
    }

    fn on_link_changed(&self, peer: usize, change: LinkChange) {
        if peer == self.config.loopback_peer {
            return;
        }
        if change.is_withdrawal() {
            if let Some(parts) = self.console() {
                parts.monitor.withdraw(peer);
            }
        }
        self.notify_observer(peer, change);
    }

    fn on_device_found(
        &self,
        addr_type: u8,
        addr: &[u8; 6],
        rssi: i8,
        event_type: u8,
        data: &[u8],
    ) {
        self.engine.on_device_found(addr_type, addr, rssi, event_type, data);
    }

    fn on_rssi(&self, rssi: i8) {
        self.notify_observer(0, LinkChange::Rssi(rssi));
    }
}
