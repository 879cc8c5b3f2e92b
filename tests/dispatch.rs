use std::sync::{Arc, Mutex};
use std::vec::Vec;

use axerrno::{AxResult, ax_err};
use microbasic_core::{
    DELAY_TIMER, DispatcherBuilder, EventDispatcher, InterruptPort, LinkChange, LinkEndpoint,
    LinkTransport, PinId, ScriptEngine, SerialStatus, StatusObserver, TimerService, bits,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineCall {
    Setup,
    MainLoop,
    RunAt(u16, bool),
    Banner,
}

struct MockEngine {
    calls: Mutex<Vec<EngineCall>>,
}

impl MockEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ScriptEngine for MockEngine {
    fn setup(&self) {
        self.calls.lock().unwrap().push(EngineCall::Setup);
    }

    fn run_main_loop(&self) {
        self.calls.lock().unwrap().push(EngineCall::MainLoop);
    }

    fn run_at_line(&self, line: u16, foreground: bool) {
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::RunAt(line, foreground));
    }

    fn on_device_found(
        &self,
        _addr_type: u8,
        _addr: &[u8; 6],
        _rssi: i8,
        _event_type: u8,
        _data: &[u8],
    ) {
    }

    fn print_banner(&self) {
        self.calls.lock().unwrap().push(EngineCall::Banner);
    }

    fn consume_byte(&self, _byte: u8) -> bool {
        true
    }
}

struct MockLink {
    payload: usize,
    delivered: Mutex<Vec<u8>>,
    /// Number of upcoming deliver calls to refuse.
    refuse: Mutex<usize>,
    endpoint: Mutex<Option<Arc<dyn LinkEndpoint>>>,
}

impl MockLink {
    fn new(payload: usize) -> Arc<Self> {
        Arc::new(Self {
            payload,
            delivered: Mutex::new(Vec::new()),
            refuse: Mutex::new(0),
            endpoint: Mutex::new(None),
        })
    }

    fn delivered(&self) -> Vec<u8> {
        self.delivered.lock().unwrap().clone()
    }
}

impl LinkTransport for MockLink {
    fn peer_slots(&self) -> usize {
        3
    }

    fn max_payload(&self) -> usize {
        self.payload
    }

    fn deliver(&self, payload: &[u8]) -> AxResult {
        let mut refuse = self.refuse.lock().unwrap();
        if *refuse > 0 {
            *refuse -= 1;
            return ax_err!(WouldBlock, "radio busy");
        }
        self.delivered.lock().unwrap().extend_from_slice(payload);
        Ok(())
    }

    fn register_endpoint(&self, endpoint: Arc<dyn LinkEndpoint>) {
        *self.endpoint.lock().unwrap() = Some(endpoint);
    }
}

struct MockTimers {
    stopped: Mutex<Vec<usize>>,
}

impl MockTimers {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            stopped: Mutex::new(Vec::new()),
        })
    }
}

impl TimerService for MockTimers {
    fn stop(&self, slot: usize) {
        self.stopped.lock().unwrap().push(slot);
    }
}

struct MockSerial {
    rx: Mutex<usize>,
    tx_free: Mutex<usize>,
}

impl SerialStatus for MockSerial {
    fn rx_available(&self) -> usize {
        *self.rx.lock().unwrap()
    }

    fn tx_capacity(&self) -> usize {
        *self.tx_free.lock().unwrap()
    }
}

struct MockBus {
    available: Mutex<usize>,
}

impl microbasic_core::BusStatus for MockBus {
    fn available_bytes(&self) -> usize {
        *self.available.lock().unwrap()
    }
}

struct MockPort {
    pending: u8,
    enabled: u8,
    acked: Mutex<u8>,
}

impl InterruptPort for MockPort {
    fn pending(&self) -> u8 {
        self.pending
    }

    fn enabled(&self) -> u8 {
        self.enabled
    }

    fn acknowledge(&self, mask: u8) {
        *self.acked.lock().unwrap() |= mask;
    }
}

struct Recorder {
    seen: Mutex<Vec<(usize, LinkChange)>>,
}

impl StatusObserver for Recorder {
    fn connection_status(&self, peer: usize, change: LinkChange) {
        self.seen.lock().unwrap().push((peer, change));
    }
}

fn run_until_idle(core: &EventDispatcher) {
    for _ in 0..64 {
        if core.dispatch_pending().is_empty() && core.events().snapshot() == 0 {
            return;
        }
    }
    panic!("dispatcher did not go idle");
}

fn started_core(
    engine: Arc<MockEngine>,
    link: Arc<MockLink>,
    timers: Arc<MockTimers>,
) -> Arc<EventDispatcher> {
    let core = DispatcherBuilder::new(engine, link, timers).build();
    run_until_idle(&core);
    core
}

#[test]
fn test_startup_registers_endpoint_and_runs_setup() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let core = started_core(engine.clone(), link.clone(), MockTimers::new());

    assert_eq!(engine.calls(), vec![EngineCall::Setup]);
    assert!(link.endpoint.lock().unwrap().is_some());
    assert!(!core.console_enabled());
}

#[test]
fn test_priority_order_interrupt_timer_serial() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let serial = Arc::new(MockSerial {
        rx: Mutex::new(4),
        tx_free: Mutex::new(0),
    });
    let core = DispatcherBuilder::new(engine.clone(), link, MockTimers::new())
        .with_serial(serial)
        .build();
    run_until_idle(&core);
    engine.calls.lock().unwrap().clear();

    core.tables()
        .interrupts
        .register(2, 200, PinId::new(0, 2))
        .unwrap();
    core.tables().timers.register(0, 300).unwrap();
    core.tables().serial.set_on_read(400);

    // All three conditions latched at once.
    core.events()
        .set(bits::interrupt(2) | bits::timer(0) | bits::SERIAL_READY);
    run_until_idle(&core);

    // Interrupt first, then the timer (the delay slot runs in background),
    // then the serial read handler.
    assert_eq!(
        engine.calls(),
        vec![
            EngineCall::RunAt(200, true),
            EngineCall::RunAt(300, false),
            EngineCall::RunAt(400, true),
        ]
    );
}

#[test]
fn test_single_category_per_invocation() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let core = started_core(engine.clone(), link, MockTimers::new());
    engine.calls.lock().unwrap().clear();

    core.tables()
        .interrupts
        .register(0, 100, PinId::new(0, 0))
        .unwrap();
    core.tables().timers.register(1, 110).unwrap();

    core.events().set(bits::interrupt(0) | bits::timer(1));
    let remaining = core.dispatch_pending();

    // One invocation services only the interrupt category; the timer bit
    // comes back for the next pass.
    assert_eq!(engine.calls(), vec![EngineCall::RunAt(100, true)]);
    assert!(remaining.contains(bits::timer(1)));
    assert!(core.events().is_pending(bits::timer(1)));
}

#[test]
fn test_interrupt_routing_by_pin_group() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let core = started_core(engine.clone(), link, MockTimers::new());

    core.tables()
        .interrupts
        .register(5, 150, PinId::new(1, 3))
        .unwrap();
    let router = core.interrupt_router();

    // Port 1 fires with only bit 3 set: exactly interrupt slot 5 latches.
    let port = MockPort {
        pending: 0b0000_1000,
        enabled: 0xff,
        acked: Mutex::new(0),
    };
    router.port_signal(1, &port);
    assert_eq!(core.events().snapshot(), bits::interrupt(5));
    assert_eq!(*port.acked.lock().unwrap(), 0b0000_1000);

    engine.calls.lock().unwrap().clear();
    run_until_idle(&core);
    assert_eq!(engine.calls(), vec![EngineCall::RunAt(150, true)]);
}

#[test]
fn test_subscription_or_semantics() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let core = started_core(engine.clone(), link, MockTimers::new());

    core.on_subscription_write(0, true);
    core.on_subscription_write(1, true);
    assert!(core.console_enabled());

    core.on_subscription_write(0, false);
    assert!(core.console_enabled());

    core.on_subscription_write(1, false);
    assert!(!core.console_enabled());
}

#[test]
fn test_first_subscriber_banner_and_delay_timer_kill() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let timers = MockTimers::new();
    let core = started_core(engine.clone(), link, timers.clone());
    engine.calls.lock().unwrap().clear();

    // A delay expiry latched before the subscription must not fire into the
    // fresh session.
    core.events().set(bits::timer(DELAY_TIMER));
    core.on_subscription_write(0, true);

    assert_eq!(engine.calls(), vec![EngineCall::Banner]);
    assert_eq!(timers.stopped.lock().unwrap().as_slice(), &[DELAY_TIMER]);
    assert!(!core.events().is_pending(bits::timer(DELAY_TIMER)));
}

#[test]
fn test_console_output_flows_to_link_in_order() {
    let engine = MockEngine::new();
    let link = MockLink::new(8);
    let core = started_core(engine.clone(), link.clone(), MockTimers::new());

    core.on_subscription_write(0, true);
    for b in b"READY\n>" {
        core.console_write(*b);
    }
    run_until_idle(&core);

    assert_eq!(link.delivered(), b"READY\n>".to_vec());
}

#[test]
fn test_disabled_console_discards_output() {
    let engine = MockEngine::new();
    let link = MockLink::new(8);
    let core = started_core(engine, link.clone(), MockTimers::new());

    for b in 0..40u8 {
        core.console_write(b);
    }
    run_until_idle(&core);
    assert!(link.delivered().is_empty());
}

#[test]
fn test_resubscription_drops_pre_session_output() {
    let engine = MockEngine::new();
    let link = MockLink::new(8);
    let core = started_core(engine, link.clone(), MockTimers::new());

    core.on_subscription_write(0, true);
    core.console_write(b'a');
    core.on_subscription_write(0, false);

    // 'a' is still buffered but the new session starts clean.
    core.on_subscription_write(1, true);
    core.console_write(b'b');
    run_until_idle(&core);

    assert_eq!(link.delivered(), vec![b'b']);
}

#[test]
fn test_transient_delivery_failure_retries_without_loss() {
    let engine = MockEngine::new();
    let link = MockLink::new(8);
    let core = started_core(engine, link.clone(), MockTimers::new());

    core.on_subscription_write(0, true);
    *link.refuse.lock().unwrap() = 1;
    for b in b"hold" {
        core.console_write(*b);
    }

    // First pass fails and keeps the drain bit latched.
    let remaining = core.dispatch_pending();
    assert!(remaining.contains(bits::CHANNEL_DRAIN));
    assert!(link.delivered().is_empty());

    run_until_idle(&core);
    assert_eq!(link.delivered(), b"hold".to_vec());
}

#[test]
fn test_backpressure_blocks_writer_until_drained() {
    let engine = MockEngine::new();
    // Payload 21 with multiplier 1: 21 usable bytes in the ring.
    let link = MockLink::new(21);
    let core = started_core(engine, link.clone(), MockTimers::new());

    core.on_subscription_write(0, true);

    // 25 bytes through a 21-byte buffer: bytes 22..=25 must yield into the
    // dispatcher, which drains to the link; completion order is unchanged.
    let written: Vec<u8> = (0..25).collect();
    for b in &written {
        core.console_write(*b);
    }
    run_until_idle(&core);

    assert_eq!(link.delivered(), written);
}

#[test]
fn test_serial_handlers_fire_on_status() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let serial = Arc::new(MockSerial {
        rx: Mutex::new(0),
        tx_free: Mutex::new(16),
    });
    let core = DispatcherBuilder::new(engine.clone(), link, MockTimers::new())
        .with_serial(serial.clone())
        .build();
    run_until_idle(&core);
    engine.calls.lock().unwrap().clear();

    core.tables().serial.set_on_read(500);
    core.tables().serial.set_on_write(510);

    // Nothing received: only the write handler runs.
    core.post_serial_ready();
    run_until_idle(&core);
    assert_eq!(engine.calls(), vec![EngineCall::RunAt(510, true)]);

    // With receive data and transmit capacity both handlers run in one pass.
    engine.calls.lock().unwrap().clear();
    *serial.rx.lock().unwrap() = 3;
    core.post_serial_ready();
    run_until_idle(&core);
    assert_eq!(
        engine.calls(),
        vec![EngineCall::RunAt(500, true), EngineCall::RunAt(510, true)]
    );
}

#[test]
fn test_bus_write_handler_fires_only_when_idle() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let bus = Arc::new(MockBus {
        available: Mutex::new(4),
    });
    let core = DispatcherBuilder::new(engine.clone(), link, MockTimers::new())
        .with_bus(bus.clone())
        .build();
    run_until_idle(&core);
    engine.calls.lock().unwrap().clear();

    core.tables().bus.set_on_read(600);
    core.tables().bus.set_on_write(610);

    // Bytes available: the read handler fires, the write handler must not.
    core.post_peripheral_ready();
    run_until_idle(&core);
    assert_eq!(engine.calls(), vec![EngineCall::RunAt(600, true)]);

    // Zero available bytes after completion: the prior operation was a
    // write, so only the write handler fires.
    engine.calls.lock().unwrap().clear();
    *bus.available.lock().unwrap() = 0;
    core.post_peripheral_ready();
    run_until_idle(&core);
    assert_eq!(engine.calls(), vec![EngineCall::RunAt(610, true)]);
}

#[test]
fn test_link_changes_forwarded_to_observer() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
    });
    let core = DispatcherBuilder::new(engine, link, MockTimers::new())
        .with_observer(recorder.clone())
        .build();
    run_until_idle(&core);

    core.on_subscription_write(2, true);
    core.on_link_changed(2, LinkChange::Removed);
    core.on_rssi(-61);

    assert!(!core.console_enabled());
    assert_eq!(
        recorder.seen.lock().unwrap().as_slice(),
        &[(2, LinkChange::Removed), (0, LinkChange::Rssi(-61))]
    );
}

#[test]
fn test_loopback_peer_changes_are_dropped() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
    });
    let core = DispatcherBuilder::new(engine, link, MockTimers::new())
        .with_observer(recorder.clone())
        .build();
    run_until_idle(&core);

    core.on_link_changed(usize::MAX, LinkChange::Down);
    assert!(recorder.seen.lock().unwrap().is_empty());
}

#[test]
fn test_failed_console_bringup_degrades_gracefully() {
    let engine = MockEngine::new();
    // A zero payload limit makes console bring-up fail during startup.
    let link = MockLink::new(0);
    let core = started_core(engine.clone(), link.clone(), MockTimers::new());

    assert_eq!(engine.calls(), vec![EngineCall::Setup]);
    assert!(!core.console_enabled());

    // Console paths are inert...
    core.on_subscription_write(0, true);
    core.console_write(b'x');
    assert!(!core.console_enabled());
    assert!(link.delivered().is_empty());

    // ...while every other category keeps working.
    engine.calls.lock().unwrap().clear();
    core.tables().timers.register(1, 700).unwrap();
    core.post_timer(1).unwrap();
    run_until_idle(&core);
    assert_eq!(engine.calls(), vec![EngineCall::RunAt(700, true)]);
}

#[test]
fn test_console_input_drives_main_loop() {
    let engine = MockEngine::new();
    let link = MockLink::new(20);
    let core = started_core(engine.clone(), link, MockTimers::new());
    engine.calls.lock().unwrap().clear();

    core.on_console_input(b"LIST\n");
    run_until_idle(&core);
    assert_eq!(engine.calls(), vec![EngineCall::MainLoop]);
}
