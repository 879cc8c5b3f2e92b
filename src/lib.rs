#![no_std]

//! # MicroBasic Event Core
//!
//! This crate provides the event-dispatch and console-notification core for a
//! BASIC-style scripting runtime on a wireless microcontroller. It is designed
//! for `no_std` environments and uses the `alloc` crate for the few
//! construction-time allocations it needs.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  pin change / bus signal (interrupt context)
//! │ InterruptRouter│───────────┐
//! └────────────────┘           ▼
//!                        ┌───────────┐
//!   timers, UART,        │ EventMask │  atomic pending-event bitset
//!   system messages ────▶│ (shared)  │
//!                        └─────┬─────┘
//!                              │ snapshot / take
//!                              ▼
//!                    ┌─────────────────┐   run_at_line / run_main_loop
//!                    │ EventDispatcher │──────────────▶ ScriptEngine
//!                    └────────┬────────┘
//!                             │ drain
//!                             ▼
//!                  ┌─────────────────────┐   deliver(batch)
//!                  │ NotificationChannel │──────────────▶ LinkTransport
//!                  └──────────┬──────────┘
//!                             │ enable / reset
//!                   ┌─────────┴─────────┐
//!                   │ ConnectionMonitor │◀── subscription writes, link changes
//!                   └───────────────────┘
//! ```
//!
//! ### Core Infrastructure
//! - [`EventMask`]: lock-free pending-event bitset shared with interrupt context
//! - [`HandlerTables`]: fixed-slot script-handler tables (interrupts, timers, serial, bus)
//! - [`NotifyRing`]: single-producer/single-consumer byte ring for console output
//!
//! ### Components
//! - [`InterruptRouter`]: translates raw pin-change interrupts into event bits
//! - [`EventDispatcher`]: services pending events in fixed priority order
//! - [`NotificationChannel`]: flow-controlled outbound console byte stream
//! - [`ConnectionMonitor`]: per-peer subscription bookkeeping and channel enablement
//!
//! ## Collaborators
//!
//! The wireless stack, the script engine, and the hardware drivers stay outside
//! this crate and are reached through the traits below. The link layer calls
//! back into the core through [`LinkEndpoint`], which the dispatcher registers
//! once during startup.
//!
//! ## Example
//!
//! ```rust,ignore
//! use microbasic_core::DispatcherBuilder;
//!
//! let core = DispatcherBuilder::new(engine, link, timers)
//!     .with_serial(uart)
//!     .build();
//!
//! // Main loop: service whatever is pending, then sleep until the next event.
//! loop {
//!     while !core.dispatch_pending().is_empty() {}
//!     wait_for_event();
//! }
//! ```

extern crate alloc;
#[macro_use]
extern crate log;

#[cfg(test)]
extern crate std;

mod channel;
mod config;
mod dispatch;
mod events;
mod ring;
mod router;
mod subscription;
mod tables;

pub use channel::NotificationChannel;
pub use config::{CoreConfig, DELAY_TIMER, MAX_INTERRUPT, MAX_SEGMENT, MAX_TIMER};
pub use dispatch::{DispatcherBuilder, EventDispatcher, SysMessage};
pub use events::{EventMask, EventSet, bits};
pub use ring::NotifyRing;
pub use router::InterruptRouter;
pub use subscription::{ConnectionMonitor, SubscriptionTable};
pub use tables::{HandlerTables, InterruptTable, IoHandlers, PinId, TimerTable};

use alloc::sync::Arc;
use axerrno::AxResult;

/// A change in the state of one link-layer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChange {
    /// A new connection was established.
    Established,
    /// The connection is no longer up but still occupies its slot.
    Down,
    /// The connection slot was torn down.
    Removed,
    /// A fresh signal-strength reading for the active connection.
    Rssi(i8),
}

impl LinkChange {
    /// Whether this change withdraws the peer from the notification session.
    #[inline]
    pub fn is_withdrawal(&self) -> bool {
        matches!(self, LinkChange::Down | LinkChange::Removed)
    }
}

/// Entry points of the script engine consumed by the dispatcher.
///
/// The engine's parsing and execution semantics are entirely its own; the
/// core only decides *when* each entry point runs.
pub trait ScriptEngine: Send + Sync {
    /// One-time engine initialization, run during device startup.
    fn setup(&self);

    /// Process buffered script input (the interactive main loop).
    fn run_main_loop(&self);

    /// Run the script starting at `line`.
    ///
    /// A `foreground` invocation may preempt an in-progress delay; a
    /// background one completes without disturbing it.
    fn run_at_line(&self, line: u16, foreground: bool);

    /// An advertisement was observed while scanning.
    fn on_device_found(&self, addr_type: u8, addr: &[u8; 6], rssi: i8, event_type: u8, data: &[u8]);

    /// Print the interactive console banner.
    fn print_banner(&self);

    /// Feed one byte of console input. Returns whether the byte was accepted.
    fn consume_byte(&self, byte: u8) -> bool;
}

/// The outbound side of the wireless link, as seen by this core.
///
/// Connection establishment, pairing and attribute registration all live in
/// the wireless stack; the core only needs the negotiated limits and a way to
/// hand off one notification batch.
pub trait LinkTransport: Send + Sync {
    /// Number of concurrent peer slots the link layer supports.
    fn peer_slots(&self) -> usize;

    /// Largest payload one notification transfer can carry
    /// (negotiated transfer unit minus the fixed header overhead).
    fn max_payload(&self) -> usize;

    /// Hand one batch of console bytes to the delivery path.
    ///
    /// A transient failure is reported as an error; the caller retries the
    /// same bytes on a later dispatch pass.
    fn deliver(&self, payload: &[u8]) -> AxResult;

    /// Register the core's endpoint for inbound link events. Called once
    /// during startup.
    fn register_endpoint(&self, endpoint: Arc<dyn LinkEndpoint>);
}

/// Inbound link events, implemented by the core and registered with the
/// link layer via [`LinkTransport::register_endpoint`].
pub trait LinkEndpoint: Send + Sync {
    /// A peer wrote its notify-on/notify-off configuration value.
    fn on_subscription_write(&self, peer: usize, notify_on: bool);

    /// A peer wrote console input bytes.
    fn on_console_input(&self, data: &[u8]);

    /// Link membership changed for `peer`.
    fn on_link_changed(&self, peer: usize, change: LinkChange);

    /// An advertisement was observed while scanning.
    fn on_device_found(&self, addr_type: u8, addr: &[u8; 6], rssi: i8, event_type: u8, data: &[u8]);

    /// A signal-strength reading arrived from the controller.
    fn on_rssi(&self, rssi: i8);
}

/// Control over the hardware timer slots backing the script's timers.
pub trait TimerService: Send + Sync {
    /// Cancel the timer running in `slot`, if any.
    fn stop(&self, slot: usize);
}

/// Receive/transmit status of the UART, polled when its event bit fires.
pub trait SerialStatus: Send + Sync {
    /// Bytes waiting in the receive buffer.
    fn rx_available(&self) -> usize;

    /// Free space in the transmit buffer.
    fn tx_capacity(&self) -> usize;
}

/// Status of the optional bus peripheral (e.g. an I²C engine).
pub trait BusStatus: Send + Sync {
    /// Bytes the peripheral has ready to read. A count of zero after a
    /// completed transaction means the prior operation was a write.
    fn available_bytes(&self) -> usize;
}

/// One hardware pin port, as visible from its interrupt handler.
///
/// Implementations read the port's interrupt-flag and interrupt-enable
/// registers and acknowledge pending flags. Nothing here may block.
pub trait InterruptPort {
    /// The port's raw interrupt-flag register.
    fn pending(&self) -> u8;

    /// The port's interrupt-enable register.
    fn enabled(&self) -> u8;

    /// Clear the given hardware-level pending flags.
    fn acknowledge(&self, mask: u8);
}

/// Application hook receiving generic connection-status updates.
pub trait StatusObserver: Send + Sync {
    fn connection_status(&self, peer: usize, change: LinkChange);
}

/// One cooperative dispatch pass, used by the notification channel as its
/// backpressure yield point while waiting for buffer space.
pub trait DispatchPump: Send + Sync {
    fn pump_once(&self);
}
