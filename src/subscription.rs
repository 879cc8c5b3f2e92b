//! Per-peer subscription bookkeeping and channel enablement.
//!
//! Each link-layer peer slot carries one notify-on/notify-off value, written
//! by the peer through its client configuration and cleared when the peer
//! disappears. The notification channel is enabled exactly while at least
//! one peer wants notifications, and the enable state is recomputed on every
//! subscription write and every link-membership change.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use axerrno::{AxResult, ax_err};

use crate::channel::NotificationChannel;
use crate::config::DELAY_TIMER;
use crate::events::{EventMask, bits};
use crate::{ScriptEngine, TimerService};

/// One "wants notifications" flag per concurrent peer slot.
pub struct SubscriptionTable {
    peers: Box<[AtomicBool]>,
}

impl SubscriptionTable {
    /// Allocate a table for `peer_slots` concurrent connections.
    ///
    /// Allocation is fallible: on failure the console feature degrades for
    /// the session while the rest of the core keeps running.
    pub fn try_new(peer_slots: usize) -> AxResult<Self> {
        let mut peers = Vec::new();
        if peers.try_reserve_exact(peer_slots).is_err() {
            return ax_err!(NoMemory, "subscription table allocation failed");
        }
        peers.resize_with(peer_slots, || AtomicBool::new(false));
        Ok(Self {
            peers: peers.into_boxed_slice(),
        })
    }

    /// Number of peer slots.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Record `peer`'s last-written subscription state.
    pub fn set(&self, peer: usize, wants_notify: bool) {
        match self.peers.get(peer) {
            Some(entry) => entry.store(wants_notify, Ordering::Release),
            None => warn!("subscription write for unknown peer slot {}", peer),
        }
    }

    /// Reset `peer` to the neutral (unsubscribed) state.
    pub fn clear(&self, peer: usize) {
        if let Some(entry) = self.peers.get(peer) {
            entry.store(false, Ordering::Release);
        }
    }

    /// Whether any peer currently wants notifications.
    pub fn any_active(&self) -> bool {
        self.peers
            .iter()
            .any(|entry| entry.load(Ordering::Acquire))
    }
}

/// Tracks subscription and link-membership changes and flips the
/// notification channel accordingly.
pub struct ConnectionMonitor {
    subs: SubscriptionTable,
    channel: Arc<NotificationChannel>,
    engine: Arc<dyn ScriptEngine>,
    timers: Arc<dyn TimerService>,
    events: Arc<EventMask>,
}

impl ConnectionMonitor {
    pub fn new(
        subs: SubscriptionTable,
        channel: Arc<NotificationChannel>,
        engine: Arc<dyn ScriptEngine>,
        timers: Arc<dyn TimerService>,
        events: Arc<EventMask>,
    ) -> Self {
        Self {
            subs,
            channel,
            engine,
            timers,
            events,
        }
    }

    /// A peer wrote its notify configuration value.
    pub fn subscription_write(&self, peer: usize, notify_on: bool) {
        let was_enabled = self.subs.any_active();
        self.subs.set(peer, notify_on);
        self.apply_transition(was_enabled);
    }

    /// Withdraw `peer`'s subscription because its link went away.
    pub fn withdraw(&self, peer: usize) {
        let was_enabled = self.subs.any_active();
        self.subs.clear(peer);
        self.apply_transition(was_enabled);
    }

    /// Access to the underlying table.
    pub fn table(&self) -> &SubscriptionTable {
        &self.subs
    }

    fn apply_transition(&self, was_enabled: bool) {
        let now_enabled = self.subs.any_active();
        if !was_enabled && now_enabled {
            // A fresh session: drop pre-subscription output and make sure the
            // tail of an in-flight delay cannot fire into it.
            self.channel.enable_fresh();
            self.timers.stop(DELAY_TIMER);
            self.events.clear(bits::timer(DELAY_TIMER));
            self.engine.print_banner();
            debug!("console enabled (first subscriber)");
        } else if was_enabled && !now_enabled {
            self.channel.disable();
            debug!("console disabled (last subscriber gone)");
        }
    }
}
