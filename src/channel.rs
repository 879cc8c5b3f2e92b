//! The flow-controlled console notification channel.
//!
//! Script output bytes are buffered in an SPSC ring and drained
//! opportunistically to the wireless link in batches no larger than the
//! negotiated payload. Writers never fail: with no subscriber the byte is
//! discarded, and with a full buffer the writer yields into the dispatcher
//! (which drains the ring) until space appears.
//!
//! The dispatcher pump is injected after construction, mirroring how the
//! drain scheduling bit is owned by the dispatcher while the bytes are owned
//! here.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;
use arrayvec::ArrayVec;
use axerrno::{AxResult, ax_err};
use spin::RwLock;

use crate::config::MAX_SEGMENT;
use crate::events::{EventMask, bits};
use crate::ring::NotifyRing;
use crate::{DispatchPump, LinkTransport};

/// Buffered outbound console bytes plus the subscription-derived enable flag.
pub struct NotificationChannel {
    ring: NotifyRing,
    enabled: AtomicBool,
    events: Arc<EventMask>,
    /// Batch ceiling for one delivery, `<= MAX_SEGMENT`.
    max_batch: usize,
    /// Dispatcher re-entry point for the capacity wait.
    pump: RwLock<Option<Arc<dyn DispatchPump>>>,
    /// Guard against a write inside a pump pumping again.
    pumping: AtomicBool,
}

impl NotificationChannel {
    /// Create a channel sized for `max_payload`-byte deliveries, buffering
    /// `max_payload * ring_multiplier` usable bytes.
    pub fn try_new(
        max_payload: usize,
        ring_multiplier: usize,
        events: Arc<EventMask>,
    ) -> AxResult<Arc<Self>> {
        if max_payload == 0 {
            return ax_err!(InvalidInput, "link payload limit is zero");
        }
        let max_batch = max_payload.min(MAX_SEGMENT);
        let ring = NotifyRing::try_new(max_batch * ring_multiplier.max(1) + 1)?;
        Ok(Arc::new(Self {
            ring,
            enabled: AtomicBool::new(false),
            events,
            max_batch,
            pump: RwLock::new(None),
            pumping: AtomicBool::new(false),
        }))
    }

    /// Inject the dispatcher used as the backpressure yield point.
    pub fn set_pump(&self, pump: Arc<dyn DispatchPump>) {
        *self.pump.write() = Some(pump);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Bytes currently buffered.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Enable delivery for a fresh session: stale output buffered before the
    /// subscription is discarded first.
    pub(crate) fn enable_fresh(&self) {
        self.ring.reset();
        self.enabled.store(true, Ordering::Release);
    }

    /// Disable delivery. Buffered bytes are left in place; a drain already
    /// scheduled for the transition moment is still attempted once.
    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Append one script-produced byte for asynchronous delivery.
    ///
    /// With no subscriber the byte is discarded. With a full buffer the call
    /// yields into the dispatcher until the drain path frees space; if no
    /// dispatcher progress is possible (none injected, or this write already
    /// sits inside a dispatch pass that cannot be re-entered) the byte is
    /// dropped instead of deadlocking.
    pub fn write(&self, byte: u8) {
        if !self.is_enabled() {
            return;
        }
        while self.ring.is_full() {
            if !self.pump_once() {
                warn!("console byte dropped: dispatcher cannot make progress");
                return;
            }
        }
        // The drain request is raised on the empty->non-empty edge; for the
        // rest of the burst the bit is already set.
        if self.ring.is_empty() {
            self.events.set(bits::CHANNEL_DRAIN);
        }
        let _ = self.ring.push(byte);
    }

    fn pump_once(&self) -> bool {
        let pump = match self.pump.read().clone() {
            Some(pump) => pump,
            None => return false,
        };
        if self.pumping.swap(true, Ordering::Acquire) {
            return false;
        }
        pump.pump_once();
        self.pumping.store(false, Ordering::Release);
        true
    }

    /// Hand buffered bytes to the delivery path in FIFO batches.
    ///
    /// The read cursor advances only past bytes whose batch was accepted, so
    /// a transient delivery failure loses nothing and never reorders: the
    /// error propagates and the remainder is retried on a later pass.
    pub fn drain(&self, link: &dyn LinkTransport) -> AxResult<usize> {
        let mut delivered = 0;
        loop {
            let mut batch = ArrayVec::<u8, MAX_SEGMENT>::new();
            let n = self.ring.peek_with(self.max_batch, |b| batch.push(b));
            if n == 0 {
                return Ok(delivered);
            }
            link.deliver(&batch)?;
            self.ring.release(n);
            delivered += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    struct FlakyLink {
        sent: spin::Mutex<Vec<u8>>,
        failures_left: spin::Mutex<usize>,
    }

    impl FlakyLink {
        fn new(failures: usize) -> Self {
            Self {
                sent: spin::Mutex::new(Vec::new()),
                failures_left: spin::Mutex::new(failures),
            }
        }
    }

    impl LinkTransport for FlakyLink {
        fn peer_slots(&self) -> usize {
            1
        }
        fn max_payload(&self) -> usize {
            4
        }
        fn deliver(&self, payload: &[u8]) -> AxResult {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return ax_err!(WouldBlock, "radio busy");
            }
            self.sent.lock().extend_from_slice(payload);
            Ok(())
        }
        fn register_endpoint(&self, _endpoint: Arc<dyn crate::LinkEndpoint>) {}
    }

    fn channel() -> Arc<NotificationChannel> {
        NotificationChannel::try_new(4, 2, Arc::new(EventMask::new())).unwrap()
    }

    #[test]
    fn test_disabled_channel_discards_writes() {
        let chan = channel();
        for b in 0..20 {
            chan.write(b);
        }
        assert_eq!(chan.buffered(), 0);

        let link = FlakyLink::new(0);
        assert_eq!(chan.drain(&link).unwrap(), 0);
        assert!(link.sent.lock().is_empty());
    }

    #[test]
    fn test_write_sets_drain_event_on_empty_edge_only() {
        let chan = channel();
        chan.enable_fresh();
        let events = &chan.events;

        chan.write(b'a');
        assert!(events.is_pending(bits::CHANNEL_DRAIN));

        events.take(bits::CHANNEL_DRAIN);
        chan.write(b'b');
        // Buffer was non-empty: no new edge.
        assert!(!events.is_pending(bits::CHANNEL_DRAIN));
    }

    #[test]
    fn test_drain_batches_and_preserves_order() {
        let chan = channel();
        chan.enable_fresh();
        for b in b"abcdefgh" {
            chan.write(*b);
        }

        let link = FlakyLink::new(0);
        assert_eq!(chan.drain(&link).unwrap(), 8);
        assert_eq!(link.sent.lock().as_slice(), b"abcdefgh");
        assert_eq!(chan.buffered(), 0);
    }

    #[test]
    fn test_drain_failure_keeps_undelivered_bytes() {
        let chan = channel();
        chan.enable_fresh();
        for b in b"abcdefgh" {
            chan.write(*b);
        }

        // The first delivery attempt is refused: nothing is consumed.
        let link = FlakyLink::new(1);
        assert!(chan.drain(&link).is_err());
        assert_eq!(chan.buffered(), 8);

        // The retry delivers everything in original order, no duplication.
        assert_eq!(chan.drain(&link).unwrap(), 8);
        assert_eq!(link.sent.lock().as_slice(), b"abcdefgh");
        assert_eq!(chan.buffered(), 0);
    }

    #[test]
    fn test_full_buffer_without_pump_drops_instead_of_spinning() {
        let chan = channel();
        chan.enable_fresh();
        // Usable capacity is 8; the 9th byte has nowhere to go and no pump.
        for b in 0..9 {
            chan.write(b);
        }
        assert_eq!(chan.buffered(), 8);
    }

    #[test]
    fn test_full_buffer_pumps_dispatcher_until_space() {
        struct DrainPump {
            chan: spin::Once<Arc<NotificationChannel>>,
            link: Arc<FlakyLink>,
        }
        impl DispatchPump for DrainPump {
            fn pump_once(&self) {
                let chan = self.chan.get().unwrap();
                let _ = chan.drain(&*self.link);
            }
        }

        let chan = channel();
        chan.enable_fresh();
        let link = Arc::new(FlakyLink::new(0));
        let pump = Arc::new(DrainPump {
            chan: spin::Once::new(),
            link: link.clone(),
        });
        pump.chan.call_once(|| chan.clone());
        chan.set_pump(pump);

        // 25 bytes through an 8-byte buffer: writes past the capacity yield
        // into the pump, which drains to the link; order is preserved.
        let written: Vec<u8> = (0..25).collect();
        for b in &written {
            chan.write(*b);
        }
        let _ = chan.drain(&*link);
        assert_eq!(link.sent.lock().as_slice(), written.as_slice());
    }
}
