/// Number of interrupt handler slots scripts can register.
pub const MAX_INTERRUPT: usize = 8;

/// Number of timer handler slots scripts can register.
pub const MAX_TIMER: usize = 8;

/// The designated delay-timer slot. Its expiry runs the script in the
/// background so it cannot preempt an in-progress interactive command.
pub const DELAY_TIMER: usize = 0;

/// Upper bound on one notification batch. The negotiated link payload is
/// clamped to this when sizing the drain buffer.
pub const MAX_SEGMENT: usize = 64;

/// Construction-time tuning of the event core.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Ring capacity as a multiple of the link's maximum payload. The ring
    /// holds `max_payload * ring_multiplier` usable bytes.
    pub ring_multiplier: usize,

    /// Peer slot reserved for the loopback connection. Link changes for this
    /// slot carry no subscription state and are dropped.
    pub loopback_peer: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ring_multiplier: 1,
            loopback_peer: usize::MAX,
        }
    }
}
