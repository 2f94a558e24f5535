use governor::clock::Clock;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;

/// Trailing-edge debounce. A new value replaces the waiting one and pushes the deadline back.
#[derive(Debug)]
pub struct Debouncer<T> {
    window:    Duration,
    pending:   Option<T>,
    deadline:  Option<Instant>,
    // Arrival of the oldest value in the current group.
    first_at:  Option<Instant>,
    coalesced: usize,
}

/// What a debouncer releases once its window closes.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled<T> {
    pub value:     T,
    /// How many values were folded into this one, the delivered one included.
    pub coalesced: usize,
    /// Time from the first value of the group to now.
    pub lag:       Duration,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
            first_at: None,
            coalesced: 0,
        }
    }

    pub fn push(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        // An unrepresentable deadline means "deliver now".
        self.deadline = Some(now.checked_add(self.window).unwrap_or(now));
        self.first_at.get_or_insert(now);
        self.coalesced += 1;
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn take(&mut self, now: Instant) -> Option<Settled<T>> {
        let value = self.pending.take()?;
        let first_at = self.first_at.take().unwrap_or(now);
        let coalesced = std::mem::take(&mut self.coalesced);
        self.deadline = None;
        Some(Settled {
            value,
            coalesced,
            lag: now.saturating_duration_since(first_at),
        })
    }

    pub fn cancel(&mut self) {
        self.pending = None;
        self.deadline = None;
        self.first_at = None;
        self.coalesced = 0;
    }
}

/// Monotonic clock for the rate limiter, read from the runtime timer so paused-time tests drive it.
#[derive(Debug, Clone)]
pub struct RuntimeClock {
    origin: Instant,
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for RuntimeClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(self.origin.elapsed())
    }
}

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, RuntimeClock, governor::middleware::NoOpMiddleware<Nanos>>;

/// Event rate limiter. Anything over `max` per second is refused, not queued; a full burst of `max` is allowed.
pub struct RateLimiter {
    limiter: DirectLimiter,
}

impl RateLimiter {
    pub fn per_second(max: u32) -> Self {
        let max = NonZeroU32::new(max).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: DirectLimiter::direct_with_clock(Quota::per_second(max), RuntimeClock::default()),
        }
    }

    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}
