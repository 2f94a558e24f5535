use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Millisecond clock anchored to the wall clock at creation and advanced by the runtime timer.
///
/// Timestamps are comparable across instances (they are roughly Unix milliseconds), which matters for entries read
/// back from a shared persistent tier. Under a paused runtime the clock follows `tokio::time::advance()`.
#[derive(Debug, Clone)]
pub struct Clock {
    origin_ms: u64,
    origin:    Instant,
}

impl Clock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            origin_ms,
            origin: Instant::now(),
        }
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn elapsed_since(&self, ms: u64) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(ms))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_runtime_time() {
        let clock = Clock::new();
        let start = clock.now_ms();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms() - start, 1500);
        assert_eq!(clock.elapsed_since(start), Duration::from_millis(1500));
    }
}
