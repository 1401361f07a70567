//! Time abstraction
//!
//! All scheduling decisions use a monotonic millisecond counter that wraps at
//! `u32::MAX`, the same width a device tick counter has. Elapsed-time checks
//! must therefore go through [`has_elapsed`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Source of the monotonic millisecond counter
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds. Wraps around on overflow.
    fn now_ms(&self) -> u32;
}

/// True when at least `delay_ms` have passed from `start_ms` to `now_ms`,
/// even if the counter wrapped in between.
pub fn has_elapsed(now_ms: u32, start_ms: u32, delay_ms: u32) -> bool {
    now_ms.wrapping_sub(start_ms) >= delay_ms
}

/// Clock backed by [`Instant`], counting from its creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the wraparound.
        self.origin.elapsed().as_millis() as u32
    }
}

/// Manually driven clock, for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(start_ms: u32) -> Self {
        Self {
            now: AtomicU32::new(start_ms),
        }
    }

    pub fn set(&self, ms: u32) {
        self.now.store(ms, Ordering::SeqCst);
    }

    /// Move the clock forward, wrapping on overflow
    pub fn advance(&self, ms: u32) {
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.wrapping_add(ms))
            });
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Periodic Ticker
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-rate wakeup source.
///
/// Every deadline is derived from the previous scheduled deadline, not from the
/// moment the caller got around to waiting, so execution jitter never
/// accumulates into drift. A caller that falls behind gets the missed ticks
/// back-to-back.
#[derive(Debug)]
pub struct PeriodicTicker {
    period: Duration,
    next_deadline: tokio::time::Instant,
}

impl PeriodicTicker {
    /// Create a ticker whose first deadline is one period from now
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_deadline: tokio::time::Instant::now() + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Deadline of the next wakeup
    pub fn next_deadline(&self) -> tokio::time::Instant {
        self.next_deadline
    }

    /// Sleep until the next deadline, then schedule the one after it
    pub async fn wait(&mut self) {
        tokio::time::sleep_until(self.next_deadline).await;
        self.next_deadline += self.period;
    }
}
