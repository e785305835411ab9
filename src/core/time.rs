//! Time utilities.
//!
//! Lease deadlines in the embedded store are evaluated against a [`Clock`]
//! rather than sampled ad hoc, so expiry is reproducible in tests:
//! - [`TokioClock`] follows tokio's monotonic clock (and therefore honours
//!   paused time in `#[tokio::test(start_paused = true)]`)
//! - [`ManualClock`] only moves when told to
//!
//! Record timestamps (created-at / modified-at) are wall-clock and come from
//! [`unix_millis`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A point in clock time, in milliseconds since the clock's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick {
    /// Milliseconds since the clock origin.
    pub ms: u64,
}

impl Tick {
    /// Create a new tick with the given millisecond value.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// Create a tick representing the clock origin.
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Add milliseconds to this tick.
    pub const fn add_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_add(ms),
        }
    }

    /// Subtract milliseconds from this tick, saturating at zero.
    pub const fn sub_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_sub(ms),
        }
    }

    /// Check if this tick is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Tick) -> bool {
        self.ms >= deadline.ms
    }

    /// Check if this tick is before the given deadline.
    pub const fn is_before(self, deadline: Tick) -> bool {
        self.ms < deadline.ms
    }

    /// Milliseconds until a deadline.
    ///
    /// Returns 0 if the deadline has already passed.
    pub fn ms_until(self, deadline: Tick) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tick({}ms)", self.ms)
    }
}

/// Source of time for lease deadlines.
pub trait Clock: Send + Sync {
    /// Current tick.
    fn now(&self) -> Tick;
}

/// Monotonic clock backed by `tokio::time::Instant`.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Tick {
        Tick::new(self.origin.elapsed().as_millis() as u64)
    }
}

/// Clock that only advances explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock at the origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Jump to an absolute tick. Never moves backwards.
    pub fn set(&self, tick: Tick) {
        self.ms.fetch_max(tick.ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        Tick::new(self.ms.load(Ordering::Acquire))
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
