//! Timing handles for profiling operator calls.

use std::time::{Duration, Instant};

/// Start and end of one piece of device work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStats {
    pub start: Instant,
    pub end: Instant,
}

impl CallStats {
    pub fn new(start: Instant, end: Instant) -> Self {
        Self { start, end }
    }

    /// Stats for work that took `elapsed` starting at `start`.
    pub fn starting_at(start: Instant, elapsed: Duration) -> Self {
        Self {
            start,
            end: start + elapsed,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    /// Smallest interval covering both.
    pub fn union(self, other: Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Optional out-parameter of every functor call.
///
/// When passed in, it is filled with the timing of the real (non-tuning)
/// launches of that call, so callers can aggregate statistics without running
/// the kernel again. Calls that launch several kernels report the interval
/// covering all of them; so does a future reused across calls.
#[derive(Debug, Default, Clone)]
pub struct StatsFuture {
    stats: Option<CallStats>,
}

impl StatsFuture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timing of the completed call, if any launch was recorded.
    pub fn stats(&self) -> Option<CallStats> {
        self.stats
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.stats.map(|s| s.elapsed())
    }

    pub(crate) fn record(&mut self, stats: CallStats) {
        self.stats = Some(match self.stats {
            Some(prev) => prev.union(stats),
            None => stats,
        });
    }
}
