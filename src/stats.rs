// SPDX-License-Identifier: GPL-2.0

use std::time::Duration;
use std::time::Instant;

/// Ticks closer together than this are dropped rather than reported, so a
/// spurious short sleep cannot produce a wildly inflated rate.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

fn sub_or_zero(curr: u64, prev: u64) -> u64 {
    curr.saturating_sub(prev)
}

/// Instantaneous throughput sampler over a monotonically growing total.
///
/// The totals fed in are fuzzy sums of per-worker progress counters, so the
/// output is a best-effort rate, not an exact snapshot.
pub struct RateSampler {
    prev_total: u64,
    prev_at: Instant,
}

impl RateSampler {
    pub fn new(now: Instant) -> Self {
        Self {
            prev_total: 0,
            prev_at: now,
        }
    }

    /// Returns the rate (counts/sec) since the last accepted sample, or None
    /// when this tick arrived within the debounce window. Only accepted
    /// samples advance the baseline.
    pub fn sample(&mut self, now: Instant, total: u64) -> Option<f64> {
        let elapsed = now.duration_since(self.prev_at);
        if elapsed < MIN_SAMPLE_INTERVAL {
            return None;
        }
        let rate = sub_or_zero(total, self.prev_total) as f64 / elapsed.as_secs_f64();
        self.prev_total = total;
        self.prev_at = now;
        Some(rate)
    }
}

/// Aggregate results across joined workers that completed their budget.
#[derive(Default)]
pub struct Summary {
    pub total: u64,
    pub completed: usize,
    tic: Option<Instant>,
    toc: Option<Instant>,
}

impl Summary {
    /// Fold in one completed worker: its total count and its start/end
    /// timestamps. The run envelope is earliest start to latest end.
    pub fn record(&mut self, count: u64, tic: Instant, toc: Instant) {
        self.total += count;
        self.completed += 1;
        self.tic = Some(match self.tic {
            Some(t) if t < tic => t,
            _ => tic,
        });
        self.toc = Some(match self.toc {
            Some(t) if t > toc => t,
            _ => toc,
        });
    }

    /// Wall time spanned by all completed workers. Zero when none completed.
    pub fn elapsed(&self) -> Duration {
        match (self.tic, self.toc) {
            (Some(tic), Some(toc)) => toc.duration_since(tic),
            _ => Duration::ZERO,
        }
    }
}
