// This file is part of Veilnet and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Latency and throughput accounting.
//!
//! Counters mirror what the relay and clients want reported: total and
//! per-period cell/byte counts in both directions, plus a bounded ring of
//! measured round-trip latencies. Reports go through `tracing` on a fixed
//! period.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::info;

/// Bounded number of retained latency samples.
pub const MAX_LATENCY_STORED: usize = 100;
/// Default reporting period.
pub const REPORT_PERIOD: Duration = Duration::from_secs(5);

/// Milliseconds since the Unix epoch, used to stamp latency probes.
#[must_use]
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Rolling traffic and latency statistics for one participant.
#[derive(Debug)]
pub struct Statistics {
    begin: Instant,
    next_report: Instant,
    n_reports: usize,
    latencies: VecDeque<u64>,

    total_upstream_cells: u64,
    total_upstream_bytes: u64,
    total_downstream_cells: u64,
    total_downstream_bytes: u64,

    period_upstream_cells: u64,
    period_upstream_bytes: u64,
    period_downstream_bytes: u64,
}

impl Statistics {
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            begin: now,
            next_report: now + REPORT_PERIOD,
            n_reports: 0,
            latencies: VecDeque::with_capacity(MAX_LATENCY_STORED),
            total_upstream_cells: 0,
            total_upstream_bytes: 0,
            total_downstream_cells: 0,
            total_downstream_bytes: 0,
            period_upstream_cells: 0,
            period_upstream_bytes: 0,
            period_downstream_bytes: 0,
        }
    }

    pub fn add_latency(&mut self, ms: u64) {
        if self.latencies.len() == MAX_LATENCY_STORED {
            self.latencies.pop_front();
        }
        self.latencies.push_back(ms);
    }

    pub fn upstream_cell(&mut self, bytes: usize) {
        self.total_upstream_cells += 1;
        self.total_upstream_bytes += bytes as u64;
        self.period_upstream_cells += 1;
        self.period_upstream_bytes += bytes as u64;
    }

    pub fn downstream_cell(&mut self, bytes: usize) {
        self.total_downstream_cells += 1;
        self.total_downstream_bytes += bytes as u64;
        self.period_downstream_bytes += bytes as u64;
    }

    #[must_use]
    pub fn latency_count(&self) -> usize {
        self.latencies.len()
    }

    /// Mean of the retained latency samples, if any.
    #[must_use]
    pub fn mean_latency_ms(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        let sum: u64 = self.latencies.iter().sum();
        Some(sum as f64 / self.latencies.len() as f64)
    }

    /// Emits a periodic report when the period elapsed; returns whether a
    /// report was produced.
    pub fn maybe_report(&mut self, now: Instant) -> bool {
        if now < self.next_report {
            return false;
        }
        let elapsed = now.duration_since(self.begin).as_secs_f64().max(f64::EPSILON);
        let period = REPORT_PERIOD.as_secs_f64();
        info!(
            up_cells_per_sec = self.total_upstream_cells as f64 / elapsed,
            up_bytes_per_sec = self.period_upstream_bytes as f64 / period,
            down_bytes_per_sec = self.period_downstream_bytes as f64 / period,
            mean_latency_ms = self.mean_latency_ms().unwrap_or(0.0),
            "traffic report"
        );
        self.period_upstream_cells = 0;
        self.period_upstream_bytes = 0;
        self.period_downstream_bytes = 0;
        self.next_report = now + REPORT_PERIOD;
        self.n_reports += 1;
        true
    }

    #[must_use]
    pub fn reports_emitted(&self) -> usize {
        self.n_reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_ring_is_bounded() {
        let mut stats = Statistics::new(Instant::now());
        for i in 0..(MAX_LATENCY_STORED as u64 + 10) {
            stats.add_latency(i);
        }
        assert_eq!(stats.latency_count(), MAX_LATENCY_STORED);
        // oldest samples were evicted
        assert!(stats.mean_latency_ms().unwrap() > 10.0);
    }

    #[test]
    fn report_fires_once_per_period() {
        let start = Instant::now();
        let mut stats = Statistics::new(start);
        stats.upstream_cell(32);
        assert!(!stats.maybe_report(start));
        assert!(stats.maybe_report(start + REPORT_PERIOD));
        assert!(!stats.maybe_report(start + REPORT_PERIOD));
        assert_eq!(stats.reports_emitted(), 1);
    }

    #[test]
    fn counters_accumulate() {
        let mut stats = Statistics::new(Instant::now());
        stats.upstream_cell(32);
        stats.upstream_cell(32);
        stats.downstream_cell(10);
        assert_eq!(stats.total_upstream_cells, 2);
        assert_eq!(stats.total_upstream_bytes, 64);
        assert_eq!(stats.total_downstream_bytes, 10);
    }
}
