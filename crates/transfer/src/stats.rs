//! Transfer statistics.
//!
//! Owned and mutated only by the pipeline task; external collaborators
//! read [`StatsSnapshot`] values carried in progress events. The
//! instantaneous rate comes from a sliding window of recent samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::plan::ChunkPlan;

const RATE_WINDOW: Duration = Duration::from_secs(5);
const RATE_MAX_SAMPLES: usize = 100;

/// Read-only view of transfer progress at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub bytes_total: u64,
    pub bytes_completed: u64,
    pub subs_total: u32,
    pub subs_completed: u32,
    pub mains_total: u32,
    pub mains_completed: u32,
    pub failed: u32,
    /// Instantaneous rate over the sample window, bytes per second.
    pub bytes_per_second: f64,
}

/// Progress bookkeeping for one transfer.
pub struct TransferStats {
    bytes_total: u64,
    bytes_completed: u64,
    subs_total: u32,
    subs_completed: u32,
    mains_total: u32,
    mains_completed: u32,
    failed: u32,
    /// Unfinished sub-chunks left in each main chunk.
    remaining_per_main: Vec<u32>,
    rate: RateWindow,
}

impl TransferStats {
    pub fn new(plan: &ChunkPlan) -> Self {
        let remaining_per_main = plan
            .main_chunks()
            .iter()
            .map(|m| m.sub_chunks.len() as u32)
            .collect();
        Self {
            bytes_total: plan.size(),
            bytes_completed: 0,
            subs_total: plan.sub_count(),
            subs_completed: 0,
            mains_total: plan.main_count(),
            mains_completed: 0,
            failed: 0,
            remaining_per_main,
            rate: RateWindow::new(RATE_WINDOW, RATE_MAX_SAMPLES),
        }
    }

    /// Records one completed (acked or verified) sub-chunk.
    pub fn record_sub(&mut self, main_index: u32, bytes: u64) {
        self.bytes_completed += bytes;
        self.subs_completed += 1;
        self.rate.record(bytes);

        let remaining = &mut self.remaining_per_main[main_index as usize];
        *remaining -= 1;
        if *remaining == 0 {
            self.mains_completed += 1;
        }
    }

    /// Records a sub-chunk that exhausted its retry budget.
    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub fn all_subs_completed(&self) -> bool {
        self.subs_completed == self.subs_total
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_total: self.bytes_total,
            bytes_completed: self.bytes_completed,
            subs_total: self.subs_total,
            subs_completed: self.subs_completed,
            mains_total: self.mains_total,
            mains_completed: self.mains_completed,
            failed: self.failed,
            bytes_per_second: self.rate.bytes_per_second(),
        }
    }
}

/// Sliding-window rate estimate.
struct RateWindow {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl RateWindow {
    fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples,
        }
    }

    fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));

        if let Some(cutoff) = now.checked_sub(self.window) {
            while self
                .samples
                .front()
                .is_some_and(|(at, _)| *at < cutoff)
            {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Average bytes/second across the window; 0.0 with fewer than two
    /// samples.
    fn bytes_per_second(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let first = self.samples.front().unwrap().0;
        let last = self.samples.back().unwrap().0;
        let elapsed = last.duration_since(first);
        if elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|(_, b)| *b).sum();
        total as f64 / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ChunkParams;

    fn small_plan() -> ChunkPlan {
        // 2 mains of 2 subs each, plus 1 main with a short tail sub.
        ChunkPlan::build(
            4096 + 4096 + 100,
            ChunkParams {
                main_size: 4096,
                sub_size: 2048,
            },
        )
        .unwrap()
    }

    #[test]
    fn new_stats_match_plan() {
        let stats = TransferStats::new(&small_plan());
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_total, 8292);
        assert_eq!(snap.subs_total, 5);
        assert_eq!(snap.mains_total, 3);
        assert_eq!(snap.subs_completed, 0);
        assert_eq!(snap.bytes_per_second, 0.0);
    }

    #[test]
    fn main_completes_when_all_its_subs_do() {
        let mut stats = TransferStats::new(&small_plan());
        stats.record_sub(0, 2048);
        assert_eq!(stats.snapshot().mains_completed, 0);
        stats.record_sub(0, 2048);
        assert_eq!(stats.snapshot().mains_completed, 1);

        // Last main has a single short sub.
        stats.record_sub(2, 100);
        assert_eq!(stats.snapshot().mains_completed, 2);
    }

    #[test]
    fn completion_detection() {
        let mut stats = TransferStats::new(&small_plan());
        assert!(!stats.all_subs_completed());
        for (main, bytes) in [(0, 2048), (0, 2048), (1, 2048), (1, 2048), (2, 100)] {
            stats.record_sub(main, bytes);
        }
        assert!(stats.all_subs_completed());
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_completed, snap.bytes_total);
        assert_eq!(snap.mains_completed, 3);
    }

    #[test]
    fn failed_count_tracks() {
        let mut stats = TransferStats::new(&small_plan());
        stats.record_failed();
        assert_eq!(stats.snapshot().failed, 1);
    }

    #[test]
    fn empty_plan_is_complete_immediately() {
        let plan = ChunkPlan::build(0, ChunkParams::default()).unwrap();
        let stats = TransferStats::new(&plan);
        assert!(stats.all_subs_completed());
    }

    #[test]
    fn rate_needs_two_samples() {
        let mut rate = RateWindow::new(Duration::from_secs(5), 10);
        rate.record(1000);
        assert_eq!(rate.bytes_per_second(), 0.0);
        std::thread::sleep(Duration::from_millis(20));
        rate.record(1000);
        assert!(rate.bytes_per_second() > 0.0);
    }

    #[test]
    fn rate_caps_sample_count() {
        let mut rate = RateWindow::new(Duration::from_secs(60), 4);
        for _ in 0..20 {
            rate.record(1);
        }
        assert!(rate.samples.len() <= 4);
    }
}
