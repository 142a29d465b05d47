//! Loop timing and heap sampling.

use embassy_time::{Duration, Instant};

use crate::config::Config;

/// Heap change since boot beyond which a leak or a release is reported.
const LEAK_MARGIN: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopMetrics {
    pub count: u32,
    pub last: Duration,
    pub min: Duration,
    pub max: Duration,
    total: Duration,
    started: Instant,
}

impl LoopMetrics {
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            last: Duration::from_ticks(0),
            min: Duration::from_ticks(0),
            max: Duration::from_ticks(0),
            total: Duration::from_ticks(0),
            started: now,
        }
    }

    pub fn record(&mut self, loop_time: Duration) {
        self.min = if self.count == 0 {
            loop_time
        } else {
            self.min.min(loop_time)
        };
        self.count = self.count.saturating_add(1);
        self.last = loop_time;
        self.max = self.max.max(loop_time);
        self.total += loop_time;
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::from_ticks(0);
        }
        self.total / self.count
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeapTrend {
    PotentialLeak,
    Freed,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReport {
    pub initial: usize,
    pub current: usize,
    pub change: i64,
    pub trend: HeapTrend,
}

pub struct MemoryMonitor {
    interval: Duration,
    threshold: usize,
    initial: Option<usize>,
    last: Option<usize>,
    checked_at: Option<Instant>,
    low_warnings: u32,
}

impl MemoryMonitor {
    pub fn new(config: &Config) -> Self {
        Self {
            interval: config.memory_check_interval,
            threshold: config.low_memory_threshold,
            initial: None,
            last: None,
            checked_at: None,
            low_warnings: 0,
        }
    }

    pub fn low_warnings(&self) -> u32 {
        self.low_warnings
    }

    /// Sample `free_heap` once per interval. Returns `true` when a sample
    /// was taken.
    pub fn poll(&mut self, now: Instant, free_heap: usize) -> bool {
        if self
            .checked_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.interval)
        {
            return false;
        }
        self.checked_at = Some(now);
        self.sample(free_heap);
        true
    }

    fn sample(&mut self, free_heap: usize) {
        self.initial.get_or_insert(free_heap);
        if let Some(last) = self.last {
            if free_heap < last {
                debug!("[memory] free heap decreased by {} bytes", last - free_heap);
            }
        }
        if free_heap < self.threshold {
            self.low_warnings += 1;
            warn!("[memory] low memory: {} bytes free", free_heap);
        }
        self.last = Some(free_heap);
    }

    pub fn report(&self) -> Option<MemoryReport> {
        let (initial, current) = (self.initial?, self.last?);
        let change = current as i64 - initial as i64;
        let trend = if change < -LEAK_MARGIN {
            HeapTrend::PotentialLeak
        } else if change > LEAK_MARGIN {
            HeapTrend::Freed
        } else {
            HeapTrend::Stable
        };
        Some(MemoryReport {
            initial,
            current,
            change,
            trend,
        })
    }
}
