//! Throttled traffic accounting

use std::time::Duration;

use tokio::time::Instant;

use crate::DataCount;

/// Cumulative byte counters with rate-limited reporting
#[derive(Debug)]
pub struct DataCounter {
    count: DataCount,
    last_report: Option<Instant>,
    min_interval: Duration,
}

impl DataCounter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            count: DataCount::default(),
            last_report: None,
            min_interval,
        }
    }

    /// Add traffic; returns the running totals when a report is due
    pub fn record(&mut self, inbound: u64, outbound: u64, now: Instant) -> Option<DataCount> {
        self.count.inbound += inbound;
        self.count.outbound += outbound;

        let due = self
            .last_report
            .is_none_or(|last| now.saturating_duration_since(last) >= self.min_interval);
        if !due {
            return None;
        }
        self.last_report = Some(now);
        Some(self.count)
    }

    pub fn reset(&mut self) {
        self.count = DataCount::default();
        self.last_report = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_are_throttled_with_latest_totals() {
        let start = Instant::now();
        let mut counter = DataCounter::new(Duration::from_secs(3));

        assert_eq!(
            counter.record(100, 0, start),
            Some(DataCount { inbound: 100, outbound: 0 })
        );
        for i in 1..10 {
            assert_eq!(counter.record(10, 5, start + Duration::from_millis(i * 100)), None);
        }
        assert_eq!(
            counter.record(0, 1, start + Duration::from_secs(3)),
            Some(DataCount { inbound: 190, outbound: 46 })
        );
    }

    #[test]
    fn test_reset_clears_totals_and_throttle() {
        let now = Instant::now();
        let mut counter = DataCounter::new(Duration::from_secs(3));
        counter.record(5, 5, now);
        counter.reset();
        assert_eq!(
            counter.record(1, 0, now),
            Some(DataCount { inbound: 1, outbound: 0 })
        );
    }
}
