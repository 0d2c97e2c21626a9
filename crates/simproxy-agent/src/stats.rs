//! Rolling per-direction message statistics

use std::fmt;
use std::time::{Duration, Instant};

/// Statistics for one direction of an agent's traffic
///
/// Averages are maintained incrementally; no message history is kept.
#[derive(Debug, Clone)]
pub struct CycleStats {
    count: u64,
    avg_size: f64,
    max_size: usize,
    delay_samples: u64,
    avg_delay_ms: f64,
    max_delay: Duration,
    last_message_at: Option<Instant>,
    track_max_delay: bool,
}

impl CycleStats {
    /// `track_max_delay` marks directions whose maximum delay is meaningful
    /// and therefore reported.
    pub fn new(track_max_delay: bool) -> Self {
        Self {
            count: 0,
            avg_size: 0.0,
            max_size: 0,
            delay_samples: 0,
            avg_delay_ms: 0.0,
            max_delay: Duration::ZERO,
            last_message_at: None,
            track_max_delay,
        }
    }

    /// Record a message of `size` bytes, measuring its delay from `reference`
    pub fn record(&mut self, size: usize, reference: Option<Instant>) {
        self.record_at(size, reference, Instant::now());
    }

    pub fn record_at(&mut self, size: usize, reference: Option<Instant>, now: Instant) {
        let count = self.count as f64;
        self.avg_size = (self.avg_size * count + size as f64) / (count + 1.0);
        self.max_size = self.max_size.max(size);

        // The first message has nothing to be measured against
        if self.count > 0 {
            if let Some(reference) = reference {
                let delay = now.saturating_duration_since(reference);
                let samples = self.delay_samples as f64;
                self.avg_delay_ms =
                    (self.avg_delay_ms * samples + delay.as_secs_f64() * 1000.0) / (samples + 1.0);
                self.delay_samples += 1;
                self.max_delay = self.max_delay.max(delay);
            }
        }

        self.last_message_at = Some(now);
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average_size(&self) -> f64 {
        self.avg_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn average_delay(&self) -> Duration {
        Duration::from_secs_f64(self.avg_delay_ms / 1000.0)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        self.last_message_at
    }
}

impl fmt::Display for CycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            " count: {} avgSize: {:4.2} maxSize: {} avgTimeDelta: {:4.2}(ms)",
            self.count(),
            self.average_size(),
            self.max_size(),
            self.average_delay().as_secs_f64() * 1000.0
        )?;
        if self.track_max_delay {
            write!(f, " maxTimeDelta: {}(ms)", self.max_delay().as_millis())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        let mut stats = CycleStats::new(false);
        stats.record(10, None);
        stats.record(30, None);
        stats.record(20, None);

        assert_eq!(stats.count(), 3);
        assert_eq!(stats.max_size(), 30);
        assert!((stats.average_size() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_delays() {
        let start = Instant::now();
        let mut stats = CycleStats::new(true);

        stats.record_at(5, None, start);
        assert_eq!(stats.average_delay(), Duration::ZERO);

        let second = start + Duration::from_millis(20);
        stats.record_at(5, stats.last_message_at(), second);
        let third = second + Duration::from_millis(40);
        stats.record_at(5, stats.last_message_at(), third);

        assert_eq!(stats.max_delay(), Duration::from_millis(40));
        let avg_ms = stats.average_delay().as_secs_f64() * 1000.0;
        assert!((avg_ms - 30.0).abs() < 1e-6);
        assert_eq!(stats.last_message_at(), Some(third));
    }

    #[test]
    fn test_missing_reference_skips_delay() {
        let start = Instant::now();
        let mut stats = CycleStats::new(false);
        stats.record_at(1, None, start);
        stats.record_at(1, None, start + Duration::from_secs(5));

        assert_eq!(stats.count(), 2);
        assert_eq!(stats.max_delay(), Duration::ZERO);
        assert_eq!(stats.average_delay(), Duration::ZERO);
    }

    #[test]
    fn test_display() {
        let start = Instant::now();
        let mut received = CycleStats::new(true);
        received.record_at(100, None, start);
        received.record_at(200, Some(start), start + Duration::from_millis(20));

        assert_eq!(
            received.to_string(),
            " count: 2 avgSize: 150.00 maxSize: 200 avgTimeDelta: 20.00(ms) maxTimeDelta: 20(ms)"
        );

        let sent = CycleStats::new(false);
        assert_eq!(
            sent.to_string(),
            " count: 0 avgSize: 0.00 maxSize: 0 avgTimeDelta: 0.00(ms)"
        );
    }
}
