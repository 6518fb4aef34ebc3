//! Per-frame processing latency measurement.

use crate::defaults;
use std::collections::VecDeque;
use std::time::Duration;

/// Aggregated latency statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyStats {
    pub count: usize,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
    /// Average processing time divided by the audio time of one frame.
    /// < 1.0 means faster than real-time.
    pub realtime_factor: f64,
}

/// Keeps the most recent frame processing times.
pub struct LatencyTracker {
    window: VecDeque<Duration>,
    capacity: usize,
    frame_duration: Duration,
    total_recorded: u64,
}

impl LatencyTracker {
    /// Creates a tracker for frames of `frame_duration` audio each.
    pub fn new(frame_duration: Duration) -> Self {
        Self::with_capacity(frame_duration, defaults::LATENCY_WINDOW)
    }

    pub fn with_capacity(frame_duration: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            frame_duration,
            total_recorded: 0,
        }
    }

    /// Records one frame's processing time.
    pub fn record(&mut self, elapsed: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(elapsed);
        self.total_recorded += 1;
    }

    /// Frames recorded since creation, including those out of the window.
    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    pub fn last(&self) -> Option<Duration> {
        self.window.back().copied()
    }

    /// Computes statistics over the current window.
    pub fn stats(&self) -> Option<LatencyStats> {
        let min = *self.window.iter().min()?;
        let max = *self.window.iter().max()?;
        let avg = self.window.iter().sum::<Duration>() / self.window.len() as u32;

        let realtime_factor = if self.frame_duration.is_zero() {
            0.0
        } else {
            avg.as_secs_f64() / self.frame_duration.as_secs_f64()
        };

        Some(LatencyStats {
            count: self.window.len(),
            avg,
            min,
            max,
            realtime_factor,
        })
    }
}

/// Formats a duration as a human-friendly string.
/// Under 1ms: "250µs", under 1s: "4.5ms", at or above 1s: "1.5s".
pub fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1000 {
        format!("{}µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.1}ms", d.as_secs_f64() * 1000.0)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Calculates average duration from a slice.
pub fn avg_duration(durations: &[Duration]) -> Duration {
    if durations.is_empty() {
        return Duration::ZERO;
    }
    let sum: Duration = durations.iter().sum();
    sum / durations.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tracker_has_no_stats() {
        let tracker = LatencyTracker::new(Duration::from_millis(10));
        assert!(tracker.stats().is_none());
        assert!(tracker.last().is_none());
    }

    #[test]
    fn test_stats_min_max_avg() {
        let mut tracker = LatencyTracker::new(Duration::from_millis(10));
        tracker.record(Duration::from_millis(1));
        tracker.record(Duration::from_millis(3));
        tracker.record(Duration::from_millis(2));

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Duration::from_millis(1));
        assert_eq!(stats.max, Duration::from_millis(3));
        assert_eq!(stats.avg, Duration::from_millis(2));
        assert!((stats.realtime_factor - 0.2).abs() < 1e-9);
        assert_eq!(tracker.last(), Some(Duration::from_millis(2)));
    }

    #[test]
    fn test_window_drops_oldest() {
        let mut tracker = LatencyTracker::with_capacity(Duration::from_millis(10), 2);
        tracker.record(Duration::from_millis(100));
        tracker.record(Duration::from_millis(1));
        tracker.record(Duration::from_millis(1));

        let stats = tracker.stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max, Duration::from_millis(1));
        assert_eq!(tracker.total_recorded(), 3);
    }

    #[test]
    fn test_zero_frame_duration_gives_zero_factor() {
        let mut tracker = LatencyTracker::new(Duration::ZERO);
        tracker.record(Duration::from_millis(1));
        assert_eq!(tracker.stats().unwrap().realtime_factor, 0.0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_micros(250)), "250µs");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    }

    #[test]
    fn test_avg_duration_empty() {
        assert_eq!(avg_duration(&[]), Duration::ZERO);
    }
}
