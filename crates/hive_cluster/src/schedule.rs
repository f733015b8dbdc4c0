//! Heartbeat scheduling.

use std::time::{Duration, Instant};

/// Tracks when the local identity was last advertised.
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl HeartbeatSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Whether a heartbeat should precede the next outbound message.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_sent {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// Forget the last heartbeat so the next check reports it due.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_before_first_heartbeat() {
        let schedule = HeartbeatSchedule::new(Duration::from_secs(1));
        assert!(schedule.is_due(Instant::now()));
    }

    #[test]
    fn test_due_after_interval() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(1));
        let start = Instant::now();
        schedule.record(start);
        assert!(!schedule.is_due(start + Duration::from_millis(999)));
        assert!(schedule.is_due(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_reset_and_interval_change() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(10));
        let start = Instant::now();
        schedule.record(start);
        schedule.set_interval(Duration::from_millis(10));
        assert!(schedule.is_due(start + Duration::from_millis(10)));

        schedule.record(start);
        schedule.reset();
        assert!(schedule.is_due(start));
    }
}
