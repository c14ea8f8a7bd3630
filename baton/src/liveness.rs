//! Driver heartbeat monitoring.

use crate::driver::HeartbeatReader;

/// What changed since the previous [`DriverLivenessMonitor::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    Unchanged,
    /// Heartbeat went stale. Reported once per outage.
    BecameInactive { age_ms: i64 },
    /// A fresh heartbeat after an outage.
    Recovered,
}

/// Tracks whether the driver's heartbeat is within the timeout.
#[derive(Debug)]
pub struct DriverLivenessMonitor {
    heartbeat: HeartbeatReader,
    timeout_ms: i64,
    active: bool,
}

impl DriverLivenessMonitor {
    /// Starts monitoring, deciding the initial state from the current heartbeat.
    #[must_use]
    pub fn new(heartbeat: HeartbeatReader, timeout_ms: i64, now_ms: i64) -> Self {
        let mut monitor = Self {
            heartbeat,
            timeout_ms,
            active: false,
        };
        monitor.active = monitor.is_fresh(now_ms);
        monitor
    }

    /// Milliseconds since the last heartbeat. A driver that never wrote one
    /// is as old as the epoch.
    #[must_use]
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.heartbeat.last_ms())
    }

    fn is_fresh(&self, now_ms: i64) -> bool {
        self.heartbeat.last_ms() != 0 && self.age_ms(now_ms) <= self.timeout_ms
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub const fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    pub fn check(&mut self, now_ms: i64) -> LivenessEvent {
        let fresh = self.is_fresh(now_ms);
        match (self.active, fresh) {
            (true, false) => {
                self.active = false;
                LivenessEvent::BecameInactive {
                    age_ms: self.age_ms(now_ms),
                }
            }
            (false, true) => {
                self.active = true;
                LivenessEvent::Recovered
            }
            _ => LivenessEvent::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::heartbeat;

    #[test]
    fn test_stale_heartbeat_reported_once() {
        let (writer, reader) = heartbeat();
        writer.publish(1_000);
        let mut monitor = DriverLivenessMonitor::new(reader, 500, 1_000);
        assert!(monitor.is_active());

        assert_eq!(monitor.check(1_500), LivenessEvent::Unchanged);
        assert_eq!(
            monitor.check(1_501),
            LivenessEvent::BecameInactive { age_ms: 501 }
        );
        assert_eq!(monitor.check(5_000), LivenessEvent::Unchanged);
        assert!(!monitor.is_active());
    }

    #[test]
    fn test_fresh_heartbeat_recovers() {
        let (writer, reader) = heartbeat();
        writer.publish(1_000);
        let mut monitor = DriverLivenessMonitor::new(reader, 500, 3_000);
        assert!(!monitor.is_active());

        writer.publish(3_000);
        assert_eq!(monitor.check(3_100), LivenessEvent::Recovered);
        assert!(monitor.is_active());
    }

    #[test]
    fn test_missing_heartbeat_is_inactive() {
        let (_writer, reader) = heartbeat();
        let monitor = DriverLivenessMonitor::new(reader, i64::MAX, 10);
        assert!(!monitor.is_active());
    }
}
