//! Bounded lock-free queues for in-process communication.
//!
//! - [`mpsc`]: many application threads feeding the conductor.
//! - [`spsc`]: point-to-point rings between the conductor and the driver.
//!
//! Neither queue ever blocks on push: a full ring hands the item back so the
//! caller decides whether to retry.

pub mod mpsc;
pub mod spsc;

use std::time::Duration;

/// How long a waiting call may spin.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}
