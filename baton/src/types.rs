//! Identifier types shared by the client, the conductor and the driver.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Client-generated correlation id for an asynchronous create or close.
///
/// Unique for the lifetime of a client context: ids come from a monotonic
/// counter and are never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RegistrationId(i64);

impl RegistrationId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for RegistrationId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id the driver gives a resource once creation succeeds.
///
/// For every resource kind this is a slot index in the driver's counters
/// region: the counter value itself, a publication's position limit or a
/// subscription's channel status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DriverAssignedId(i32);

impl DriverAssignedId {
    /// Placeholder before the driver has acknowledged creation.
    pub const NULL: Self = Self(-1);

    #[must_use]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for DriverAssignedId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for DriverAssignedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of driver-side resource a handle stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Counter,
    Publication,
    Subscription,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Counter => "counter",
            Self::Publication => "publication",
            Self::Subscription => "subscription",
        })
    }
}

/// Identity of a client context as seen by the driver.
///
/// Process id plus a random nonce so reconnects and recycled pids never
/// collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    pid: u32,
    nonce: u32,
}

impl ClientId {
    /// Generates a new id for the current process.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            pid: std::process::id(),
            nonce: rand::random(),
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.pid, self.nonce)
    }
}

/// Monotonic source of [`RegistrationId`]s, shared by every application thread.
#[derive(Debug)]
pub struct RegistrationIds {
    next: AtomicI64,
}

impl RegistrationIds {
    #[must_use]
    pub const fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    /// Hands out the next id. Never returns the same value twice.
    pub fn next(&self) -> RegistrationId {
        RegistrationId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RegistrationIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_client_id_uniqueness() {
        assert_ne!(ClientId::generate(), ClientId::generate());
    }

    #[test]
    fn test_null_assigned_id_is_invalid() {
        assert!(!DriverAssignedId::NULL.is_valid());
        assert!(DriverAssignedId::new(0).is_valid());
    }

    #[test]
    fn test_registration_ids_never_repeat_across_threads() {
        let ids = Arc::new(RegistrationIds::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..500).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "registration id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 2000);
    }
}
