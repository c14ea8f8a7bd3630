//! Client-side handles for driver-owned resources.
//!
//! A handle is owned by the application thread that created it. Its
//! lifecycle state is the one field the conductor also touches, so it lives
//! in a shared atomic and every transition is a compare-and-swap:
//!
//! ```text
//! Initialized ──ack──> Active ──close()──> CloseRequested ──ack/timeout──> Closed
//!  (conductor only)      │                                                  ▲
//!                        └───────────────── driver timeout ─────────────────┘
//! ```
//!
//! `Initialized` only exists inside the conductor while creation is pending.
//! Application code first sees a handle in `Active`.
//!
//! Closing is a request: `close` returns as soon as the remove command is in
//! the command channel. While one caller is submitting, the cell holds a
//! private `Closing` mark that reads as `Active`; other closers wait for it to
//! resolve, so nobody sees `Ok` for a remove that never made it into the
//! channel. Releasing the handle itself is a separate, later step
//! ([`Counter::delete`] and friends).

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::command::{Command, CommandChannel};
use crate::error::ClientError;
use crate::region::SharedRef;
use crate::trace::{debug, trace};
use crate::types::{DriverAssignedId, RegistrationId, ResourceKind};

/// Position of a handle in its lifecycle. Transitions only move forward,
/// except a close request rolled back because the command channel was full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    Initialized = 0,
    Active = 1,
    CloseRequested = 2,
    Closed = 3,
}

/// Raw value of a close whose remove command is being submitted.
const CLOSING: u8 = 4;

impl LifecycleState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Initialized,
            1 | CLOSING => Self::Active,
            2 => Self::CloseRequested,
            _ => Self::Closed,
        }
    }
}

/// Result of trying to start a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseStart {
    /// This caller owns the submit.
    Won,
    /// Another caller is submitting right now.
    InFlight,
    /// Already `CloseRequested` or `Closed`.
    Done,
}

/// Atomic lifecycle cell shared by a handle and its registry entry.
#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub(crate) const fn new(state: LifecycleState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Active → Closing`. Exactly one caller wins.
    pub(crate) fn begin_close(&self) -> CloseStart {
        match self.0.compare_exchange(
            LifecycleState::Active as u8,
            CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => CloseStart::Won,
            Err(CLOSING) => CloseStart::InFlight,
            Err(_) => CloseStart::Done,
        }
    }

    /// `Closing → CloseRequested` once the remove is queued. Loses to a
    /// conductor that already forced `Closed`.
    pub(crate) fn commit_close(&self) -> bool {
        self.0
            .compare_exchange(
                CLOSING,
                LifecycleState::CloseRequested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Closing → Active` when the remove could not be queued. Returns
    /// `false` if the conductor forced `Closed` in the meantime.
    pub(crate) fn abort_close(&self) -> bool {
        self.0
            .compare_exchange(
                CLOSING,
                LifecycleState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Moves to `Closed` from wherever it is. Returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        self.0.swap(LifecycleState::Closed as u8, Ordering::AcqRel) != LifecycleState::Closed as u8
    }
}

/// Shared state of every handle kind.
pub struct ResourceHandle {
    kind: ResourceKind,
    registration_id: RegistrationId,
    driver_assigned_id: DriverAssignedId,
    address: SharedRef,
    state: Arc<Lifecycle>,
    conductor: CommandChannel,
    detail: String,
}

impl ResourceHandle {
    /// Builds a handle for a resource the driver has already acknowledged.
    ///
    /// `detail` is the counter label or stream channel, kept for diagnostics.
    ///
    /// # Errors
    ///
    /// [`ClientError::Allocation`] if the handle's storage cannot be reserved.
    pub fn create(
        conductor: CommandChannel,
        kind: ResourceKind,
        registration_id: RegistrationId,
        driver_assigned_id: DriverAssignedId,
        address: SharedRef,
        detail: &str,
    ) -> Result<Self, ClientError> {
        let mut owned = String::new();
        owned
            .try_reserve_exact(detail.len())
            .map_err(|_| ClientError::allocation(rustix::io::Errno::NOMEM, "resource handle"))?;
        owned.push_str(detail);

        Ok(Self {
            kind,
            registration_id,
            driver_assigned_id,
            address,
            state: Arc::new(Lifecycle::new(LifecycleState::Active)),
            conductor,
            detail: owned,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    #[must_use]
    pub const fn registration_id(&self) -> RegistrationId {
        self.registration_id
    }

    #[must_use]
    pub const fn driver_assigned_id(&self) -> DriverAssignedId {
        self.driver_assigned_id
    }

    /// Non-owning reference into driver-mapped memory. Valid only while the
    /// mapping layer keeps the region mapped.
    #[must_use]
    pub const fn address(&self) -> &SharedRef {
        &self.address
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.load()
    }

    /// `true` once teardown is confirmed by the driver or forced locally.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == LifecycleState::Closed
    }

    /// Requests asynchronous teardown. Never blocks.
    ///
    /// Closing a handle that is already closing or closed is a successful
    /// no-op. Concurrent callers race on a CAS and only the winner submits a
    /// remove command.
    ///
    /// # Errors
    ///
    /// [`ClientError::QueueFull`] if the command channel is full. The handle
    /// stays `Active` and the call can be retried.
    pub fn close(&self) -> Result<(), ClientError> {
        loop {
            match self.state.begin_close() {
                CloseStart::Won => break,
                // The winner's submit never blocks; wait for its verdict.
                CloseStart::InFlight => hint::spin_loop(),
                CloseStart::Done => {
                    trace!(registration_id = %self.registration_id, "close ignored, already closing");
                    return Ok(());
                }
            }
        }

        match self
            .conductor
            .submit(Command::remove(self.kind, self.registration_id))
        {
            Ok(()) => {
                self.state.commit_close();
                debug!(
                    kind = %self.kind,
                    registration_id = %self.registration_id,
                    "close requested"
                );
                Ok(())
            }
            Err(ClientError::QueueFull) => {
                if self.state.abort_close() {
                    Err(ClientError::QueueFull)
                } else {
                    Ok(())
                }
            }
            Err(_) => {
                // Conductor is gone. Client close already released everything
                // on the driver.
                self.state.mark_closed();
                Ok(())
            }
        }
    }

    /// Releases the handle.
    ///
    /// The caller should only do this after close has been acknowledged
    /// ([`is_closed`](Self::is_closed)) or while the whole client is being
    /// torn down. Consuming `self` makes a second delete impossible.
    pub fn delete(self) -> Result<(), ClientError> {
        trace!(registration_id = %self.registration_id, state = ?self.state(), "handle deleted");
        drop(self);
        Ok(())
    }

    pub(crate) fn lifecycle(&self) -> Weak<Lifecycle> {
        Arc::downgrade(&self.state)
    }

    pub(crate) fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("kind", &self.kind)
            .field("registration_id", &self.registration_id)
            .field("driver_assigned_id", &self.driver_assigned_id)
            .field("state", &self.state())
            .field("detail", &self.detail)
            .finish_non_exhaustive()
    }
}

/// Common access to the [`ResourceHandle`] behind a typed handle.
pub trait Resource {
    fn resource(&self) -> &ResourceHandle;
}

impl Resource for ResourceHandle {
    fn resource(&self) -> &ResourceHandle {
        self
    }
}

/// Closes `handle` if there is one. `None` is a successful no-op.
///
/// # Errors
///
/// See [`ResourceHandle::close`].
pub fn close<H: Resource>(handle: Option<&H>) -> Result<(), ClientError> {
    handle.map_or(Ok(()), |h| h.resource().close())
}

macro_rules! handle_accessors {
    ($name:ident) => {
        impl Resource for $name {
            fn resource(&self) -> &ResourceHandle {
                &self.inner
            }
        }

        impl $name {
            #[must_use]
            pub const fn registration_id(&self) -> RegistrationId {
                self.inner.registration_id()
            }

            #[must_use]
            pub const fn address(&self) -> &SharedRef {
                self.inner.address()
            }

            #[must_use]
            pub fn state(&self) -> LifecycleState {
                self.inner.state()
            }

            #[must_use]
            pub fn is_closed(&self) -> bool {
                self.inner.is_closed()
            }

            /// See [`ResourceHandle::close`].
            ///
            /// # Errors
            ///
            /// [`ClientError::QueueFull`] when the command channel is full.
            pub fn close(&self) -> Result<(), ClientError> {
                self.inner.close()
            }

            /// See [`ResourceHandle::delete`].
            pub fn delete(self) -> Result<(), ClientError> {
                self.inner.delete()
            }
        }
    };
}

/// Handle to a driver-allocated 64-bit counter.
#[derive(Debug)]
pub struct Counter {
    inner: ResourceHandle,
}

handle_accessors!(Counter);

impl Counter {
    /// Builds a counter handle for an acknowledged registration.
    ///
    /// # Errors
    ///
    /// [`ClientError::Allocation`] if the handle cannot be allocated.
    pub fn create(
        conductor: CommandChannel,
        registration_id: RegistrationId,
        counter_id: DriverAssignedId,
        address: SharedRef,
    ) -> Result<Self, ClientError> {
        ResourceHandle::create(
            conductor,
            ResourceKind::Counter,
            registration_id,
            counter_id,
            address,
            "",
        )
        .map(Self::from)
    }

    #[must_use]
    pub const fn counter_id(&self) -> DriverAssignedId {
        self.inner.driver_assigned_id()
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.inner.detail()
    }

    /// Current value, or `None` once the region is unmapped.
    #[must_use]
    pub fn get(&self) -> Option<i64> {
        self.inner.address().load()
    }

    /// Adds one and returns the previous value.
    pub fn increment(&self) -> Option<i64> {
        self.inner.address().fetch_add(1)
    }

    /// Overwrites the value. Returns `false` once the region is unmapped.
    pub fn set(&self, value: i64) -> bool {
        self.inner.address().store(value)
    }
}

impl From<ResourceHandle> for Counter {
    fn from(inner: ResourceHandle) -> Self {
        Self { inner }
    }
}

/// Handle to a driver-side publication.
///
/// The driver-assigned id is the publication's position limit counter.
#[derive(Debug)]
pub struct Publication {
    inner: ResourceHandle,
    stream_id: i32,
}

handle_accessors!(Publication);

impl Publication {
    /// # Errors
    ///
    /// [`ClientError::Allocation`] if the channel cannot be copied.
    pub fn create(
        conductor: CommandChannel,
        registration_id: RegistrationId,
        position_limit_id: DriverAssignedId,
        address: SharedRef,
        channel: &str,
        stream_id: i32,
    ) -> Result<Self, ClientError> {
        let inner = ResourceHandle::create(
            conductor,
            ResourceKind::Publication,
            registration_id,
            position_limit_id,
            address,
            channel,
        )?;
        Ok(Self { inner, stream_id })
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        self.inner.detail()
    }

    #[must_use]
    pub const fn stream_id(&self) -> i32 {
        self.stream_id
    }

    #[must_use]
    pub const fn position_limit_id(&self) -> DriverAssignedId {
        self.inner.driver_assigned_id()
    }

    /// Position the publisher may not write beyond.
    #[must_use]
    pub fn position_limit(&self) -> Option<i64> {
        self.inner.address().load()
    }
}

/// Handle to a driver-side subscription.
///
/// The driver-assigned id is the subscription's channel status counter.
#[derive(Debug)]
pub struct Subscription {
    inner: ResourceHandle,
    stream_id: i32,
}

handle_accessors!(Subscription);

impl Subscription {
    /// # Errors
    ///
    /// [`ClientError::Allocation`] if the channel cannot be copied.
    pub fn create(
        conductor: CommandChannel,
        registration_id: RegistrationId,
        channel_status_id: DriverAssignedId,
        address: SharedRef,
        channel: &str,
        stream_id: i32,
    ) -> Result<Self, ClientError> {
        let inner = ResourceHandle::create(
            conductor,
            ResourceKind::Subscription,
            registration_id,
            channel_status_id,
            address,
            channel,
        )?;
        Ok(Self { inner, stream_id })
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        self.inner.detail()
    }

    #[must_use]
    pub const fn stream_id(&self) -> i32 {
        self.stream_id
    }

    #[must_use]
    pub const fn channel_status_id(&self) -> DriverAssignedId {
        self.inner.driver_assigned_id()
    }

    /// Channel status indicator as published by the driver.
    #[must_use]
    pub fn channel_status(&self) -> Option<i64> {
        self.inner.address().load()
    }
}

pub(crate) fn publication_from(inner: ResourceHandle, stream_id: i32) -> Publication {
    Publication { inner, stream_id }
}

pub(crate) fn subscription_from(inner: ResourceHandle, stream_id: i32) -> Subscription {
    Subscription { inner, stream_id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{self, CommandBody, CommandReceiver, Opcode};
    use crate::region::CountersRegion;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn counter_42(capacity: usize) -> (Counter, CommandReceiver, Arc<CountersRegion>) {
        let (tx, rx) = command::channel(capacity);
        let region = CountersRegion::new(16);
        let id = DriverAssignedId::new(7);
        let counter = Counter::create(
            tx,
            RegistrationId::new(42),
            id,
            SharedRef::new(&region, id),
        )
        .unwrap();
        (counter, rx, region)
    }

    fn drain(rx: &CommandReceiver) -> Vec<Command> {
        std::iter::from_fn(|| rx.poll()).collect()
    }

    #[test]
    fn test_created_counter_reports_ids_and_is_open() {
        let (counter, rx, _region) = counter_42(8);

        assert_eq!(counter.counter_id(), DriverAssignedId::new(7));
        assert_eq!(counter.registration_id(), RegistrationId::new(42));
        assert_eq!(counter.state(), LifecycleState::Active);
        assert!(!counter.is_closed());
        assert!(rx.is_empty(), "creating a handle submits nothing");
    }

    #[test]
    fn test_close_submits_exactly_one_remove_counter() {
        let (counter, rx, _region) = counter_42(8);

        counter.close().unwrap();
        counter.close().unwrap();

        let commands = drain(&rx);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].opcode(), Opcode::RemoveCounter);
        assert_eq!(commands[0].registration_id, RegistrationId::new(42));
        assert_eq!(counter.state(), LifecycleState::CloseRequested);
    }

    #[test]
    fn test_close_of_absent_handle_is_a_no_op() {
        assert_eq!(close::<Counter>(None), Ok(()));
    }

    #[test]
    fn test_close_after_closed_is_a_no_op() {
        let (counter, rx, _region) = counter_42(8);
        counter.inner.state.mark_closed();

        assert_eq!(counter.close(), Ok(()));
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn test_close_with_full_channel_rolls_back_and_can_retry() {
        let (counter, rx, _region) = counter_42(1);
        counter
            .inner
            .conductor
            .submit(Command::remove(ResourceKind::Counter, RegistrationId::new(1)))
            .unwrap();

        assert_eq!(counter.close(), Err(ClientError::QueueFull));
        assert_eq!(counter.state(), LifecycleState::Active);

        let _ = rx.poll();
        assert_eq!(counter.close(), Ok(()));
        let commands = drain(&rx);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].body, CommandBody::Remove(ResourceKind::Counter));
    }

    fn full_channel_counter() -> (Arc<Counter>, CommandReceiver, Arc<CountersRegion>) {
        let (counter, rx, region) = counter_42(1);
        counter
            .inner
            .conductor
            .submit(Command::remove(ResourceKind::Counter, RegistrationId::new(1)))
            .unwrap();
        (Arc::new(counter), rx, region)
    }

    #[test]
    fn test_second_closer_waits_and_sees_queue_full() {
        let (counter, rx, _region) = full_channel_counter();
        assert_eq!(counter.inner.state.begin_close(), CloseStart::Won);

        let second = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || counter.close())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!second.is_finished(), "no verdict while the first close is in flight");

        assert!(counter.inner.state.abort_close());
        assert_eq!(second.join().unwrap(), Err(ClientError::QueueFull));
        assert_eq!(counter.state(), LifecycleState::Active);
        assert_eq!(drain(&rx).len(), 1);
    }

    #[test]
    fn test_second_closer_succeeds_once_first_commits() {
        let (counter, _rx, _region) = full_channel_counter();
        assert_eq!(counter.inner.state.begin_close(), CloseStart::Won);

        let second = {
            let counter = Arc::clone(&counter);
            thread::spawn(move || counter.close())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!second.is_finished());

        assert!(counter.inner.state.commit_close());
        assert_eq!(second.join().unwrap(), Ok(()));
        assert_eq!(counter.state(), LifecycleState::CloseRequested);
    }

    #[test]
    fn test_forced_close_during_submit_wins() {
        let (counter, _rx, _region) = counter_42(4);
        assert_eq!(counter.inner.state.begin_close(), CloseStart::Won);
        assert_eq!(counter.state(), LifecycleState::Active);

        assert!(counter.inner.state.mark_closed());
        assert!(!counter.inner.state.commit_close());
        assert!(!counter.inner.state.abort_close());
        assert!(counter.is_closed());
        assert_eq!(counter.close(), Ok(()));
    }

    #[test]
    fn test_concurrent_close_forwards_one_remove() {
        let (counter, rx, _region) = counter_42(64);
        let counter = Arc::new(counter);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    counter.close()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(()));
        }
        assert_eq!(drain(&rx).len(), 1);
    }

    #[test]
    fn test_address_is_non_owning() {
        let (counter, _rx, region) = counter_42(8);
        assert_eq!(counter.increment(), Some(0));
        assert_eq!(counter.get(), Some(1));
        assert_eq!(counter.address().id(), DriverAssignedId::new(7));

        drop(region);
        assert_eq!(counter.get(), None);
        assert!(!counter.set(5));
    }

    #[test]
    fn test_close_after_conductor_shutdown_closes_locally() {
        let (counter, rx, _region) = counter_42(8);
        rx.close();

        assert_eq!(counter.close(), Ok(()));
        assert!(counter.is_closed());
    }

    #[test]
    fn test_delete_after_close_acknowledged() {
        let (counter, _rx, _region) = counter_42(8);
        let lifecycle = counter.inner.lifecycle();

        counter.close().unwrap();
        lifecycle.upgrade().unwrap().mark_closed();
        assert!(counter.is_closed());

        assert_eq!(counter.delete(), Ok(()));
        assert!(lifecycle.upgrade().is_none(), "handle state released");
    }

    #[test]
    fn test_publication_keeps_channel_and_stream() {
        let (tx, _rx) = command::channel(4);
        let publication = Publication::create(
            tx,
            RegistrationId::new(5),
            DriverAssignedId::new(0),
            SharedRef::unmapped(),
            "baton:ipc",
            1001,
        )
        .unwrap();

        assert_eq!(publication.channel(), "baton:ipc");
        assert_eq!(publication.stream_id(), 1001);
        assert_eq!(publication.position_limit(), None);
    }
}
