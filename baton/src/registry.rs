//! Conductor-owned bookkeeping of in-flight and live resources.
//!
//! Keyed by [`RegistrationId`], with a secondary index from the driver's id
//! so `ResourceUnavailable` notifications can be routed. Only the conductor
//! touches the registry, so nothing here is synchronized. The exception is
//! [`Completion`], the outcome slot shared with the application's pending
//! handle.
//!
//! A successful outcome stays tracked until the application takes it. If the
//! pending handle is dropped first, [`Registry::sweep_unclaimed`] hands the
//! registration back to the conductor, which removes it on the driver.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::ClientError;
use crate::handle::{Lifecycle, LifecycleState, ResourceHandle};
use crate::trace::trace;
use crate::types::{DriverAssignedId, RegistrationId, ResourceKind};

enum Slot {
    Waiting,
    Ready(Result<ResourceHandle, ClientError>),
    Taken,
}

/// Single-use outcome slot between the conductor and a pending handle.
///
/// The conductor posts exactly one outcome. The pending handle takes it.
pub struct Completion {
    slot: Mutex<Slot>,
}

impl Completion {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Waiting),
        }
    }

    /// Stores the outcome. Returns `false` if one was already posted.
    pub(crate) fn post(&self, outcome: Result<ResourceHandle, ClientError>) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*slot, Slot::Waiting) {
            *slot = Slot::Ready(outcome);
            true
        } else {
            false
        }
    }

    /// Takes the outcome if it has arrived. Later calls return `None`.
    pub(crate) fn take(&self) -> Option<Result<ResourceHandle, ClientError>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(outcome) => Some(outcome),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub(crate) fn is_posted(&self) -> bool {
        !matches!(
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner),
            Slot::Waiting
        )
    }

    pub(crate) fn is_taken(&self) -> bool {
        matches!(
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner),
            Slot::Taken
        )
    }
}

/// What the conductor knows about one registration.
pub struct Entry {
    pub registration_id: RegistrationId,
    pub kind: ResourceKind,
    pub state: LifecycleState,
    pub driver_assigned_id: DriverAssignedId,
    pub created_at_ms: i64,
    /// Counter label or stream channel, copied into the handle on ack.
    pub detail: String,
    pub(crate) lifecycle: Weak<Lifecycle>,
    /// Shared with the pending handle until its outcome is taken.
    pub(crate) completion: Option<Arc<Completion>>,
}

impl Entry {
    #[must_use]
    pub fn new(
        registration_id: RegistrationId,
        kind: ResourceKind,
        created_at_ms: i64,
        detail: String,
    ) -> Self {
        Self {
            registration_id,
            kind,
            state: LifecycleState::Initialized,
            driver_assigned_id: DriverAssignedId::NULL,
            created_at_ms,
            detail,
            lifecycle: Weak::new(),
            completion: None,
        }
    }

    pub(crate) fn with_completion(mut self, completion: Arc<Completion>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Whether an application thread still holds the pending handle.
    #[must_use]
    pub fn has_waiter(&self) -> bool {
        self.completion
            .as_ref()
            .is_some_and(|completion| Arc::strong_count(completion) > 1)
    }

    /// Posts `outcome` to the pending handle, if it is still there.
    ///
    /// Returns the outcome back when nobody is listening.
    pub(crate) fn complete(
        &self,
        outcome: Result<ResourceHandle, ClientError>,
    ) -> Result<(), Result<ResourceHandle, ClientError>> {
        match &self.completion {
            Some(completion) if self.has_waiter() && !completion.is_posted() => {
                completion.post(outcome);
                Ok(())
            }
            _ => Err(outcome),
        }
    }

    /// Forces the application-visible handle (if any) to `Closed`.
    pub(crate) fn force_closed(&mut self) -> bool {
        self.state = LifecycleState::Closed;
        self.lifecycle
            .upgrade()
            .is_some_and(|lifecycle| lifecycle.mark_closed())
    }
}

/// Registration table. Owned by the conductor.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<RegistrationId, Entry>,
    by_assigned_id: HashMap<(ResourceKind, DriverAssignedId), RegistrationId>,
    /// Acknowledged creates whose handle the application has not taken yet.
    unclaimed: Vec<RegistrationId>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new registration.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Allocation`] if the table cannot grow.
    /// - [`ClientError::Protocol`] if the id is already registered.
    pub fn insert(&mut self, entry: Entry) -> Result<(), ClientError> {
        if self.entries.contains_key(&entry.registration_id) {
            return Err(ClientError::Protocol {
                registration_id: entry.registration_id,
                reason: "duplicate registration id".to_owned(),
            });
        }
        self.entries.try_reserve(1).map_err(|_| {
            ClientError::allocation(rustix::io::Errno::NOMEM, "registry entry")
        })?;
        self.entries.insert(entry.registration_id, entry);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: RegistrationId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: RegistrationId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    /// Records the driver-assigned id and the live handle for an entry.
    ///
    /// The assigned id is written at most once; a second bind is refused.
    pub(crate) fn activate(
        &mut self,
        id: RegistrationId,
        assigned: DriverAssignedId,
        lifecycle: Weak<Lifecycle>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if entry.driver_assigned_id.is_valid() {
            return false;
        }
        entry.driver_assigned_id = assigned;
        entry.state = LifecycleState::Active;
        entry.lifecycle = lifecycle;
        self.by_assigned_id.insert((entry.kind, assigned), id);
        true
    }

    /// Registrations of any kind bound to `assigned`.
    pub fn all_by_assigned(
        &self,
        assigned: DriverAssignedId,
    ) -> impl Iterator<Item = RegistrationId> + '_ {
        self.by_assigned_id
            .iter()
            .filter(move |((_, id), _)| *id == assigned)
            .map(|(_, reg)| *reg)
    }

    pub fn remove(&mut self, id: RegistrationId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if entry.driver_assigned_id.is_valid() {
            self.by_assigned_id
                .remove(&(entry.kind, entry.driver_assigned_id));
        }
        Some(entry)
    }

    /// Watches `id` until its posted handle is taken or abandoned.
    pub(crate) fn track_unclaimed(&mut self, id: RegistrationId) {
        self.unclaimed.push(id);
    }

    /// Returns the `Active` registrations whose posted handle can no longer be
    /// taken because the pending handle was dropped.
    ///
    /// The orphaned handle is dropped here. Registrations whose outcome was
    /// taken stop being watched.
    pub(crate) fn sweep_unclaimed(&mut self) -> Vec<RegistrationId> {
        let mut abandoned = Vec::new();
        let entries = &mut self.entries;
        self.unclaimed.retain(|id| {
            let Some(entry) = entries.get_mut(id) else {
                return false;
            };
            let Some(completion) = entry.completion.take() else {
                return false;
            };
            if Arc::strong_count(&completion) > 1 {
                if completion.is_taken() {
                    return false;
                }
                entry.completion = Some(completion);
                return true;
            }
            trace!(registration_id = %id, "dropping unclaimed handle");
            drop(completion.take());
            if entry.state == LifecycleState::Active {
                abandoned.push(*id);
            }
            false
        });
        abandoned
    }

    #[must_use]
    pub fn unclaimed_len(&self) -> usize {
        self.unclaimed.len()
    }

    /// Empties the table, handing back every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = Entry> + '_ {
        self.by_assigned_id.clear();
        self.unclaimed.clear();
        self.entries.drain().map(|(_, entry)| entry)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of creates still awaiting a driver response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == LifecycleState::Initialized)
            .count()
    }
}

/// Allocates the outcome slot for a new pending handle.
pub(crate) fn completion() -> Arc<Completion> {
    Arc::new(Completion::new())
}
