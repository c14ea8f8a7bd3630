//! Commands from application threads to the conductor.
//!
//! The command channel is bounded. A full channel is reported to the caller
//! as [`ClientError::QueueFull`] straight away; nothing ever blocks waiting
//! for space.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::error::ClientError;
use crate::registry::Completion;
use crate::sync::mpsc;
use crate::types::{RegistrationId, ResourceKind};

/// Longest counter label the driver accepts, in bytes.
pub const MAX_LABEL_LENGTH: usize = 380;

/// Longest counter key the driver accepts, in bytes.
pub const MAX_KEY_LENGTH: usize = 112;

/// Operation carried by a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    AddCounter,
    RemoveCounter,
    AddPublication,
    RemovePublication,
    AddSubscription,
    RemoveSubscription,
}

impl Opcode {
    /// Kind of resource this opcode acts on.
    #[must_use]
    pub const fn kind(self) -> ResourceKind {
        match self {
            Self::AddCounter | Self::RemoveCounter => ResourceKind::Counter,
            Self::AddPublication | Self::RemovePublication => ResourceKind::Publication,
            Self::AddSubscription | Self::RemoveSubscription => ResourceKind::Subscription,
        }
    }

    #[must_use]
    pub const fn is_create(self) -> bool {
        matches!(
            self,
            Self::AddCounter | Self::AddPublication | Self::AddSubscription
        )
    }

    /// Remove opcode for a resource kind.
    #[must_use]
    pub const fn remove(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Counter => Self::RemoveCounter,
            ResourceKind::Publication => Self::RemovePublication,
            ResourceKind::Subscription => Self::RemoveSubscription,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Opcode-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    AddCounter {
        type_id: i32,
        key: Vec<u8>,
        label: String,
    },
    AddPublication {
        channel: String,
        stream_id: i32,
        exclusive: bool,
    },
    AddSubscription {
        channel: String,
        stream_id: i32,
    },
    /// Tear down the resource created under the command's registration id.
    Remove(ResourceKind),
}

/// A request for the conductor. Moved into the channel, so immutable once
/// enqueued.
#[derive(Debug, Clone)]
pub struct Command {
    pub registration_id: RegistrationId,
    pub body: CommandBody,
    /// Outcome slot of the pending handle waiting on a create. A dead
    /// reference means the caller gave up before the command was forwarded.
    pub(crate) completion: Option<Weak<Completion>>,
}

impl Command {
    #[must_use]
    pub const fn new(registration_id: RegistrationId, body: CommandBody) -> Self {
        Self {
            registration_id,
            body,
            completion: None,
        }
    }

    pub(crate) fn with_completion(mut self, completion: &Arc<Completion>) -> Self {
        self.completion = Some(Arc::downgrade(completion));
        self
    }

    #[must_use]
    pub const fn remove(kind: ResourceKind, registration_id: RegistrationId) -> Self {
        Self::new(registration_id, CommandBody::Remove(kind))
    }

    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match &self.body {
            CommandBody::AddCounter { .. } => Opcode::AddCounter,
            CommandBody::AddPublication { .. } => Opcode::AddPublication,
            CommandBody::AddSubscription { .. } => Opcode::AddSubscription,
            CommandBody::Remove(kind) => Opcode::remove(*kind),
        }
    }
}

/// Producer end of the command channel.
///
/// Cloned into every handle as its back-reference to the conductor. Holds no
/// ownership over the conductor itself.
#[derive(Clone)]
pub struct CommandChannel {
    tx: mpsc::Sender<Command>,
    closed: Arc<AtomicBool>,
}

/// Consumer end, owned by the conductor.
pub struct CommandReceiver {
    rx: mpsc::Receiver<Command>,
    closed: Arc<AtomicBool>,
}

/// Creates a command channel with room for `capacity` commands.
#[must_use]
pub fn channel(capacity: usize) -> (CommandChannel, CommandReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let closed = Arc::new(AtomicBool::new(false));
    (
        CommandChannel {
            tx,
            closed: Arc::clone(&closed),
        },
        CommandReceiver { rx, closed },
    )
}

impl CommandChannel {
    /// Enqueues a command without blocking.
    ///
    /// # Errors
    ///
    /// - [`ClientError::QueueFull`] when at capacity (retryable).
    /// - [`ClientError::Closed`] once the conductor has shut down.
    pub fn submit(&self, command: Command) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.tx.push(command).map_err(|_| ClientError::QueueFull)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

impl CommandReceiver {
    #[must_use]
    pub fn poll(&self) -> Option<Command> {
        self.rx.pop()
    }

    /// Rejects further submissions. Commands already queued stay readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn add_counter(id: i64) -> Command {
        Command::new(
            RegistrationId::new(id),
            CommandBody::AddCounter {
                type_id: 1,
                key: Vec::new(),
                label: format!("counter-{id}"),
            },
        )
    }

    #[test]
    fn test_opcodes_match_bodies() {
        assert_eq!(add_counter(1).opcode(), Opcode::AddCounter);
        let remove = Command::remove(ResourceKind::Publication, RegistrationId::new(3));
        assert_eq!(remove.opcode(), Opcode::RemovePublication);
        assert!(!remove.opcode().is_create());
        assert_eq!(Opcode::AddSubscription.kind(), ResourceKind::Subscription);
    }

    #[test]
    fn test_submit_past_capacity_reports_queue_full_without_blocking() {
        let (tx, rx) = channel(2);
        tx.submit(add_counter(1)).unwrap();
        tx.submit(add_counter(2)).unwrap();

        let start = std::time::Instant::now();
        assert_eq!(tx.submit(add_counter(3)).unwrap_err(), ClientError::QueueFull);
        assert!(start.elapsed() < Duration::from_millis(100));

        assert_eq!(rx.poll().map(|c| c.registration_id.get()), Some(1));
        tx.submit(add_counter(3)).unwrap();
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_closed_channel_rejects_submissions() {
        let (tx, rx) = channel(4);
        tx.submit(add_counter(1)).unwrap();
        rx.close();

        assert!(tx.is_closed());
        assert_eq!(tx.submit(add_counter(2)).unwrap_err(), ClientError::Closed);
        assert!(rx.poll().is_some(), "queued commands survive close");
    }
}
