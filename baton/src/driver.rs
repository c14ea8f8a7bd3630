//! The boundary between the conductor and the driver.
//!
//! The driver is reached through three things only:
//! - a command ring the conductor writes ([`DriverProxy`]),
//! - a response ring the conductor reads ([`ResponseReceiver`]),
//! - a heartbeat timestamp the driver keeps fresh ([`HeartbeatReader`]).
//!
//! Plus the counters region both sides map. [`connection`] wires all four
//! together for an in-process driver such as [`loopback::LoopbackDriver`].

pub mod loopback;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::region::CountersRegion;
use crate::sync::spsc;
use crate::types::{ClientId, DriverAssignedId, RegistrationId, ResourceKind};

/// Command as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    AddCounter {
        client_id: ClientId,
        registration_id: RegistrationId,
        type_id: i32,
        key: Vec<u8>,
        label: String,
    },
    AddPublication {
        client_id: ClientId,
        registration_id: RegistrationId,
        channel: String,
        stream_id: i32,
        exclusive: bool,
    },
    AddSubscription {
        client_id: ClientId,
        registration_id: RegistrationId,
        channel: String,
        stream_id: i32,
    },
    /// Tear down the resource created under `registration_id`. Acknowledged
    /// with `OperationSucceeded` for the same id.
    Remove {
        client_id: ClientId,
        registration_id: RegistrationId,
        kind: ResourceKind,
    },
    /// Client is alive. Sent periodically by the conductor.
    ClientKeepalive { client_id: ClientId },
    /// Client is going away. The driver releases everything it owns.
    ClientClose { client_id: ClientId },
}

impl DriverCommand {
    /// Registration the command is correlated with, if any.
    #[must_use]
    pub const fn registration_id(&self) -> Option<RegistrationId> {
        match self {
            Self::AddCounter {
                registration_id, ..
            }
            | Self::AddPublication {
                registration_id, ..
            }
            | Self::AddSubscription {
                registration_id, ..
            }
            | Self::Remove {
                registration_id, ..
            } => Some(*registration_id),
            Self::ClientKeepalive { .. } | Self::ClientClose { .. } => None,
        }
    }

    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        match self {
            Self::AddCounter { client_id, .. }
            | Self::AddPublication { client_id, .. }
            | Self::AddSubscription { client_id, .. }
            | Self::Remove { client_id, .. }
            | Self::ClientKeepalive { client_id }
            | Self::ClientClose { client_id } => *client_id,
        }
    }
}

/// Response from the driver, already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverResponse {
    /// A create or remove finished. `driver_assigned_id` is meaningful for
    /// creates only.
    OperationSucceeded {
        registration_id: RegistrationId,
        driver_assigned_id: DriverAssignedId,
    },
    OperationFailed {
        registration_id: RegistrationId,
        code: i32,
        message: String,
    },
    /// The driver tore a resource down on its own.
    ResourceUnavailable { driver_assigned_id: DriverAssignedId },
}

/// Outbound path to the driver. Never blocks.
pub trait DriverProxy: Send {
    /// Enqueues a command for the driver.
    ///
    /// # Errors
    ///
    /// Hands the command back when the driver's ring is full.
    fn send(&mut self, command: DriverCommand) -> Result<(), DriverCommand>;
}

/// [`DriverProxy`] over an SPSC ring.
pub struct RingDriverProxy {
    ring: spsc::Producer<DriverCommand>,
}

impl RingDriverProxy {
    #[must_use]
    pub const fn new(ring: spsc::Producer<DriverCommand>) -> Self {
        Self { ring }
    }
}

impl DriverProxy for RingDriverProxy {
    fn send(&mut self, command: DriverCommand) -> Result<(), DriverCommand> {
        self.ring.push(command)
    }
}

/// Inbound path from the driver.
pub struct ResponseReceiver {
    ring: spsc::Consumer<DriverResponse>,
}

impl ResponseReceiver {
    #[must_use]
    pub const fn new(ring: spsc::Consumer<DriverResponse>) -> Self {
        Self { ring }
    }

    #[must_use]
    pub fn poll(&self) -> Option<DriverResponse> {
        self.ring.pop()
    }
}

/// Driver side of the heartbeat.
#[derive(Debug)]
pub struct HeartbeatWriter {
    last_ms: Arc<AtomicI64>,
}

impl HeartbeatWriter {
    pub fn publish(&self, now_ms: i64) {
        self.last_ms.store(now_ms, Ordering::Release);
    }
}

/// Client side of the heartbeat. Read-only.
#[derive(Debug, Clone)]
pub struct HeartbeatReader {
    last_ms: Arc<AtomicI64>,
}

impl HeartbeatReader {
    /// Last heartbeat in epoch ms. Zero until the driver has written one.
    #[must_use]
    pub fn last_ms(&self) -> i64 {
        self.last_ms.load(Ordering::Acquire)
    }
}

/// Creates a heartbeat cell, initially zero.
#[must_use]
pub fn heartbeat() -> (HeartbeatWriter, HeartbeatReader) {
    let last_ms = Arc::new(AtomicI64::new(0));
    (
        HeartbeatWriter {
            last_ms: Arc::clone(&last_ms),
        },
        HeartbeatReader { last_ms },
    )
}

/// Everything a client needs to talk to one driver.
pub struct DriverConnection {
    pub proxy: Box<dyn DriverProxy>,
    pub responses: ResponseReceiver,
    pub heartbeat: HeartbeatReader,
    pub counters: Arc<CountersRegion>,
}

/// Driver's ends of a [`DriverConnection`].
pub struct DriverEndpoint {
    pub commands: spsc::Consumer<DriverCommand>,
    pub responses: spsc::Producer<DriverResponse>,
    pub heartbeat: HeartbeatWriter,
    pub counters: Arc<CountersRegion>,
}

/// Sizing of the rings and region behind a [`connection`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub command_ring_capacity: usize,
    pub response_ring_capacity: usize,
    pub max_counters: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            command_ring_capacity: 256,
            response_ring_capacity: 256,
            max_counters: 1024,
        }
    }
}

/// Wires up both ends of a driver connection.
///
/// # Panics
///
/// Panics if either ring capacity is zero.
#[must_use]
pub fn connection(config: ConnectionConfig) -> (DriverEndpoint, DriverConnection) {
    let (cmd_tx, cmd_rx) = spsc::channel(config.command_ring_capacity);
    let (resp_tx, resp_rx) = spsc::channel(config.response_ring_capacity);
    let (writer, reader) = heartbeat();
    let counters = CountersRegion::new(config.max_counters);

    (
        DriverEndpoint {
            commands: cmd_rx,
            responses: resp_tx,
            heartbeat: writer,
            counters: Arc::clone(&counters),
        },
        DriverConnection {
            proxy: Box::new(RingDriverProxy::new(cmd_tx)),
            responses: ResponseReceiver::new(resp_rx),
            heartbeat: reader,
            counters,
        },
    )
}
