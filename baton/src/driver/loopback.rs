//! In-process driver.
//!
//! Serves the command ring of a single [`DriverConnection`], allocates
//! counters in the shared region and keeps the heartbeat fresh. Used by the
//! demo binary and the tests in place of a real driver process.
//!
//! Test hooks: the heartbeat can be paused to simulate a hung driver, and
//! arbitrary responses can be injected to exercise the conductor's handling
//! of malformed or unexpected replies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::EpochClock;
use crate::error::DriverErrorCode;
use crate::sync::mpsc;
use crate::trace::{debug, info, warn};
use crate::types::{ClientId, DriverAssignedId, RegistrationId, ResourceKind};

use super::{ConnectionConfig, DriverCommand, DriverConnection, DriverEndpoint, DriverResponse};

/// Counter type id of a publication's position limit.
pub const PUBLISHER_LIMIT_TYPE_ID: i32 = 1;

/// Counter type id of a subscription's channel status indicator.
pub const CHANNEL_STATUS_TYPE_ID: i32 = 7;

const IPC_CHANNEL: &str = "baton:ipc";
const UDP_PREFIX: &str = "baton:udp?endpoint=";
const INJECT_CAPACITY: usize = 64;

/// Settings for a [`LoopbackDriver`].
#[derive(Debug, Clone, Copy)]
pub struct LoopbackConfig {
    pub connection: ConnectionConfig,
    /// Clients silent for longer than this lose their resources.
    pub client_timeout: Duration,
    /// Sleep between idle iterations when running on its own thread.
    pub idle_sleep: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            client_timeout: Duration::from_secs(10),
            idle_sleep: Duration::from_millis(1),
        }
    }
}

/// Checks a channel URI: `baton:ipc` or `baton:udp?endpoint=host:port`.
///
/// # Errors
///
/// Returns a description of what is wrong with the URI.
pub fn validate_channel(channel: &str) -> Result<(), String> {
    if channel == IPC_CHANNEL {
        return Ok(());
    }
    let Some(endpoint) = channel.strip_prefix(UDP_PREFIX) else {
        return Err(format!("unsupported channel: {channel}"));
    };
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return Err(format!("endpoint missing port: {endpoint}"));
    };
    if host.is_empty() {
        return Err(format!("endpoint missing host: {endpoint}"));
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(()),
        _ => Err(format!("invalid port: {port}")),
    }
}

/// Remote control for a driver, usable while it runs on its own thread.
#[derive(Clone)]
pub struct LoopbackControl {
    heartbeat_paused: Arc<AtomicBool>,
    injected: mpsc::Sender<DriverResponse>,
}

impl LoopbackControl {
    /// Stops heartbeat updates, as if the driver had hung.
    pub fn pause_heartbeat(&self) {
        self.heartbeat_paused.store(true, Ordering::Release);
    }

    pub fn resume_heartbeat(&self) {
        self.heartbeat_paused.store(false, Ordering::Release);
    }

    /// Queues a raw response to be delivered on the next iteration.
    ///
    /// Returns `false` if the injection queue is full.
    pub fn inject(&self, response: DriverResponse) -> bool {
        self.injected.push(response).is_ok()
    }
}

struct Resource {
    kind: ResourceKind,
    id: DriverAssignedId,
}

struct ClientSession {
    last_keepalive_ms: i64,
    resources: HashMap<RegistrationId, Resource>,
}

/// Single-client in-process driver.
pub struct LoopbackDriver {
    endpoint: DriverEndpoint,
    config: LoopbackConfig,
    sessions: HashMap<ClientId, ClientSession>,
    backlog: VecDeque<DriverResponse>,
    heartbeat_paused: Arc<AtomicBool>,
    injected: mpsc::Receiver<DriverResponse>,
    control: LoopbackControl,
}

impl LoopbackDriver {
    /// Creates a driver plus the connection a client uses to reach it.
    #[must_use]
    pub fn new(config: LoopbackConfig) -> (Self, DriverConnection) {
        let (endpoint, connection) = super::connection(config.connection);
        let heartbeat_paused = Arc::new(AtomicBool::new(false));
        let (inject_tx, inject_rx) = mpsc::channel(INJECT_CAPACITY);
        let control = LoopbackControl {
            heartbeat_paused: Arc::clone(&heartbeat_paused),
            injected: inject_tx,
        };

        let driver = Self {
            endpoint,
            config,
            sessions: HashMap::new(),
            backlog: VecDeque::new(),
            heartbeat_paused,
            injected: inject_rx,
            control,
        };
        (driver, connection)
    }

    #[must_use]
    pub fn control(&self) -> LoopbackControl {
        self.control.clone()
    }

    /// Heartbeat alone, without serving commands. Lets a client see a live
    /// driver before the first `do_work`.
    pub fn publish_heartbeat(&self, now_ms: i64) {
        if !self.heartbeat_paused.load(Ordering::Acquire) {
            self.endpoint.heartbeat.publish(now_ms);
        }
    }

    /// Number of resources currently held for clients.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.sessions.values().map(|s| s.resources.len()).sum()
    }

    /// Number of clients with an open session.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    /// Tears down a resource on the driver's own initiative and tells the
    /// client through `ResourceUnavailable`.
    pub fn revoke(&mut self, id: DriverAssignedId) -> bool {
        let mut found = false;
        for session in self.sessions.values_mut() {
            session.resources.retain(|_, r| {
                let hit = r.id == id;
                found |= hit;
                !hit
            });
        }
        if found {
            self.endpoint.counters.free(id);
            self.respond(DriverResponse::ResourceUnavailable {
                driver_assigned_id: id,
            });
        }
        found
    }

    /// One driver iteration. Returns the amount of work done.
    pub fn do_work(&mut self, now_ms: i64) -> usize {
        self.publish_heartbeat(now_ms);

        let mut work = self.flush_backlog();

        while let Some(response) = self.injected.pop() {
            self.respond(response);
            work += 1;
        }

        while let Some(command) = self.endpoint.commands.pop() {
            self.on_command(command, now_ms);
            work += 1;
        }

        work + self.expire_clients(now_ms)
    }

    fn on_command(&mut self, command: DriverCommand, now_ms: i64) {
        let client_id = command.client_id();
        let session = self
            .sessions
            .entry(client_id)
            .or_insert_with(|| {
                info!(client = %client_id, "client connected");
                ClientSession {
                    last_keepalive_ms: now_ms,
                    resources: HashMap::new(),
                }
            });
        session.last_keepalive_ms = now_ms;

        match command {
            DriverCommand::AddCounter {
                registration_id,
                type_id,
                ..
            } => {
                debug!(registration_id = %registration_id, type_id, "add counter");
                self.add(client_id, registration_id, ResourceKind::Counter, type_id);
            }
            DriverCommand::AddPublication {
                registration_id,
                channel,
                ..
            } => {
                if let Err(reason) = validate_channel(&channel) {
                    self.fail(registration_id, DriverErrorCode::InvalidChannel, reason);
                } else {
                    self.add(
                        client_id,
                        registration_id,
                        ResourceKind::Publication,
                        PUBLISHER_LIMIT_TYPE_ID,
                    );
                }
            }
            DriverCommand::AddSubscription {
                registration_id,
                channel,
                ..
            } => {
                if let Err(reason) = validate_channel(&channel) {
                    self.fail(registration_id, DriverErrorCode::InvalidChannel, reason);
                } else {
                    self.add(
                        client_id,
                        registration_id,
                        ResourceKind::Subscription,
                        CHANNEL_STATUS_TYPE_ID,
                    );
                }
            }
            DriverCommand::Remove {
                registration_id,
                kind,
                ..
            } => self.remove(client_id, registration_id, kind),
            DriverCommand::ClientKeepalive { .. } => {}
            DriverCommand::ClientClose { .. } => {
                info!(client = %client_id, "client closed");
                self.release_client(client_id);
            }
        }
    }

    fn add(
        &mut self,
        client_id: ClientId,
        registration_id: RegistrationId,
        kind: ResourceKind,
        type_id: i32,
    ) {
        let duplicate = self
            .sessions
            .get(&client_id)
            .is_some_and(|s| s.resources.contains_key(&registration_id));
        if duplicate {
            self.fail(
                registration_id,
                DriverErrorCode::MalformedCommand,
                format!("registration {registration_id} already in use"),
            );
            return;
        }

        let Some(id) = self.endpoint.counters.allocate(type_id) else {
            self.fail(
                registration_id,
                DriverErrorCode::ResourceExhausted,
                "counters region full".to_owned(),
            );
            return;
        };

        if let Some(session) = self.sessions.get_mut(&client_id) {
            session.resources.insert(registration_id, Resource { kind, id });
        }
        self.respond(DriverResponse::OperationSucceeded {
            registration_id,
            driver_assigned_id: id,
        });
    }

    fn remove(&mut self, client_id: ClientId, registration_id: RegistrationId, kind: ResourceKind) {
        let removed = self.sessions.get_mut(&client_id).and_then(|s| {
            if s.resources.get(&registration_id).is_some_and(|r| r.kind == kind) {
                s.resources.remove(&registration_id)
            } else {
                None
            }
        });

        match removed {
            Some(resource) => {
                self.endpoint.counters.free(resource.id);
                self.respond(DriverResponse::OperationSucceeded {
                    registration_id,
                    driver_assigned_id: resource.id,
                });
            }
            None => {
                let code = match kind {
                    ResourceKind::Counter => DriverErrorCode::UnknownCounter,
                    ResourceKind::Publication => DriverErrorCode::UnknownPublication,
                    ResourceKind::Subscription => DriverErrorCode::UnknownSubscription,
                };
                self.fail(
                    registration_id,
                    code,
                    format!("unknown {kind} registration {registration_id}"),
                );
            }
        }
    }

    fn release_client(&mut self, client_id: ClientId) {
        if let Some(session) = self.sessions.remove(&client_id) {
            for resource in session.resources.values() {
                self.endpoint.counters.free(resource.id);
            }
        }
    }

    fn expire_clients(&mut self, now_ms: i64) -> usize {
        let timeout_ms = i64::try_from(self.config.client_timeout.as_millis()).unwrap_or(i64::MAX);
        let expired: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now_ms.saturating_sub(s.last_keepalive_ms) > timeout_ms)
            .map(|(id, _)| *id)
            .collect();

        for client_id in &expired {
            warn!(client = %client_id, "client keepalive timeout");
            self.release_client(*client_id);
        }
        expired.len()
    }

    fn fail(&mut self, registration_id: RegistrationId, code: DriverErrorCode, message: String) {
        debug!(registration_id = %registration_id, code = ?code, message = %message, "operation failed");
        self.respond(DriverResponse::OperationFailed {
            registration_id,
            code: code.into(),
            message,
        });
    }

    fn respond(&mut self, response: DriverResponse) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(response);
            return;
        }
        if let Err(response) = self.endpoint.responses.push(response) {
            self.backlog.push_back(response);
        }
    }

    fn flush_backlog(&mut self) -> usize {
        let mut sent = 0;
        while let Some(response) = self.backlog.pop_front() {
            if let Err(response) = self.endpoint.responses.push(response) {
                self.backlog.push_front(response);
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Runs the driver on its own thread until [`LoopbackHandle::shutdown`].
    ///
    /// # Panics
    ///
    /// Panics if the thread cannot be spawned.
    #[must_use]
    pub fn spawn(mut self, clock: Arc<dyn EpochClock>) -> LoopbackHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let control = self.control();
        let flag = Arc::clone(&shutdown);

        self.publish_heartbeat(clock.time_ms());
        let join = thread::Builder::new()
            .name("baton-driver".into())
            .spawn(move || {
                info!("loopback driver started");
                while !flag.load(Ordering::Acquire) {
                    if self.do_work(clock.time_ms()) == 0 {
                        thread::sleep(self.config.idle_sleep);
                    }
                }
                info!("loopback driver exiting");
                self
            })
            .expect("failed to spawn loopback driver thread");

        LoopbackHandle {
            shutdown,
            control,
            join: Some(join),
        }
    }
}

/// Running [`LoopbackDriver`].
pub struct LoopbackHandle {
    shutdown: Arc<AtomicBool>,
    control: LoopbackControl,
    join: Option<JoinHandle<LoopbackDriver>>,
}

impl LoopbackHandle {
    #[must_use]
    pub const fn control(&self) -> &LoopbackControl {
        &self.control
    }

    /// Stops the driver thread and hands the driver back.
    pub fn shutdown(mut self) -> Option<LoopbackDriver> {
        self.stop()
    }

    fn stop(&mut self) -> Option<LoopbackDriver> {
        self.shutdown.store(true, Ordering::Release);
        self.join.take().and_then(|h| h.join().ok())
    }
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (LoopbackDriver, DriverConnection, ClientId) {
        let (driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
        (driver, connection, ClientId::generate())
    }

    fn add_counter(client_id: ClientId, id: i64) -> DriverCommand {
        DriverCommand::AddCounter {
            client_id,
            registration_id: RegistrationId::new(id),
            type_id: 101,
            key: Vec::new(),
            label: "test".to_owned(),
        }
    }

    #[test]
    fn test_channel_validation() {
        assert!(validate_channel("baton:ipc").is_ok());
        assert!(validate_channel("baton:udp?endpoint=localhost:40123").is_ok());
        assert!(validate_channel("baton:udp?endpoint=:40123").is_err());
        assert!(validate_channel("baton:udp?endpoint=localhost").is_err());
        assert!(validate_channel("baton:udp?endpoint=localhost:0").is_err());
        assert!(validate_channel("aeron:ipc").is_err());
    }

    #[test]
    fn test_add_and_remove_counter() {
        let (mut driver, mut conn, client) = setup();

        conn.proxy.send(add_counter(client, 1)).unwrap();
        driver.do_work(100);

        let Some(DriverResponse::OperationSucceeded {
            registration_id,
            driver_assigned_id,
        }) = conn.responses.poll()
        else {
            panic!("expected success");
        };
        assert_eq!(registration_id, RegistrationId::new(1));
        assert_eq!(conn.counters.type_id(driver_assigned_id), Some(101));
        assert_eq!(conn.heartbeat.last_ms(), 100);

        conn.proxy
            .send(DriverCommand::Remove {
                client_id: client,
                registration_id,
                kind: ResourceKind::Counter,
            })
            .unwrap();
        driver.do_work(101);

        assert!(matches!(
            conn.responses.poll(),
            Some(DriverResponse::OperationSucceeded { .. })
        ));
        assert!(!conn.counters.is_allocated(driver_assigned_id));
        assert_eq!(driver.resource_count(), 0);
    }

    #[test]
    fn test_remove_unknown_fails_with_kind_specific_code() {
        let (mut driver, mut conn, client) = setup();
        conn.proxy
            .send(DriverCommand::Remove {
                client_id: client,
                registration_id: RegistrationId::new(5),
                kind: ResourceKind::Publication,
            })
            .unwrap();
        driver.do_work(1);

        match conn.responses.poll() {
            Some(DriverResponse::OperationFailed { code, .. }) => {
                assert_eq!(
                    DriverErrorCode::from(code),
                    DriverErrorCode::UnknownPublication
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_channel_is_rejected() {
        let (mut driver, mut conn, client) = setup();
        conn.proxy
            .send(DriverCommand::AddSubscription {
                client_id: client,
                registration_id: RegistrationId::new(2),
                channel: "tcp://nope".to_owned(),
                stream_id: 1,
            })
            .unwrap();
        driver.do_work(1);

        assert!(matches!(
            conn.responses.poll(),
            Some(DriverResponse::OperationFailed { code: 1, .. })
        ));
    }

    #[test]
    fn test_region_exhaustion_reports_resource_exhausted() {
        let (mut driver, mut conn) = LoopbackDriver::new(LoopbackConfig {
            connection: ConnectionConfig {
                max_counters: 1,
                ..ConnectionConfig::default()
            },
            ..LoopbackConfig::default()
        });
        let client = ClientId::generate();
        conn.proxy.send(add_counter(client, 1)).unwrap();
        conn.proxy.send(add_counter(client, 2)).unwrap();
        driver.do_work(1);

        assert!(matches!(
            conn.responses.poll(),
            Some(DriverResponse::OperationSucceeded { .. })
        ));
        assert!(matches!(
            conn.responses.poll(),
            Some(DriverResponse::OperationFailed { code: 10, .. })
        ));
    }

    #[test]
    fn test_paused_heartbeat_stays_stale() {
        let (mut driver, conn, _) = setup();
        driver.do_work(10);
        driver.control().pause_heartbeat();
        driver.do_work(20);
        assert_eq!(conn.heartbeat.last_ms(), 10);

        driver.control().resume_heartbeat();
        driver.do_work(30);
        assert_eq!(conn.heartbeat.last_ms(), 30);
    }

    #[test]
    fn test_injected_responses_are_delivered() {
        let (mut driver, conn, _) = setup();
        let injected = DriverResponse::OperationSucceeded {
            registration_id: RegistrationId::new(77),
            driver_assigned_id: DriverAssignedId::new(3),
        };
        assert!(driver.control().inject(injected.clone()));
        driver.do_work(1);
        assert_eq!(conn.responses.poll(), Some(injected));
    }

    #[test]
    fn test_client_close_and_keepalive_timeout_release_resources() {
        let (mut driver, mut conn, client) = setup();
        conn.proxy.send(add_counter(client, 1)).unwrap();
        driver.do_work(0);
        assert_eq!(driver.resource_count(), 1);

        conn.proxy
            .send(DriverCommand::ClientClose { client_id: client })
            .unwrap();
        driver.do_work(1);
        assert_eq!(driver.client_count(), 0);
        assert_eq!(conn.counters.allocated(), 0);

        conn.proxy.send(add_counter(client, 2)).unwrap();
        driver.do_work(2);
        assert_eq!(driver.resource_count(), 1);

        driver.do_work(2 + 10_001);
        assert_eq!(driver.client_count(), 0);
        assert_eq!(conn.counters.allocated(), 0);
    }

    #[test]
    fn test_revoke_notifies_unavailable() {
        let (mut driver, mut conn, client) = setup();
        conn.proxy.send(add_counter(client, 1)).unwrap();
        driver.do_work(0);
        let Some(DriverResponse::OperationSucceeded {
            driver_assigned_id, ..
        }) = conn.responses.poll()
        else {
            panic!("expected success");
        };

        assert!(driver.revoke(driver_assigned_id));
        assert_eq!(
            conn.responses.poll(),
            Some(DriverResponse::ResourceUnavailable { driver_assigned_id })
        );
        assert!(!driver.revoke(driver_assigned_id));
    }
}
