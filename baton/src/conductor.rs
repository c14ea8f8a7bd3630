//! The client conductor.
//!
//! Single owner of the [`Registry`] and the only thread allowed to move a
//! handle to `Closed`. Each [`do_work`](ClientConductor::do_work) iteration:
//!
//! 1. checks driver liveness,
//! 2. forwards queued commands to the driver,
//! 3. applies driver responses and posts outcomes,
//! 4. sends a client keepalive when due.
//!
//! Nothing here blocks: a full driver ring parks commands in a local backlog
//! that is flushed first on the next iteration.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use crate::command::{Command, CommandBody, CommandChannel, CommandReceiver};
use crate::config::ClientConfig;
use crate::driver::{DriverCommand, DriverConnection, DriverProxy, DriverResponse, ResponseReceiver};
use crate::error::ClientError;
use crate::handle::{LifecycleState, ResourceHandle};
use crate::liveness::{DriverLivenessMonitor, LivenessEvent};
use crate::region::{CountersRegion, SharedRef};
use crate::registry::{Entry, Registry};
use crate::trace::{debug, info, warn};
use crate::types::{ClientId, DriverAssignedId, RegistrationId, ResourceKind};

/// Callbacks about resource state, invoked on the conductor thread.
///
/// Callbacks must not block: the conductor does nothing else while one runs.
pub trait ResourceListener: Send {
    /// A create was acknowledged and its handle posted.
    fn on_available(
        &mut self,
        _kind: ResourceKind,
        _registration_id: RegistrationId,
        _driver_assigned_id: DriverAssignedId,
    ) {
    }

    /// The driver tore a resource down on its own.
    fn on_unavailable(
        &mut self,
        _kind: ResourceKind,
        _registration_id: RegistrationId,
        _driver_assigned_id: DriverAssignedId,
    ) {
    }

    /// Asynchronous error: driver timeout, driver-reported failure or
    /// protocol violation.
    fn on_error(&mut self, _error: &ClientError) {}

    /// The client context closed.
    fn on_close(&mut self) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl ResourceListener for NoopListener {}

/// Conductor state. Driven by a dedicated thread or by `Client::invoke`.
pub struct ClientConductor {
    client_id: ClientId,
    commands: CommandReceiver,
    command_channel: CommandChannel,
    proxy: Box<dyn DriverProxy>,
    responses: ResponseReceiver,
    counters: Arc<CountersRegion>,
    registry: Registry,
    liveness: DriverLivenessMonitor,
    listener: Box<dyn ResourceListener>,
    backlog: VecDeque<DriverCommand>,
    command_batch_limit: usize,
    response_batch_limit: usize,
    keepalive_interval_ms: i64,
    last_keepalive_ms: i64,
    closed: bool,
}

impl ClientConductor {
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        client_id: ClientId,
        commands: CommandReceiver,
        command_channel: CommandChannel,
        connection: DriverConnection,
        listener: Box<dyn ResourceListener>,
        now_ms: i64,
    ) -> Self {
        let DriverConnection {
            proxy,
            responses,
            heartbeat,
            counters,
        } = connection;

        Self {
            client_id,
            commands,
            command_channel,
            proxy,
            responses,
            counters,
            registry: Registry::new(),
            liveness: DriverLivenessMonitor::new(heartbeat, config.driver_timeout_ms(), now_ms),
            listener,
            backlog: VecDeque::new(),
            command_batch_limit: config.command_batch_limit,
            response_batch_limit: config.response_batch_limit,
            keepalive_interval_ms: config.keepalive_interval_ms(),
            last_keepalive_ms: now_ms,
            closed: false,
        }
    }

    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub const fn is_driver_active(&self) -> bool {
        self.liveness.is_active()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Commands waiting for room in the driver's ring.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Runs one iteration. Returns the amount of work done, zero when idle.
    pub fn do_work(&mut self, now_ms: i64) -> usize {
        if self.closed {
            return 0;
        }

        let mut work = match self.liveness.check(now_ms) {
            LivenessEvent::BecameInactive { age_ms } => {
                self.on_driver_timeout(age_ms);
                1
            }
            LivenessEvent::Recovered => {
                info!(client = %self.client_id, "driver heartbeat recovered");
                self.last_keepalive_ms = now_ms;
                1
            }
            LivenessEvent::Unchanged => 0,
        };

        work += self.process_commands(now_ms);
        work += self.process_responses();
        work += self.sweep_unclaimed();
        work + self.send_keepalive(now_ms)
    }

    /// Removes resources whose pending handle was dropped after the outcome
    /// was posted but before it was taken.
    fn sweep_unclaimed(&mut self) -> usize {
        let abandoned = self.registry.sweep_unclaimed();
        for &registration_id in &abandoned {
            debug!(registration_id = %registration_id, "posted handle never claimed, removing");
            self.request_remove(registration_id);
        }
        abandoned.len()
    }

    fn process_commands(&mut self, now_ms: i64) -> usize {
        if !self.liveness.is_active() {
            return self.reject_commands(now_ms);
        }

        let mut work = self.flush_backlog();
        if !self.backlog.is_empty() {
            return work;
        }

        for _ in 0..self.command_batch_limit {
            let Some(command) = self.commands.poll() else {
                break;
            };
            work += 1;
            if let Some(outbound) = self.on_command(command, now_ms) {
                self.forward(outbound);
                if !self.backlog.is_empty() {
                    break;
                }
            }
        }
        work
    }

    /// Turns an application command into a driver command, updating the
    /// registry on the way. `None` means nothing is sent.
    fn on_command(&mut self, command: Command, now_ms: i64) -> Option<DriverCommand> {
        let Command {
            registration_id,
            body,
            completion,
        } = command;
        let client_id = self.client_id;

        let (kind, detail, outbound) = match body {
            CommandBody::Remove(kind) => return self.on_remove(kind, registration_id),
            CommandBody::AddCounter {
                type_id,
                key,
                label,
            } => (
                ResourceKind::Counter,
                label.clone(),
                DriverCommand::AddCounter {
                    client_id,
                    registration_id,
                    type_id,
                    key,
                    label,
                },
            ),
            CommandBody::AddPublication {
                channel,
                stream_id,
                exclusive,
            } => (
                ResourceKind::Publication,
                channel.clone(),
                DriverCommand::AddPublication {
                    client_id,
                    registration_id,
                    channel,
                    stream_id,
                    exclusive,
                },
            ),
            CommandBody::AddSubscription { channel, stream_id } => (
                ResourceKind::Subscription,
                channel.clone(),
                DriverCommand::AddSubscription {
                    client_id,
                    registration_id,
                    channel,
                    stream_id,
                },
            ),
        };

        let Some(completion) = completion.and_then(|c| c.upgrade()) else {
            debug!(registration_id = %registration_id, "create abandoned before forwarding");
            return None;
        };

        let entry =
            Entry::new(registration_id, kind, now_ms, detail).with_completion(Arc::clone(&completion));
        if let Err(err) = self.registry.insert(entry) {
            warn!(registration_id = %registration_id, error = %err, "cannot register create");
            completion.post(Err(err));
            return None;
        }

        debug!(registration_id = %registration_id, kind = %kind, "forwarding create");
        Some(outbound)
    }

    fn on_remove(&mut self, kind: ResourceKind, registration_id: RegistrationId) -> Option<DriverCommand> {
        let Some(entry) = self.registry.get_mut(registration_id) else {
            debug!(registration_id = %registration_id, "remove for unknown registration ignored");
            return None;
        };
        if entry.state != LifecycleState::Active {
            return None;
        }
        entry.state = LifecycleState::CloseRequested;
        debug!(registration_id = %registration_id, kind = %kind, "forwarding remove");
        Some(DriverCommand::Remove {
            client_id: self.client_id,
            registration_id,
            kind,
        })
    }

    /// Driver is down: creates fail, removes have nothing left to remove.
    fn reject_commands(&mut self, now_ms: i64) -> usize {
        let error = ClientError::DriverTimeout {
            age_ms: self.liveness.age_ms(now_ms),
        };
        let mut work = 0;
        for _ in 0..self.command_batch_limit {
            let Some(command) = self.commands.poll() else {
                break;
            };
            work += 1;
            if let Some(completion) = command.completion.and_then(|c| c.upgrade()) {
                completion.post(Err(error.clone()));
            }
        }
        work
    }

    fn forward(&mut self, command: DriverCommand) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(command);
            return;
        }
        if let Err(command) = self.proxy.send(command) {
            debug!("driver command ring full, parking command");
            self.backlog.push_back(command);
        }
    }

    fn flush_backlog(&mut self) -> usize {
        let mut sent = 0;
        while let Some(command) = self.backlog.pop_front() {
            if let Err(command) = self.proxy.send(command) {
                self.backlog.push_front(command);
                break;
            }
            sent += 1;
        }
        sent
    }

    fn process_responses(&mut self) -> usize {
        let mut work = 0;
        for _ in 0..self.response_batch_limit {
            let Some(response) = self.responses.poll() else {
                break;
            };
            self.on_response(response);
            work += 1;
        }
        work
    }

    fn on_response(&mut self, response: DriverResponse) {
        match response {
            DriverResponse::OperationSucceeded {
                registration_id,
                driver_assigned_id,
            } => self.on_operation_succeeded(registration_id, driver_assigned_id),
            DriverResponse::OperationFailed {
                registration_id,
                code,
                message,
            } => self.on_operation_failed(
                registration_id,
                ClientError::Driver {
                    registration_id,
                    code: code.into(),
                    message,
                },
            ),
            DriverResponse::ResourceUnavailable { driver_assigned_id } => {
                self.on_resource_unavailable(driver_assigned_id);
            }
        }
    }

    fn on_operation_succeeded(&mut self, registration_id: RegistrationId, assigned: DriverAssignedId) {
        let Some(state) = self.registry.get(registration_id).map(|e| e.state) else {
            debug!(registration_id = %registration_id, "response for unknown registration ignored");
            return;
        };

        match state {
            LifecycleState::Initialized => self.on_create_acknowledged(registration_id, assigned),
            LifecycleState::CloseRequested => {
                if let Some(mut entry) = self.registry.remove(registration_id) {
                    entry.force_closed();
                    debug!(registration_id = %registration_id, kind = %entry.kind, "close acknowledged");
                }
            }
            LifecycleState::Active => {
                let error = ClientError::Protocol {
                    registration_id,
                    reason: "duplicate success for an active resource".to_owned(),
                };
                warn!(registration_id = %registration_id, "duplicate success response");
                self.listener.on_error(&error);
            }
            LifecycleState::Closed => {}
        }
    }

    fn on_create_acknowledged(&mut self, registration_id: RegistrationId, assigned: DriverAssignedId) {
        if !assigned.is_valid() {
            let error = ClientError::Protocol {
                registration_id,
                reason: format!("invalid driver assigned id {assigned}"),
            };
            if let Some(entry) = self.registry.remove(registration_id) {
                let _ = entry.complete(Err(error.clone()));
            }
            self.listener.on_error(&error);
            return;
        }

        let Some(entry) = self.registry.get(registration_id) else {
            return;
        };
        let kind = entry.kind;
        let handle = ResourceHandle::create(
            self.command_channel.clone(),
            kind,
            registration_id,
            assigned,
            SharedRef::new(&self.counters, assigned),
            &entry.detail,
        );

        let handle = match handle {
            Ok(handle) => handle,
            Err(error) => {
                // Resource exists on the driver but nobody can own it.
                self.registry.activate(registration_id, assigned, Weak::new());
                if let Some(entry) = self.registry.get(registration_id) {
                    let _ = entry.complete(Err(error.clone()));
                }
                self.listener.on_error(&error);
                self.request_remove(registration_id);
                return;
            }
        };

        self.registry
            .activate(registration_id, assigned, handle.lifecycle());
        let delivered = self
            .registry
            .get(registration_id)
            .map(|entry| entry.complete(Ok(handle)));

        match delivered {
            Some(Ok(())) => {
                debug!(
                    registration_id = %registration_id,
                    driver_assigned_id = %assigned,
                    kind = %kind,
                    "resource available"
                );
                self.registry.track_unclaimed(registration_id);
                self.listener.on_available(kind, registration_id, assigned);
            }
            _ => {
                debug!(registration_id = %registration_id, "pending handle abandoned, removing");
                self.request_remove(registration_id);
            }
        }
    }

    /// Issues a remove for an `Active` entry nobody holds a handle to.
    fn request_remove(&mut self, registration_id: RegistrationId) {
        if let Some(entry) = self.registry.get_mut(registration_id) {
            entry.state = LifecycleState::CloseRequested;
            let kind = entry.kind;
            self.forward(DriverCommand::Remove {
                client_id: self.client_id,
                registration_id,
                kind,
            });
        }
    }

    fn on_operation_failed(&mut self, registration_id: RegistrationId, error: ClientError) {
        let Some(state) = self.registry.get(registration_id).map(|e| e.state) else {
            debug!(registration_id = %registration_id, "failure for unknown registration ignored");
            return;
        };

        warn!(registration_id = %registration_id, error = %error, "driver reported failure");
        self.listener.on_error(&error);

        match state {
            LifecycleState::Initialized => {
                if let Some(entry) = self.registry.remove(registration_id) {
                    let _ = entry.complete(Err(error));
                }
            }
            LifecycleState::CloseRequested => {
                if let Some(mut entry) = self.registry.remove(registration_id) {
                    entry.force_closed();
                }
            }
            LifecycleState::Active | LifecycleState::Closed => {}
        }
    }

    fn on_resource_unavailable(&mut self, assigned: DriverAssignedId) {
        let ids: Vec<RegistrationId> = self.registry.all_by_assigned(assigned).collect();
        if ids.is_empty() {
            debug!(driver_assigned_id = %assigned, "unavailable for unknown resource ignored");
            return;
        }
        for registration_id in ids {
            if let Some(mut entry) = self.registry.remove(registration_id) {
                entry.force_closed();
                info!(registration_id = %registration_id, kind = %entry.kind, "resource unavailable");
                self.listener
                    .on_unavailable(entry.kind, registration_id, assigned);
            }
        }
    }

    fn on_driver_timeout(&mut self, age_ms: i64) {
        let error = ClientError::DriverTimeout { age_ms };
        warn!(
            client = %self.client_id,
            age_ms,
            registrations = self.registry.len(),
            "driver timeout, closing all resources"
        );

        self.listener.on_error(&error);
        for mut entry in self.registry.drain() {
            if entry.state == LifecycleState::Initialized {
                let _ = entry.complete(Err(error.clone()));
            } else {
                entry.force_closed();
            }
        }
        self.backlog.clear();
    }

    fn send_keepalive(&mut self, now_ms: i64) -> usize {
        if !self.liveness.is_active()
            || now_ms.saturating_sub(self.last_keepalive_ms) < self.keepalive_interval_ms
            || !self.backlog.is_empty()
        {
            return 0;
        }
        let keepalive = DriverCommand::ClientKeepalive {
            client_id: self.client_id,
        };
        if self.proxy.send(keepalive).is_ok() {
            self.last_keepalive_ms = now_ms;
            1
        } else {
            0
        }
    }

    /// Tears the conductor down.
    ///
    /// Stops accepting commands, tells the driver the client is gone, fails
    /// every pending create with [`ClientError::Closed`] and forces every
    /// live handle to `Closed`. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.commands.close();

        while let Some(command) = self.commands.poll() {
            if let Some(completion) = command.completion.and_then(|c| c.upgrade()) {
                completion.post(Err(ClientError::Closed));
            }
        }

        if self.liveness.is_active() {
            self.flush_backlog();
            let close = DriverCommand::ClientClose {
                client_id: self.client_id,
            };
            if self.proxy.send(close).is_err() {
                warn!(client = %self.client_id, "driver ring full, client close not delivered");
            }
        }
        self.backlog.clear();

        info!(
            client = %self.client_id,
            registrations = self.registry.len(),
            "client conductor closing"
        );
        for mut entry in self.registry.drain() {
            if entry.state == LifecycleState::Initialized {
                let _ = entry.complete(Err(ClientError::Closed));
            } else {
                entry.force_closed();
            }
        }
        self.listener.on_close();
    }
}
