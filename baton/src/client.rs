//! Client context: the public entry point.
//!
//! A [`Client`] is created explicitly with [`Client::connect`] and torn down
//! explicitly with [`Client::close`] (or on drop). It owns the conductor,
//! either on a dedicated thread or, in invoker mode, driven by the
//! application through [`Client::invoke`].
//!
//! ```ignore
//! let (driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
//! let _driver = driver.spawn(Arc::new(SystemEpochClock));
//!
//! let client = Client::connect(ClientConfig::default(), connection)?;
//! let mut pending = client.add_counter(1, b"", "requests")?;
//! let counter = client.wait_for(&mut pending, Duration::from_secs(1))?;
//! counter.increment();
//! counter.close()?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use minstant::Instant;

use crate::clock::{EpochClock, SystemEpochClock};
use crate::command::{self, Command, CommandBody, CommandChannel, MAX_KEY_LENGTH, MAX_LABEL_LENGTH};
use crate::conductor::{ClientConductor, NoopListener, ResourceListener};
use crate::config::ClientConfig;
use crate::driver::DriverConnection;
use crate::error::ClientError;
use crate::handle::{self, Counter, Publication, ResourceHandle, Subscription};
use crate::registry::{self, Completion};
use crate::sync::Timeout;
use crate::trace::{debug, error, info};
use crate::types::{ClientId, RegistrationId, RegistrationIds};

/// Outcome of an asynchronous create, polled by the application.
///
/// Dropping a pending handle abandons the create. The conductor then removes
/// the resource on the driver once it has been acknowledged.
pub struct Pending<H> {
    registration_id: RegistrationId,
    completion: Arc<Completion>,
    stream_id: i32,
    build: fn(ResourceHandle, i32) -> H,
}

pub type PendingCounter = Pending<Counter>;
pub type PendingPublication = Pending<Publication>;
pub type PendingSubscription = Pending<Subscription>;

impl<H> Pending<H> {
    #[must_use]
    pub const fn registration_id(&self) -> RegistrationId {
        self.registration_id
    }

    /// Checks for the outcome without blocking.
    ///
    /// Returns `Ok(None)` while the driver has not answered, and again after
    /// the outcome has been taken.
    ///
    /// # Errors
    ///
    /// The asynchronous failure for this registration: driver rejection,
    /// driver timeout, protocol error or client close.
    pub fn poll(&mut self) -> Result<Option<H>, ClientError> {
        match self.completion.take() {
            None => Ok(None),
            Some(Ok(handle)) => Ok(Some((self.build)(handle, self.stream_id))),
            Some(Err(err)) => Err(err),
        }
    }

    /// Spins until the outcome arrives.
    ///
    /// Needs a conductor thread; in invoker mode use [`Client::wait_for`].
    ///
    /// # Errors
    ///
    /// As [`poll`](Self::poll), plus [`ClientError::Timeout`].
    pub fn wait(&mut self, timeout: impl Into<Timeout>) -> Result<H, ClientError> {
        wait_with(self, timeout.into(), || {})
    }
}

fn wait_with<H>(
    pending: &mut Pending<H>,
    timeout: Timeout,
    mut between: impl FnMut(),
) -> Result<H, ClientError> {
    let deadline = match timeout {
        Timeout::Infinite => None,
        Timeout::Duration(d) => Some(Instant::now() + d),
    };
    loop {
        if let Some(handle) = pending.poll()? {
            return Ok(handle);
        }
        if let Some(dl) = deadline
            && Instant::now() > dl
        {
            return Err(ClientError::Timeout(pending.registration_id));
        }
        between();
        thread::yield_now();
    }
}

impl<H> std::fmt::Debug for Pending<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("registration_id", &self.registration_id)
            .finish_non_exhaustive()
    }
}

enum Runner {
    Thread {
        shutdown: Arc<AtomicBool>,
        join: Option<JoinHandle<()>>,
    },
    Invoker,
}

/// Client context.
///
/// All methods take `&self` and can be called from any number of threads.
pub struct Client {
    client_id: ClientId,
    commands: CommandChannel,
    ids: RegistrationIds,
    conductor: Arc<Mutex<ClientConductor>>,
    clock: Arc<dyn EpochClock>,
    runner: Runner,
}

impl Client {
    /// Connects with the wall clock and no listener.
    ///
    /// # Errors
    ///
    /// See [`connect_with`](Self::connect_with).
    pub fn connect(config: ClientConfig, connection: DriverConnection) -> Result<Self, ClientError> {
        Self::connect_with(
            config,
            connection,
            Arc::new(SystemEpochClock),
            Box::new(NoopListener),
        )
    }

    /// Validates the config, checks the driver is alive and starts the
    /// conductor.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidArgument`] for a bad config.
    /// - [`ClientError::DriverTimeout`] if the driver heartbeat is stale.
    /// - [`ClientError::Allocation`] if the conductor thread cannot start.
    pub fn connect_with(
        config: ClientConfig,
        connection: DriverConnection,
        clock: Arc<dyn EpochClock>,
        listener: Box<dyn ResourceListener>,
    ) -> Result<Self, ClientError> {
        config
            .validate()
            .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;

        let now_ms = clock.time_ms();
        let heartbeat_ms = connection.heartbeat.last_ms();
        let age_ms = now_ms.saturating_sub(heartbeat_ms);
        if heartbeat_ms == 0 || age_ms > config.driver_timeout_ms() {
            error!(age_ms, "no active driver");
            return Err(ClientError::DriverTimeout { age_ms });
        }

        let client_id = ClientId::generate();
        let (commands, receiver) = command::channel(config.command_queue_capacity);
        let conductor = Arc::new(Mutex::new(ClientConductor::new(
            &config,
            client_id,
            receiver,
            commands.clone(),
            connection,
            listener,
            now_ms,
        )));

        let runner = if config.use_conductor_invoker {
            info!(client = %client_id, "client connected, conductor invoker mode");
            Runner::Invoker
        } else {
            let shutdown = Arc::new(AtomicBool::new(false));
            let join = spawn_conductor(
                &config,
                Arc::clone(&conductor),
                Arc::clone(&clock),
                Arc::clone(&shutdown),
            )?;
            info!(client = %client_id, "client connected");
            Runner::Thread {
                shutdown,
                join: Some(join),
            }
        };

        Ok(Self {
            client_id,
            commands,
            ids: RegistrationIds::default(),
            conductor,
            clock,
            runner,
        })
    }

    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    #[must_use]
    pub fn is_driver_active(&self) -> bool {
        self.lock_conductor().is_driver_active()
    }

    /// Requests a counter. Returns immediately.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidArgument`] for an oversized key or label.
    /// - [`ClientError::QueueFull`] when the command channel is full.
    /// - [`ClientError::Closed`] after [`close`](Self::close).
    pub fn add_counter(
        &self,
        type_id: i32,
        key: &[u8],
        label: &str,
    ) -> Result<PendingCounter, ClientError> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(ClientError::InvalidArgument(format!(
                "key length {} exceeds {MAX_KEY_LENGTH}",
                key.len()
            )));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(ClientError::InvalidArgument(format!(
                "label length {} exceeds {MAX_LABEL_LENGTH}",
                label.len()
            )));
        }

        let mut owned_key = Vec::new();
        owned_key
            .try_reserve_exact(key.len())
            .map_err(|_| ClientError::allocation(rustix::io::Errno::NOMEM, "counter key"))?;
        owned_key.extend_from_slice(key);

        self.submit_create(
            CommandBody::AddCounter {
                type_id,
                key: owned_key,
                label: label.to_owned(),
            },
            0,
            |h, _| Counter::from(h),
        )
    }

    /// Requests a publication on `channel`.
    ///
    /// # Errors
    ///
    /// As [`add_counter`](Self::add_counter); an empty channel is an invalid
    /// argument.
    pub fn add_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<PendingPublication, ClientError> {
        self.add_publication_inner(channel, stream_id, false)
    }

    /// Requests a publication nobody else on the driver shares.
    ///
    /// # Errors
    ///
    /// As [`add_publication`](Self::add_publication).
    pub fn add_exclusive_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<PendingPublication, ClientError> {
        self.add_publication_inner(channel, stream_id, true)
    }

    fn add_publication_inner(
        &self,
        channel: &str,
        stream_id: i32,
        exclusive: bool,
    ) -> Result<PendingPublication, ClientError> {
        check_channel(channel)?;
        self.submit_create(
            CommandBody::AddPublication {
                channel: channel.to_owned(),
                stream_id,
                exclusive,
            },
            stream_id,
            handle::publication_from,
        )
    }

    /// Requests a subscription to `channel`.
    ///
    /// # Errors
    ///
    /// As [`add_publication`](Self::add_publication).
    pub fn add_subscription(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<PendingSubscription, ClientError> {
        check_channel(channel)?;
        self.submit_create(
            CommandBody::AddSubscription {
                channel: channel.to_owned(),
                stream_id,
            },
            stream_id,
            handle::subscription_from,
        )
    }

    fn submit_create<H>(
        &self,
        body: CommandBody,
        stream_id: i32,
        build: fn(ResourceHandle, i32) -> H,
    ) -> Result<Pending<H>, ClientError> {
        if self.commands.is_closed() {
            return Err(ClientError::Closed);
        }

        let registration_id = self.ids.next();
        let completion = registry::completion();
        let command = Command::new(registration_id, body).with_completion(&completion);
        debug!(registration_id = %registration_id, opcode = %command.opcode(), "submitting create");
        self.commands.submit(command)?;

        Ok(Pending {
            registration_id,
            completion,
            stream_id,
            build,
        })
    }

    /// Runs one conductor iteration on the calling thread.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotInvoker`] when a conductor thread is running.
    pub fn invoke(&self) -> Result<usize, ClientError> {
        match self.runner {
            Runner::Invoker => Ok(self.lock_conductor().do_work(self.clock.time_ms())),
            Runner::Thread { .. } => Err(ClientError::NotInvoker),
        }
    }

    /// Waits for `pending`, driving the conductor while waiting in invoker
    /// mode.
    ///
    /// # Errors
    ///
    /// As [`Pending::wait`].
    pub fn wait_for<H>(
        &self,
        pending: &mut Pending<H>,
        timeout: impl Into<Timeout>,
    ) -> Result<H, ClientError> {
        wait_with(pending, timeout.into(), || {
            if matches!(self.runner, Runner::Invoker) {
                let _ = self.invoke();
            }
        })
    }

    /// Closes the client context.
    ///
    /// Tells the driver the client is gone, fails every pending create with
    /// [`ClientError::Closed`], forces every live handle to `Closed` and
    /// stops the conductor thread. Idempotent.
    pub fn close(&mut self) {
        match &mut self.runner {
            Runner::Thread { shutdown, join } => {
                shutdown.store(true, Ordering::Release);
                if let Some(join) = join.take() {
                    debug!(client = %self.client_id, "waiting for conductor thread to exit");
                    let _ = join.join();
                }
            }
            Runner::Invoker => {}
        }
        self.lock_conductor().close();
    }

    fn lock_conductor(&self) -> MutexGuard<'_, ClientConductor> {
        self.conductor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_channel(channel: &str) -> Result<(), ClientError> {
    if channel.is_empty() {
        return Err(ClientError::InvalidArgument("channel must not be empty".to_owned()));
    }
    Ok(())
}

fn spawn_conductor(
    config: &ClientConfig,
    conductor: Arc<Mutex<ClientConductor>>,
    clock: Arc<dyn EpochClock>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, ClientError> {
    let idle_sleep = config.idle_sleep;
    thread::Builder::new()
        .name(config.conductor_thread_name.clone())
        .spawn(move || {
            info!("conductor thread started");
            while !shutdown.load(Ordering::Acquire) {
                let work = conductor
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .do_work(clock.time_ms());
                if work == 0 {
                    thread::sleep(idle_sleep);
                }
            }
            conductor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .close();
            info!("conductor thread exiting");
        })
        .map_err(|e| {
            let errno = rustix::io::Errno::from_io_error(&e).unwrap_or(rustix::io::Errno::AGAIN);
            ClientError::allocation(errno, "conductor thread")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::driver::loopback::{LoopbackConfig, LoopbackDriver};
    use crate::handle::LifecycleState;
    use std::time::Duration;

    fn invoker_client() -> (Client, LoopbackDriver, ManualClock) {
        let clock = ManualClock::new(1_000);
        let (driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
        driver.publish_heartbeat(clock.time_ms());
        let client = Client::connect_with(
            ClientConfig::default().with_conductor_invoker(true),
            connection,
            Arc::new(clock.clone()),
            Box::new(NoopListener),
        )
        .unwrap();
        (client, driver, clock)
    }

    #[test]
    fn test_connect_without_heartbeat_fails() {
        let (_driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
        let err = Client::connect(ClientConfig::default(), connection)
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::DriverTimeout { .. }));
    }

    #[test]
    fn test_connect_rejects_invalid_config() {
        let (driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
        driver.publish_heartbeat(SystemEpochClock.time_ms());
        let err = Client::connect(ClientConfig::default().with_command_queue_capacity(0), connection)
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn test_oversized_label_and_key_rejected_locally() {
        let (client, _driver, _clock) = invoker_client();
        let label = "x".repeat(MAX_LABEL_LENGTH + 1);
        assert!(matches!(
            client.add_counter(1, b"", &label),
            Err(ClientError::InvalidArgument(_))
        ));
        let key = vec![0u8; MAX_KEY_LENGTH + 1];
        assert!(matches!(
            client.add_counter(1, &key, "ok"),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.add_subscription("", 1),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invoker_mode_round_trip() {
        let (client, mut driver, clock) = invoker_client();
        let mut pending = client.add_counter(3, b"k", "hits").unwrap();
        assert!(matches!(pending.poll(), Ok(None)));

        client.invoke().unwrap();
        driver.do_work(clock.time_ms());
        client.invoke().unwrap();

        let counter = pending.poll().unwrap().unwrap();
        assert_eq!(counter.registration_id(), pending.registration_id());
        assert_eq!(counter.increment(), Some(0));
        assert!(pending.poll().unwrap().is_none(), "outcome is taken once");

        counter.close().unwrap();
        client.invoke().unwrap();
        driver.do_work(clock.time_ms());
        client.invoke().unwrap();
        assert_eq!(counter.state(), LifecycleState::Closed);
        assert_eq!(driver.resource_count(), 0);
    }

    #[test]
    fn test_invoke_requires_invoker_mode() {
        let (driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
        let clock: Arc<dyn EpochClock> = Arc::new(SystemEpochClock);
        let _running = driver.spawn(Arc::clone(&clock));
        let mut client = Client::connect_with(
            ClientConfig::default(),
            connection,
            clock,
            Box::new(NoopListener),
        )
        .unwrap();

        assert_eq!(client.invoke(), Err(ClientError::NotInvoker));
        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.add_counter(1, b"", "late"),
            Err(ClientError::Closed)
        ));
    }

    #[test]
    fn test_wait_for_times_out_without_driver_progress() {
        let (client, _driver, _clock) = invoker_client();
        let mut pending = client.add_counter(1, b"", "never").unwrap();
        let err = client
            .wait_for(&mut pending, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, ClientError::Timeout(pending.registration_id()));
    }
}
