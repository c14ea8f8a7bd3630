//! End-to-end lifecycle tests: application threads, conductor and a loopback
//! driver.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=baton=trace cargo test --features tracing --test conductor_lifecycle -- --nocapture
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;

use baton::clock::{EpochClock, ManualClock, SystemEpochClock};
use baton::command::{self, Opcode};
use baton::conductor::NoopListener;
use baton::driver::loopback::{LoopbackConfig, LoopbackDriver};
use baton::handle::{self, LifecycleState};
use baton::region::{CountersRegion, SharedRef};
use baton::types::{DriverAssignedId, RegistrationId, ResourceKind};
use baton::{Client, ClientConfig, ClientError, Counter, ResourceListener};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(baton::init_tracing);
}

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct Counts {
    available: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ResourceListener for Counts {
    fn on_available(&mut self, _: ResourceKind, _: RegistrationId, _: DriverAssignedId) {
        self.available.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&mut self, _: &ClientError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn threaded_client(listener: Counts) -> (Client, baton::driver::loopback::LoopbackHandle) {
    init_test_tracing();
    let clock: Arc<dyn EpochClock> = Arc::new(SystemEpochClock);
    let (driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
    let driver = driver.spawn(Arc::clone(&clock));
    let client =
        Client::connect_with(ClientConfig::default(), connection, clock, Box::new(listener))
            .expect("connect");
    (client, driver)
}

#[test]
fn created_counter_reports_its_ids() {
    let (tx, rx) = command::channel(8);
    let region = CountersRegion::new(8);
    let id = DriverAssignedId::new(7);

    let counter = Counter::create(tx, RegistrationId::new(42), id, SharedRef::new(&region, id))
        .expect("create");

    assert_eq!(counter.counter_id(), DriverAssignedId::new(7));
    assert!(!counter.is_closed());
    assert!(counter.address().is_mapped());
    assert!(rx.is_empty());
}

#[test]
fn close_twice_submits_one_remove() {
    let (tx, rx) = command::channel(8);
    let counter = Counter::create(
        tx,
        RegistrationId::new(42),
        DriverAssignedId::new(7),
        SharedRef::unmapped(),
    )
    .expect("create");

    assert_eq!(counter.close(), Ok(()));
    assert_eq!(counter.close(), Ok(()));

    let first = rx.poll().expect("one remove");
    assert_eq!(first.opcode(), Opcode::RemoveCounter);
    assert_eq!(first.registration_id, RegistrationId::new(42));
    assert!(rx.poll().is_none());
}

#[test]
fn close_of_no_handle_submits_nothing() {
    let (_tx, rx) = command::channel(8);
    assert_eq!(handle::close::<Counter>(None), Ok(()));
    assert!(rx.is_empty());
}

#[test]
fn concurrent_close_from_many_threads_submits_one_remove() {
    let (tx, rx) = command::channel(64);
    let counter = Arc::new(
        Counter::create(
            tx,
            RegistrationId::new(5),
            DriverAssignedId::new(0),
            SharedRef::unmapped(),
        )
        .expect("create"),
    );
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));

    let joins: Vec<_> = (0..threads)
        .map(|_| {
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                handle::close(Some(&*counter))
            })
        })
        .collect();
    for j in joins {
        assert_eq!(j.join().expect("join"), Ok(()));
    }

    assert_eq!(std::iter::from_fn(|| rx.poll()).count(), 1);
}

#[test]
fn counter_create_close_delete_with_conductor_thread() {
    let counts = Counts::default();
    let (mut client, driver) = threaded_client(counts.clone());

    let mut pending = client.add_counter(9, b"key", "lifecycle").expect("submit");
    let counter = pending.wait(WAIT).expect("counter");
    assert_eq!(counter.state(), LifecycleState::Active);
    assert_eq!(counter.registration_id(), pending.registration_id());
    assert_eq!(counter.label(), "lifecycle");
    assert_eq!(counter.increment(), Some(0));
    assert_eq!(counter.get(), Some(1));

    counter.close().expect("close");
    let deadline = std::time::Instant::now() + WAIT;
    while !counter.is_closed() {
        assert!(std::time::Instant::now() < deadline, "close never acknowledged");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(counter.delete(), Ok(()));

    client.close();
    client.close();
    let driver = driver.shutdown().expect("driver thread");
    assert_eq!(driver.resource_count(), 0);
    assert_eq!(counts.available.load(Ordering::SeqCst), 1);
    assert_eq!(counts.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn publication_and_subscription_round_trip() {
    let counts = Counts::default();
    let (client, _driver) = threaded_client(counts.clone());

    let publication = client
        .add_publication("baton:udp?endpoint=localhost:40123", 10)
        .expect("submit")
        .wait(WAIT)
        .expect("publication");
    let subscription = client
        .add_subscription("baton:ipc", 11)
        .expect("submit")
        .wait(WAIT)
        .expect("subscription");

    assert_eq!(publication.stream_id(), 10);
    assert_eq!(publication.channel(), "baton:udp?endpoint=localhost:40123");
    assert_eq!(publication.position_limit(), Some(0));
    assert_eq!(subscription.stream_id(), 11);
    assert_ne!(publication.position_limit_id(), subscription.channel_status_id());

    let err = client
        .add_subscription("baton:udp?endpoint=nowhere", 12)
        .expect("submit")
        .wait(WAIT)
        .expect_err("invalid channel");
    assert!(matches!(err, ClientError::Driver { .. }));
    assert_eq!(counts.errors.load(Ordering::SeqCst), 1);
}

#[test]
fn registration_ids_are_unique_across_threads() {
    let (client, _driver) = threaded_client(Counts::default());
    let client = Arc::new(client);

    let joins: Vec<_> = (0..4)
        .map(|t| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                (0..8)
                    .map(|n| {
                        let mut pending = loop {
                            match client.add_counter(t, b"", &format!("t{t}-{n}")) {
                                Err(ClientError::QueueFull) => thread::yield_now(),
                                other => break other.expect("submit"),
                            }
                        };
                        let counter = pending.wait(WAIT).expect("counter");
                        (counter.registration_id(), counter.counter_id())
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut registrations = HashSet::new();
    let mut slots = HashSet::new();
    for j in joins {
        for (registration_id, counter_id) in j.join().expect("join") {
            assert!(registrations.insert(registration_id));
            assert!(slots.insert(counter_id));
        }
    }
    assert_eq!(registrations.len(), 32);
}

#[test]
fn dropped_pending_does_not_leak_driver_resource() {
    let clock = ManualClock::new(1_000);
    let (mut driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
    driver.publish_heartbeat(clock.time_ms());
    let client = Client::connect_with(
        ClientConfig::default().with_conductor_invoker(true),
        connection,
        Arc::new(clock.clone()),
        Box::new(NoopListener),
    )
    .expect("connect");

    let pending = client.add_counter(1, b"", "abandoned").expect("submit");
    client.invoke().expect("invoke");
    drop(pending);

    driver.do_work(clock.time_ms());
    assert_eq!(driver.resource_count(), 1);
    client.invoke().expect("invoke");
    driver.do_work(clock.time_ms());
    client.invoke().expect("invoke");

    assert_eq!(driver.resource_count(), 0);
}

#[test]
fn client_close_fails_outstanding_creates() {
    let clock = ManualClock::new(1_000);
    let (driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
    driver.publish_heartbeat(clock.time_ms());
    let mut client = Client::connect_with(
        ClientConfig::default().with_conductor_invoker(true),
        connection,
        Arc::new(clock),
        Box::new(NoopListener),
    )
    .expect("connect");

    let mut pending = client.add_counter(1, b"", "never acked").expect("submit");
    client.invoke().expect("invoke");
    client.close();

    assert!(matches!(pending.poll(), Err(ClientError::Closed)));
    assert!(matches!(
        client.add_counter(1, b"", "late"),
        Err(ClientError::Closed)
    ));
}
