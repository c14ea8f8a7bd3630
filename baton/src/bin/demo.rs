//! Baton demo.
//!
//! Starts an in-process loopback driver, connects a client to it and walks a
//! few counters and a publication through their whole lifecycle.
//!
//! # Usage
//!
//! ```sh
//! baton-demo --counters 3 --increments 1000
//! ```

use std::sync::Arc;
use std::time::Duration;

use baton::clock::{EpochClock, SystemEpochClock};
use baton::conductor::ResourceListener;
use baton::driver::loopback::{LoopbackConfig, LoopbackDriver};
use baton::types::{DriverAssignedId, RegistrationId, ResourceKind};
use baton::{Client, ClientConfig, ClientError, Counter};

const DEFAULT_COUNTERS: usize = 2;
const DEFAULT_INCREMENTS: u64 = 100;
const WAIT: Duration = Duration::from_secs(2);

struct Args {
    counters: usize,
    increments: u64,
}

struct PrintingListener;

impl ResourceListener for PrintingListener {
    fn on_available(&mut self, kind: ResourceKind, id: RegistrationId, assigned: DriverAssignedId) {
        eprintln!("baton-demo: {kind} {id} available as {assigned}");
    }

    fn on_error(&mut self, error: &ClientError) {
        eprintln!("baton-demo: async error: {error}");
    }

    fn on_close(&mut self) {
        eprintln!("baton-demo: client closed");
    }
}

fn main() {
    baton::init_tracing();
    if let Err(e) = run() {
        eprintln!("baton-demo: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), ClientError> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    let clock: Arc<dyn EpochClock> = Arc::new(SystemEpochClock);
    let (driver, connection) = LoopbackDriver::new(LoopbackConfig::default());
    let driver = driver.spawn(Arc::clone(&clock));

    let config = ClientConfig::from_env().map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
    let mut client = Client::connect_with(config, connection, clock, Box::new(PrintingListener))?;
    eprintln!("baton-demo: connected as {}", client.client_id());

    let mut counters: Vec<Counter> = Vec::with_capacity(args.counters);
    for n in 0..args.counters {
        let mut pending = client.add_counter(1, &n.to_le_bytes(), &format!("demo-{n}"))?;
        counters.push(client.wait_for(&mut pending, WAIT)?);
    }

    for counter in &counters {
        for _ in 0..args.increments {
            counter.increment();
        }
        eprintln!(
            "baton-demo: {} = {}",
            counter.label(),
            counter.get().unwrap_or_default()
        );
    }

    let mut pending = client.add_publication("baton:ipc", 1001)?;
    let publication = client.wait_for(&mut pending, WAIT)?;
    eprintln!(
        "baton-demo: publication on {} stream {} limit id {}",
        publication.channel(),
        publication.stream_id(),
        publication.position_limit_id()
    );

    publication.close()?;
    for counter in &counters {
        counter.close()?;
    }
    while !publication.is_closed() || counters.iter().any(|c| !c.is_closed()) {
        // Drives the conductor in invoker mode; a no-op error otherwise.
        let _ = client.invoke();
        std::thread::sleep(Duration::from_millis(1));
    }
    publication.delete()?;
    for counter in counters {
        counter.delete()?;
    }

    client.close();
    if let Some(driver) = driver.shutdown() {
        eprintln!("baton-demo: driver holds {} resources", driver.resource_count());
    }
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Args, ClientError> {
    let mut parsed = Args {
        counters: DEFAULT_COUNTERS,
        increments: DEFAULT_INCREMENTS,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--counters" | "-c" => {
                i += 1;
                parsed.counters = value(args, i, "--counters")?;
            }
            "--increments" | "-n" => {
                i += 1;
                parsed.increments = value(args, i, "--increments")?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => {
                return Err(ClientError::InvalidArgument(format!("unknown argument: {arg}")));
            }
        }
        i += 1;
    }
    Ok(parsed)
}

fn value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, ClientError> {
    args.get(i)
        .ok_or_else(|| ClientError::InvalidArgument(format!("missing value for {flag}")))?
        .parse()
        .map_err(|_| ClientError::InvalidArgument(format!("invalid value for {flag}")))
}

fn print_usage() {
    eprintln!(
        r#"baton-demo - client conductor walkthrough against a loopback driver

USAGE:
    baton-demo [OPTIONS]

OPTIONS:
    -c, --counters <N>      Counters to create (default: 2)
    -n, --increments <N>    Increments per counter (default: 100)
    -h, --help              Print this help message

ENVIRONMENT:
    BATON_DRIVER_TIMEOUT_MS, BATON_KEEPALIVE_INTERVAL_MS,
    BATON_COMMAND_QUEUE_CAPACITY, BATON_USE_CONDUCTOR_INVOKER
"#
    );
}
