//! Client conductor for driver-owned transport resources.
//!
//! Counters, publications and subscriptions live inside a separate driver
//! process. This crate gives application threads handles to them that look
//! synchronous while every create and close is an asynchronous round-trip
//! through a single background conductor.
//!
//! ```text
//!  app threads ──submit──> [command MPSC] ──> conductor ──> [driver command ring] ──> driver
//!                                              │   ▲
//!                          pending / listener <┘   └── [driver response ring] <── driver
//!                                                      heartbeat (epoch ms) <──── driver
//! ```
//!
//! - [`client::Client`]: explicit client context, owns the conductor.
//! - [`handle`]: [`Counter`], [`Publication`], [`Subscription`] and their
//!   `Active → CloseRequested → Closed` state machine.
//! - [`conductor::ClientConductor`]: the only mutator of the [`registry`].
//! - [`liveness`]: driver heartbeat timeout handling.
//! - [`driver`]: the driver boundary plus an in-process loopback driver.

pub mod client;
pub mod clock;
pub mod command;
pub mod conductor;
pub mod config;
pub mod driver;
pub mod error;
pub mod handle;
pub mod liveness;
pub mod region;
pub mod registry;
pub mod sync;
pub mod types;

mod trace;

pub use client::{Client, Pending, PendingCounter, PendingPublication, PendingSubscription};
pub use conductor::ResourceListener;
pub use config::ClientConfig;
pub use error::ClientError;
pub use handle::{Counter, Publication, Subscription};
pub use trace::init_tracing;
