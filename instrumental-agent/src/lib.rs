//! A client-side agent for reporting gauges, counters and notices to an [Instrumental][instrumental] collector.
//!
//! [instrumental]: https://instrumentalapp.com/
//!
//! # Usage
//!
//! ```no_run
//! # use instrumental_agent::AgentBuilder;
//! // Create an agent for your project's API key. The background delivery worker is spawned immediately, and starts
//! // connecting to the collector right away.
//! let agent = AgentBuilder::new("your-project-api-key").build().expect("failed to build agent");
//!
//! agent.gauge("app.memory.resident_mb", 512.0);
//! agent.increment("app.signups");
//! agent.notice("Deployed release 1.4.2");
//!
//! let rows = agent.time_ms("app.db.query_ms", || 42);
//! # let _ = rows;
//!
//! // Dropping the agent (or calling `shutdown`) flushes what is still queued, within the shutdown timeout.
//! agent.shutdown();
//! ```
//!
//! The agent can also serve as the backend for the [`metrics`] facade, via [`AgentBuilder::install`] or
//! [`InstrumentalRecorder`].
//!
//! # Delivery
//!
//! Reporting never blocks on the network. Each call validates its input, formats a single protocol line and pushes it
//! onto a bounded queue, which is drained by one background thread that owns the connection to the collector.
//!
//! ## Backpressure
//!
//! The queue holds 5,000 messages by default. When it is full, new messages are dropped, and a warning is logged once
//! each time the queue fills up. This holds even in synchronous mode: a caller is only ever made to wait for a message
//! that was actually queued.
//!
//! ## Reconnection
//!
//! When connecting, authenticating or writing fails, the connection is torn down and retried with a quadratic backoff
//! (0s, 1s, 4s, 9s, ... up to 15 seconds by default). A message whose write failed is retried first on the new
//! connection, ahead of anything queued after it, so that order is preserved and nothing is dropped by a transient
//! disconnect. Before each write, the connection is probed so that a collector that has hung up is noticed before a
//! message is lost to a half-closed socket.
//!
//! ## Synchronous mode
//!
//! With [`Agent::set_synchronous`], reporting calls block until their line has been written to the collector
//! connection. This only means the line was handed to the socket: the protocol never acknowledges anything, including
//! authentication.
//!
//! # Telemetry
//!
//! The agent counts messages queued, dropped and sent, as well as connection attempts and rejected input. See
//! [`Agent::telemetry`].
//!
//! # Missing
//!
//! Messages are not persisted: anything still queued when the process exits, or when the shutdown timeout elapses, is
//! lost. There is no support for TLS or compression.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod agent;
pub use self::agent::Agent;

mod backoff;
pub use self::backoff::DEFAULT_MAX_RECONNECT_DELAY;

mod builder;
pub use self::builder::{AgentBuilder, BuildError};

pub mod connection;

mod message;
pub use self::message::{Message, Receipt, ReceiptError};

pub mod protocol;

pub mod queue;

mod recorder;
pub use self::recorder::InstrumentalRecorder;

mod telemetry;
pub use self::telemetry::TelemetrySnapshot;

mod worker;
pub use self::worker::DEFAULT_SHUTDOWN_TIMEOUT;
