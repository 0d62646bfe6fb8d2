//! Reliable event delivery.
//!
//! Events are written to a transactional outbox alongside the domain change
//! that produced them. An [`EventPublisher`] claims due rows, appends them to
//! an external stream and fans them out into webhook deliveries; a
//! [`WebhookDispatcher`] leases pending deliveries and POSTs signed payloads
//! to subscriber endpoints. Both retry with exponential backoff.
//!
//! The [`lock`], [`idempotency`] and [`rate_limit`] modules hold the
//! supporting primitives used by the request path.
//!
//! Every storage seam is a trait with an in-memory backend; PostgreSQL and
//! Redis backends sit behind the `postgres` and `redis` features.

pub mod backoff;
pub mod clock;
pub mod config;
mod error;
pub mod idempotency;
pub mod lock;
pub mod metrics;
#[cfg(feature = "http")]
pub mod middleware;
pub mod outbox;
mod publisher;
pub mod rate_limit;
pub mod stream;
pub mod webhook;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DispatcherConfig, PublisherConfig, RelayConfig};
pub use error::{RelayError, Result, StreamError};
pub use outbox::{EventLog, InMemoryEventLog, NewEvent, OutboxEvent};
pub use publisher::{DrainResult, EventPublisher, PublishOutcome};
pub use webhook::{WebhookDispatcher, WebhookFanout};
pub use worker::{PollingJob, WorkerHandle, WorkerStats};
