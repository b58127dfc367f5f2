//! Deduplicating event ingestion consumer.
//!
//! Events arrive as JSON envelopes on a Kafka topic. Each one is reduced to a
//! SHA-256 fingerprint of its canonical encoding, claimed in Redis with an
//! atomic `SET NX EX`, and inserted into Postgres where a unique constraint
//! on the fingerprint catches whatever slips past the cache. Messages are
//! settled only after the row is durable or the event is known to be a
//! duplicate.
//!
//! ## Error logging
//!
//! Log errors with `error = ?e` or `{e:#}` so the cause chain is kept.
//! `error = %e` is fine for leaf errors with no source.

pub mod cache;
pub mod canonical;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod handler;
pub mod health;
pub mod kafka;
pub mod metrics_consts;
pub mod retry;
pub mod server;
pub mod sink;
pub mod test_utils;
pub mod transport;

pub use cache::{Claim, DuplicateCache, RedisDuplicateCache};
pub use consumer::{ConsumerConfig, IngestionConsumer};
pub use event::{EventEnvelope, ProfileFallback};
pub use fingerprint::Fingerprint;
pub use handler::{EventHandler, HandlerConfig, Outcome};
pub use sink::{EventSink, PgEventSink};
pub use transport::{Delivery, Disposition, MessageSource};
