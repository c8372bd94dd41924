//! # Vigil Log
//!
//! An embedded durable log: ordered, partitioned, append-only, with
//! publish-with-acknowledgment and fetch-with-manual-commit semantics.
//!
//! Records are keyed; all records sharing a key land in the same partition
//! and are totally ordered there, so a consumer observes one actor's events
//! in publish order. Consumers belong to named groups and advance their
//! position explicitly with [`LogConsumer::commit`] — fetching alone never
//! moves it, which is what makes crash-safe at-least-once delivery possible:
//! anything uncommitted at a crash is redelivered after restart.
//!
//! Publish acknowledges only after the record is durably on disk (the
//! engine's fsynced commit). There is no partial effect: a failed publish
//! appends nothing.

pub mod error;
pub mod log;
pub mod publisher;

pub use error::LogError;
pub use log::{DurableLog, FetchedRecord, LogConfig, LogConsumer};
pub use publisher::EventPublisher;
