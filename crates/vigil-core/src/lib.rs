//! # Vigil Core
//!
//! Core domain types for the vigil audit pipeline.
//!
//! The only type that travels through the whole system is [`AuditEvent`]:
//! accepted by the ingestion gateway, appended to the durable log, and
//! persisted by the consumption worker into month-partitioned storage.

pub mod event;

pub use event::*;
