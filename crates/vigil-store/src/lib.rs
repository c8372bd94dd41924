//! # Vigil Store
//!
//! Month-partitioned persistence for audit events.
//!
//! A partition covers exactly one calendar month, named
//! `<base_table>_<year>_<month>` over the half-open range
//! `[first-of-month, first-of-next-month)`. Partitions must exist before
//! data targeting them arrives: [`EventStore::ensure_partition`] is the
//! idempotent create-if-absent operation the consumption worker runs ahead
//! of the write path, and [`EventStore::save`] fails hard when the month's
//! partition is missing.
//!
//! Writes are idempotent-safe: a redelivered event carries the same
//! identity and admission time, collapses onto the same row key, and is
//! absorbed as a benign duplicate. There is no update or delete path.

pub mod error;
pub mod partition;
pub mod store;

pub use error::StoreError;
pub use partition::{month_partition, PartitionSpec};
pub use store::{ChangeMatch, EventStore, StoreConfig, MAX_FIND_RESULTS};
