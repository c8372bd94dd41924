//! # Vigil Server
//!
//! The `vigild` daemon: an ingestion gateway and a consumption worker
//! coupled only through the durable log.
//!
//! The gateway admits events over HTTP, stamps their identity and admission
//! time, publishes to the log under a bounded timeout, and answers before
//! any storage write happens. The worker independently pulls from the log,
//! persists into month-partitioned storage, and commits its position only
//! after persistence — storage slowness can grow log lag but never block
//! ingestion, and a crash between persistence and commit costs at most a
//! redelivered duplicate.

pub mod config;
pub mod gateway;
pub mod ratelimit;
pub mod worker;

pub use config::Config;
pub use gateway::{router, AppState};
pub use ratelimit::RateLimiter;
pub use worker::{provision_partitions, Worker};
