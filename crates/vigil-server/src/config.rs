//! Process configuration
//!
//! Everything the daemon needs is supplied at startup via flags or
//! environment variables. The data directory has no default: starting
//! without one is a fatal configuration error.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use vigil_log::LogConfig;
use vigil_store::StoreConfig;

#[derive(Debug, Parser)]
#[command(name = "vigild", about = "Audit-event durability pipeline daemon")]
pub struct Config {
    /// Directory holding the log and store databases (required)
    #[arg(long, env = "VIGIL_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Port the ingestion gateway listens on
    #[arg(long, env = "VIGIL_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Log topic name
    #[arg(long, env = "VIGIL_TOPIC", default_value = "audit-events")]
    pub topic: String,

    /// Consumer group identity the worker commits under
    #[arg(long, env = "VIGIL_GROUP_ID", default_value = "audit-writers")]
    pub group_id: String,

    /// Number of log partitions (fixed once the log exists)
    #[arg(long, env = "VIGIL_PARTITIONS", default_value_t = 8)]
    pub partitions: u32,

    /// Base table name month partitions derive from
    #[arg(long, env = "VIGIL_BASE_TABLE", default_value = "audit_logs")]
    pub base_table: String,

    /// Bounded wait for a publish acknowledgment, in seconds
    #[arg(long, env = "VIGIL_PUBLISH_TIMEOUT_SECS", default_value_t = 5)]
    pub publish_timeout_secs: u64,

    /// Maximum records per worker fetch
    #[arg(long, env = "VIGIL_FETCH_BATCH", default_value_t = 64)]
    pub fetch_batch: usize,

    /// Ingestion requests allowed per source IP per window
    #[arg(long, env = "VIGIL_RATE_LIMIT", default_value_t = 100)]
    pub rate_limit: u32,

    /// Rate-limit window length, in seconds
    #[arg(long, env = "VIGIL_RATE_WINDOW_SECS", default_value_t = 60)]
    pub rate_window_secs: u64,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, env = "VIGIL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Durable-log configuration derived from this process config
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            db_path: self.data_dir.join("log.redb"),
            topic: self.topic.clone(),
            partitions: self.partitions,
        }
    }

    /// Event-store configuration derived from this process config
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            db_path: self.data_dir.join("store.redb"),
            base_table: self.base_table.clone(),
        }
    }

    /// Bounded wait for a publish acknowledgment
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    /// Rate-limit window length
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }
}
