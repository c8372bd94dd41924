//! Durable log implementation
//!
//! A partitioned append-only log on redb. One write transaction per append;
//! the engine's fsynced commit is the durability threshold behind a publish
//! acknowledgment. Consumer-group positions live next to the records, so a
//! restart resumes from the last committed offset.

use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, instrument};

use crate::error::LogError;

/// Configuration for a durable log
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Path to the log database file
    pub db_path: PathBuf,
    /// Topic name; namespaces the record tables inside the database
    pub topic: String,
    /// Number of partitions; fixed for the lifetime of the log
    pub partitions: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/log.redb"),
            topic: "audit-events".to_string(),
            partitions: 8,
        }
    }
}

/// A record as stored on the log
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    /// Partitioning key (actor identity bytes)
    key: Vec<u8>,
    /// Opaque record value (JSON-encoded event)
    payload: Vec<u8>,
    /// When the record was appended
    published_at_millis: i64,
}

/// A record handed to a consumer, with the position needed to commit it
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    /// Partition the record lives in
    pub partition: u32,
    /// Offset within the partition
    pub offset: u64,
    /// Partitioning key
    pub key: Vec<u8>,
    /// Opaque record value
    pub payload: Vec<u8>,
    /// When the record was appended
    pub published_at_millis: i64,
}

struct LogInner {
    db: Database,
    partitions: u32,
    records_table: String,
    heads_table: String,
    commits_table: String,
    /// Woken after every durable append so blocked fetches re-check
    data_ready: Notify,
}

impl LogInner {
    fn records(&self) -> TableDefinition<'_, (u32, u64), &'static [u8]> {
        TableDefinition::new(&self.records_table)
    }

    fn heads(&self) -> TableDefinition<'_, u32, u64> {
        TableDefinition::new(&self.heads_table)
    }

    fn commits(&self) -> TableDefinition<'_, (&'static str, u32), u64> {
        TableDefinition::new(&self.commits_table)
    }

    fn init_tables(&self) -> Result<(), LogError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| LogError::Database(e.to_string()))?;

        write_txn
            .open_table(self.records())
            .map_err(|e| LogError::Database(e.to_string()))?;
        write_txn
            .open_table(self.heads())
            .map_err(|e| LogError::Database(e.to_string()))?;
        write_txn
            .open_table(self.commits())
            .map_err(|e| LogError::Database(e.to_string()))?;

        write_txn
            .commit()
            .map_err(|e| LogError::Database(e.to_string()))?;

        debug!("Initialized log tables");
        Ok(())
    }

    /// Append one record; acknowledged only once the commit has fsynced.
    fn append_sync(&self, key: &[u8], payload: &[u8]) -> Result<(u32, u64), LogError> {
        let partition = partition_for(key, self.partitions);
        let record = LogRecord {
            key: key.to_vec(),
            payload: payload.to_vec(),
            published_at_millis: chrono::Utc::now().timestamp_millis(),
        };
        let encoded =
            postcard::to_allocvec(&record).map_err(|e| LogError::Serialization(e.to_string()))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| LogError::Database(e.to_string()))?;

        let offset = {
            let mut heads = write_txn
                .open_table(self.heads())
                .map_err(|e| LogError::Database(e.to_string()))?;
            let offset = heads
                .get(partition)
                .map_err(|e| LogError::Database(e.to_string()))?
                .map(|v| v.value())
                .unwrap_or(0);

            let mut records = write_txn
                .open_table(self.records())
                .map_err(|e| LogError::Database(e.to_string()))?;
            records
                .insert((partition, offset), encoded.as_slice())
                .map_err(|e| LogError::Database(e.to_string()))?;
            heads
                .insert(partition, offset + 1)
                .map_err(|e| LogError::Database(e.to_string()))?;

            offset
        };

        write_txn
            .commit()
            .map_err(|e| LogError::Database(e.to_string()))?;

        Ok((partition, offset))
    }

    /// Read up to `max` records past the group's committed positions.
    ///
    /// Never moves any position; repeated calls without a commit return the
    /// same records.
    fn read_batch_sync(
        &self,
        group: &str,
        assignment: &[u32],
        max: usize,
    ) -> Result<Vec<FetchedRecord>, LogError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| LogError::Database(e.to_string()))?;

        let commits = read_txn
            .open_table(self.commits())
            .map_err(|e| LogError::Database(e.to_string()))?;
        let records = read_txn
            .open_table(self.records())
            .map_err(|e| LogError::Database(e.to_string()))?;

        let mut batch = Vec::new();
        for &partition in assignment {
            if batch.len() >= max {
                break;
            }
            let start = commits
                .get((group, partition))
                .map_err(|e| LogError::Database(e.to_string()))?
                .map(|v| v.value())
                .unwrap_or(0);

            let range = records
                .range((partition, start)..=(partition, u64::MAX))
                .map_err(|e| LogError::Database(e.to_string()))?;
            for entry in range {
                if batch.len() >= max {
                    break;
                }
                let (key, value) = entry.map_err(|e| LogError::Database(e.to_string()))?;
                let (partition, offset) = key.value();
                let record: LogRecord = postcard::from_bytes(value.value())?;
                batch.push(FetchedRecord {
                    partition,
                    offset,
                    key: record.key,
                    payload: record.payload,
                    published_at_millis: record.published_at_millis,
                });
            }
        }

        Ok(batch)
    }

    /// Durably advance the group's position past `offset` in `partition`.
    ///
    /// Positions are monotonic; committing behind an earlier commit is a
    /// no-op.
    fn commit_sync(&self, group: &str, partition: u32, offset: u64) -> Result<(), LogError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| LogError::Database(e.to_string()))?;

        {
            let mut commits = write_txn
                .open_table(self.commits())
                .map_err(|e| LogError::Database(e.to_string()))?;
            let current = commits
                .get((group, partition))
                .map_err(|e| LogError::Database(e.to_string()))?
                .map(|v| v.value())
                .unwrap_or(0);
            let next = offset + 1;
            if next > current {
                commits
                    .insert((group, partition), next)
                    .map_err(|e| LogError::Database(e.to_string()))?;
            }
        }

        write_txn
            .commit()
            .map_err(|e| LogError::Database(e.to_string()))?;

        Ok(())
    }

    fn committed_sync(&self, group: &str, partition: u32) -> Result<u64, LogError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| LogError::Database(e.to_string()))?;
        let commits = read_txn
            .open_table(self.commits())
            .map_err(|e| LogError::Database(e.to_string()))?;
        Ok(commits
            .get((group, partition))
            .map_err(|e| LogError::Database(e.to_string()))?
            .map(|v| v.value())
            .unwrap_or(0))
    }

    fn ping_sync(&self) -> Result<(), LogError> {
        self.db
            .begin_read()
            .map(|_| ())
            .map_err(|e| LogError::Database(e.to_string()))
    }
}

/// Compute the partition a key is assigned to.
///
/// Stable across restarts, so one actor's records always share a partition.
fn partition_for(key: &[u8], partitions: u32) -> u32 {
    let hash = blake3::hash(key);
    let prefix: [u8; 4] = hash.as_bytes()[..4].try_into().unwrap_or([0; 4]);
    u32::from_le_bytes(prefix) % partitions
}

/// Handle to an open durable log
///
/// Cheap to clone; all clones share the same database resource.
#[derive(Clone)]
pub struct DurableLog {
    inner: Arc<LogInner>,
}

impl DurableLog {
    /// Open or create the log database
    #[instrument(skip(config), fields(path = %config.db_path.display(), topic = %config.topic))]
    pub fn open(config: LogConfig) -> Result<Self, LogError> {
        if config.partitions == 0 {
            return Err(LogError::UnknownPartition(0));
        }
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LogError::Database(e.to_string()))?;
        }

        let db =
            Database::create(&config.db_path).map_err(|e| LogError::Database(e.to_string()))?;

        let inner = LogInner {
            db,
            partitions: config.partitions,
            records_table: format!("{}__records", config.topic),
            heads_table: format!("{}__heads", config.topic),
            commits_table: format!("{}__commits", config.topic),
            data_ready: Notify::new(),
        };
        inner.init_tables()?;

        info!(partitions = config.partitions, "Opened durable log");

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Number of partitions in this log
    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    /// Partition a key maps to
    pub fn partition_for_key(&self, key: &[u8]) -> u32 {
        partition_for(key, self.inner.partitions)
    }

    /// Durably append one keyed record.
    ///
    /// Returns the record's position once the append has fsynced; on error
    /// nothing was appended.
    pub async fn publish(&self, key: Vec<u8>, payload: Vec<u8>) -> Result<(u32, u64), LogError> {
        let inner = Arc::clone(&self.inner);
        let position =
            tokio::task::spawn_blocking(move || inner.append_sync(&key, &payload)).await??;
        self.inner.data_ready.notify_waiters();
        debug!(
            partition = position.0,
            offset = position.1,
            "Appended record"
        );
        Ok(position)
    }

    /// Liveness probe: can the engine serve a read transaction?
    pub async fn ping(&self) -> Result<(), LogError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.ping_sync()).await?
    }

    /// Create a consumer owning every partition
    pub fn consumer(&self, group: impl Into<String>) -> LogConsumer {
        let assignment = (0..self.inner.partitions).collect();
        LogConsumer {
            inner: Arc::clone(&self.inner),
            group: group.into(),
            assignment,
        }
    }

    /// Create a consumer owning an explicit subset of partitions.
    ///
    /// Partition assignment across worker instances is decided outside the
    /// log; it only promises that a partition's records go to whoever owns
    /// that partition, in order.
    pub fn consumer_with_assignment(
        &self,
        group: impl Into<String>,
        mut assignment: Vec<u32>,
    ) -> Result<LogConsumer, LogError> {
        for &partition in &assignment {
            if partition >= self.inner.partitions {
                return Err(LogError::UnknownPartition(partition));
            }
        }
        assignment.sort_unstable();
        assignment.dedup();
        Ok(LogConsumer {
            inner: Arc::clone(&self.inner),
            group: group.into(),
            assignment,
        })
    }
}

/// A group member pulling records from its assigned partitions
pub struct LogConsumer {
    inner: Arc<LogInner>,
    group: String,
    assignment: Vec<u32>,
}

impl LogConsumer {
    /// Consumer group this consumer commits under
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Block until at least one uncommitted record is available, then
    /// return up to `max` records.
    ///
    /// Fetching never advances the group position: the same records are
    /// returned again until [`commit`](Self::commit) passes them.
    pub async fn fetch(&self, max: usize) -> Result<Vec<FetchedRecord>, LogError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        loop {
            // Register for wakeups before checking so an append between the
            // check and the await is not missed
            let mut notified = pin!(self.inner.data_ready.notified());
            notified.as_mut().enable();

            let inner = Arc::clone(&self.inner);
            let group = self.group.clone();
            let assignment = self.assignment.clone();
            let batch = tokio::task::spawn_blocking(move || {
                inner.read_batch_sync(&group, &assignment, max)
            })
            .await??;

            if !batch.is_empty() {
                return Ok(batch);
            }

            notified.await;
        }
    }

    /// Return immediately with whatever is currently uncommitted (testing
    /// and drain paths).
    pub async fn fetch_available(&self, max: usize) -> Result<Vec<FetchedRecord>, LogError> {
        let inner = Arc::clone(&self.inner);
        let group = self.group.clone();
        let assignment = self.assignment.clone();
        tokio::task::spawn_blocking(move || inner.read_batch_sync(&group, &assignment, max)).await?
    }

    /// Mark everything up to and including `offset` in `partition` as
    /// handled. Durable once this returns.
    pub async fn commit(&self, partition: u32, offset: u64) -> Result<(), LogError> {
        if partition >= self.inner.partitions {
            return Err(LogError::UnknownPartition(partition));
        }
        let inner = Arc::clone(&self.inner);
        let group = self.group.clone();
        tokio::task::spawn_blocking(move || inner.commit_sync(&group, partition, offset)).await?
    }

    /// The group's next-to-fetch offset for a partition
    pub async fn committed(&self, partition: u32) -> Result<u64, LogError> {
        let inner = Arc::clone(&self.inner);
        let group = self.group.clone();
        tokio::task::spawn_blocking(move || inner.committed_sync(&group, partition)).await?
    }
}
