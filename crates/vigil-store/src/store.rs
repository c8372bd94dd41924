//! Partitioned event store
//!
//! One redb table per calendar month plus a partition catalog. The catalog
//! is the source of truth for which partitions exist: `save` refuses to
//! write into a month the catalog does not know about, which is how a
//! missing partition surfaces as a hard persistence error instead of data
//! landing in an unprovisioned table.
//!
//! Rows are keyed `(timestamp_micros, event_id)`. Both components are
//! assigned once at admission and travel with the event, so a redelivered
//! duplicate writes the identical key and the store stays idempotent-safe.

use std::path::PathBuf;
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use vigil_core::AuditEvent;

use crate::error::StoreError;
use crate::partition::{month_partition, PartitionSpec};

/// Upper bound on containment query results, newest first
pub const MAX_FIND_RESULTS: usize = 100;

// Key: partition name, Value: serialized PartitionRecord
const PARTITION_CATALOG: TableDefinition<&str, &[u8]> = TableDefinition::new("partition_catalog");

/// Catalog entry for one month partition
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartitionRecord {
    start_micros: i64,
    end_micros: i64,
}

/// One containment-query match: event identity, admission time, actor,
/// action, and the `changes` blob. The read path never exposes the rest of
/// the stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMatch {
    pub event_id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub actor_id: String,
    pub action: String,
    pub changes: serde_json::Map<String, serde_json::Value>,
}

impl From<AuditEvent> for ChangeMatch {
    fn from(event: AuditEvent) -> Self {
        Self {
            event_id: event.event_id,
            timestamp: event.timestamp,
            actor_id: event.actor_id,
            action: event.action,
            changes: event.changes,
        }
    }
}

/// Configuration for the event store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the store database file
    pub db_path: PathBuf,
    /// Base table name partitions derive from, e.g. `audit_logs`
    pub base_table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/store.redb"),
            base_table: "audit_logs".to_string(),
        }
    }
}

struct StoreInner {
    db: Database,
    base_table: String,
}

impl StoreInner {
    fn data_table<'a>(&self, name: &'a str) -> TableDefinition<'a, (i64, u128), &'static [u8]> {
        TableDefinition::new(name)
    }

    fn ensure_partition_sync(&self, spec: &PartitionSpec) -> Result<bool, StoreError> {
        {
            let read_txn = self
                .db
                .begin_read()
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let catalog = read_txn
                .open_table(PARTITION_CATALOG)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            if catalog
                .get(spec.name.as_str())
                .map_err(|e| StoreError::Database(e.to_string()))?
                .is_some()
            {
                // Already provisioned; repeated calls are a no-op
                return Ok(false);
            }
        }

        let record = PartitionRecord {
            start_micros: spec.start.timestamp_micros(),
            end_micros: spec.end.timestamp_micros(),
        };
        let encoded =
            postcard::to_allocvec(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        {
            let mut catalog = write_txn
                .open_table(PARTITION_CATALOG)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            catalog
                .insert(spec.name.as_str(), encoded.as_slice())
                .map_err(|e| StoreError::Database(e.to_string()))?;

            // Creating the data table in the same transaction keeps the
            // catalog and the physical partition in lockstep
            write_txn
                .open_table(self.data_table(&spec.name))
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(true)
    }

    fn has_partition_sync(&self, name: &str) -> Result<bool, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let catalog = read_txn
            .open_table(PARTITION_CATALOG)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(catalog
            .get(name)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some())
    }

    fn save_sync(
        &self,
        partition_name: &str,
        ts_micros: i64,
        event_id: u128,
        row: &[u8],
    ) -> Result<(), StoreError> {
        if !self.has_partition_sync(partition_name)? {
            return Err(StoreError::MissingPartition(partition_name.to_string()));
        }

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let replaced = {
            let mut table = write_txn
                .open_table(self.data_table(partition_name))
                .map_err(|e| StoreError::Database(e.to_string()))?;
            table
                .insert((ts_micros, event_id), row)
                .map_err(|e| StoreError::Database(e.to_string()))?
                .is_some()
        };
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if replaced {
            // Redelivery after a crash between persistence and commit; the
            // row key is deterministic so this is a harmless repeat write
            debug!(
                partition = partition_name,
                event_id = %Uuid::from_u128(event_id),
                "Duplicate event absorbed"
            );
        }

        Ok(())
    }

    fn find_by_change_sync(
        &self,
        key: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<ChangeMatch>, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let catalog = read_txn
            .open_table(PARTITION_CATALOG)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // Zero-padded names sort chronologically; reverse for newest first
        let mut names = Vec::new();
        for entry in catalog
            .iter()
            .map_err(|e| StoreError::Database(e.to_string()))?
            .rev()
        {
            let (name, _) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
            names.push(name.value().to_string());
        }

        let mut matches = Vec::new();
        for name in names {
            if matches.len() >= limit {
                break;
            }
            let table = match read_txn.open_table(self.data_table(&name)) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(StoreError::Database(e.to_string())),
            };
            for entry in table
                .iter()
                .map_err(|e| StoreError::Database(e.to_string()))?
                .rev()
            {
                if matches.len() >= limit {
                    break;
                }
                let (_, row) = entry.map_err(|e| StoreError::Database(e.to_string()))?;
                let event: AuditEvent = serde_json::from_slice(row.value())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                if event.contains_change(key, value) {
                    matches.push(ChangeMatch::from(event));
                }
            }
        }

        Ok(matches)
    }

    fn rows_in_partition_sync(&self, name: &str) -> Result<u64, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        match read_txn.open_table(self.data_table(name)) {
            Ok(table) => table.len().map_err(|e| StoreError::Database(e.to_string())),
            Err(TableError::TableDoesNotExist(_)) => Ok(0),
            Err(e) => Err(StoreError::Database(e.to_string())),
        }
    }

    fn ping_sync(&self) -> Result<(), StoreError> {
        self.db
            .begin_read()
            .map(|_| ())
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

/// Handle to the partitioned event store
///
/// Cheap to clone; all clones share the same database resource.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

impl EventStore {
    /// Open or create the store database
    #[instrument(skip(config), fields(path = %config.db_path.display(), base = %config.base_table))]
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(e.to_string()))?;
        }

        let db =
            Database::create(&config.db_path).map_err(|e| StoreError::Database(e.to_string()))?;

        // Create the catalog up front
        let write_txn = db
            .begin_write()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        write_txn
            .open_table(PARTITION_CATALOG)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        info!("Opened event store");

        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                base_table: config.base_table,
            }),
        })
    }

    /// Base table name partitions derive from
    pub fn base_table(&self) -> &str {
        &self.inner.base_table
    }

    /// Idempotent create-if-absent for the month partition covering
    /// `for_time`. Re-invocation for an existing month is a no-op, not an
    /// error. Returns the partition spec.
    pub async fn ensure_partition(
        &self,
        for_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<PartitionSpec, StoreError> {
        let spec = month_partition(&self.inner.base_table, for_time)?;
        let inner = Arc::clone(&self.inner);
        let to_create = spec.clone();
        let created =
            tokio::task::spawn_blocking(move || inner.ensure_partition_sync(&to_create)).await??;
        if created {
            info!(partition = %spec.name, "Created month partition");
        }
        Ok(spec)
    }

    /// Does the month partition covering `for_time` exist?
    pub async fn has_partition(
        &self,
        for_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, StoreError> {
        let spec = month_partition(&self.inner.base_table, for_time)?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.has_partition_sync(&spec.name)).await?
    }

    /// Persist one event into the month partition its timestamp addresses.
    ///
    /// `changes` and `metadata` are stored inside an opaque structured blob,
    /// uninterpreted. Fails with [`StoreError::MissingPartition`] when the
    /// month was never provisioned. Never updates or deletes.
    #[instrument(skip_all, fields(event_id = %event.event_id))]
    pub async fn save(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let spec = month_partition(&self.inner.base_table, event.timestamp)?;
        let row = serde_json::to_vec(event)?;
        let ts_micros = event.timestamp.timestamp_micros();
        let event_id = event.event_id.as_u128();

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner.save_sync(&spec.name, ts_micros, event_id, &row)
        })
        .await?
    }

    /// Containment read path: up to [`MAX_FIND_RESULTS`] matches whose
    /// `changes` contains `key: value`, newest first, projected to
    /// identity/time/actor/action/changes.
    pub async fn find_by_change(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Vec<ChangeMatch>, StoreError> {
        let key = key.into();
        let value = value.into();
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner.find_by_change_sync(&key, &value, MAX_FIND_RESULTS)
        })
        .await?
    }

    /// Number of rows in the month partition covering `for_time`
    pub async fn rows_in_partition(
        &self,
        for_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, StoreError> {
        let spec = month_partition(&self.inner.base_table, for_time)?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.rows_in_partition_sync(&spec.name)).await?
    }

    /// Storage reachability probe for the readiness path
    pub async fn ping(&self) -> Result<(), StoreError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.ping_sync()).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use tempfile::TempDir;

    fn create_test_store() -> (EventStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: temp_dir.path().join("store.redb"),
            ..Default::default()
        };
        let store = EventStore::open(config).unwrap();
        (store, temp_dir)
    }

    fn event_at(ts: chrono::DateTime<Utc>, actor: &str, changes: &[(&str, &str)]) -> AuditEvent {
        let mut event: AuditEvent = serde_json::from_str(&format!(
            r#"{{"actor_id":"{actor}","action":"update","resource_type":"user","resource_id":"42"}}"#
        ))
        .unwrap();
        event.timestamp = ts;
        for (k, v) in changes {
            event
                .changes
                .insert((*k).to_string(), Value::String((*v).to_string()));
        }
        event
    }

    #[tokio::test]
    async fn test_ensure_partition_is_idempotent() {
        let (store, _temp) = create_test_store();
        let march = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();

        let first = store.ensure_partition(march).await.unwrap();
        let second = store.ensure_partition(march).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.name, "audit_logs_2024_03");
        assert!(store.has_partition(march).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_fails_without_partition() {
        let (store, _temp) = create_test_store();
        let ts = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();

        let err = store.save(&event_at(ts, "u1", &[])).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingPartition(name) if name == "audit_logs_2024_03"));
    }

    #[tokio::test]
    async fn test_save_and_find_by_change() {
        let (store, _temp) = create_test_store();
        let ts = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        store.ensure_partition(ts).await.unwrap();

        store
            .save(&event_at(ts, "u1", &[("action", "login")]))
            .await
            .unwrap();
        store
            .save(&event_at(ts, "u2", &[("action", "logout")]))
            .await
            .unwrap();

        let found = store.find_by_change("action", "login").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].actor_id, "u1");

        // The match carries only identity/time/actor/action/changes
        let json = serde_json::to_value(&found[0]).unwrap();
        assert!(json.get("changes").is_some());
        assert!(json.get("resource_type").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[tokio::test]
    async fn test_find_returns_newest_first_across_partitions() {
        let (store, _temp) = create_test_store();
        let february = Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap();
        let march = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        store.ensure_partition(february).await.unwrap();
        store.ensure_partition(march).await.unwrap();

        store
            .save(&event_at(february, "old", &[("field", "email")]))
            .await
            .unwrap();
        store
            .save(&event_at(march, "new", &[("field", "email")]))
            .await
            .unwrap();

        let found = store.find_by_change("field", "email").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].actor_id, "new");
        assert_eq!(found[1].actor_id, "old");
    }

    #[tokio::test]
    async fn test_find_caps_results_at_limit() {
        let (store, _temp) = create_test_store();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        store.ensure_partition(ts).await.unwrap();

        for i in 0..(MAX_FIND_RESULTS + 20) {
            let event_time = ts + chrono::Duration::seconds(i as i64);
            store
                .save(&event_at(event_time, &format!("u{i}"), &[("kind", "bulk")]))
                .await
                .unwrap();
        }

        let found = store.find_by_change("kind", "bulk").await.unwrap();
        assert_eq!(found.len(), MAX_FIND_RESULTS);
        // Newest first within the partition
        assert_eq!(found[0].actor_id, format!("u{}", MAX_FIND_RESULTS + 19));
    }

    #[tokio::test]
    async fn test_redelivered_duplicate_is_benign() {
        let (store, _temp) = create_test_store();
        let ts = Utc.with_ymd_and_hms(2024, 6, 2, 8, 0, 0).unwrap();
        store.ensure_partition(ts).await.unwrap();

        let event = event_at(ts, "u1", &[("field", "name")]);
        store.save(&event).await.unwrap();
        store.save(&event).await.unwrap();

        assert_eq!(store.rows_in_partition(ts).await.unwrap(), 1);
        let found = store.find_by_change("field", "name").await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_month_boundary_event_lands_in_its_month() {
        let (store, _temp) = create_test_store();
        let boundary = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap();
        let next = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        store.ensure_partition(boundary).await.unwrap();
        store.ensure_partition(next).await.unwrap();

        store.save(&event_at(boundary, "edge", &[])).await.unwrap();

        assert_eq!(store.rows_in_partition(boundary).await.unwrap(), 1);
        assert_eq!(store.rows_in_partition(next).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rows_persist_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: temp_dir.path().join("store.redb"),
            ..Default::default()
        };
        let ts = Utc.with_ymd_and_hms(2024, 9, 9, 9, 0, 0).unwrap();

        {
            let store = EventStore::open(config.clone()).unwrap();
            store.ensure_partition(ts).await.unwrap();
            store
                .save(&event_at(ts, "u1", &[("field", "email")]))
                .await
                .unwrap();
        }

        let store = EventStore::open(config).unwrap();
        assert!(store.has_partition(ts).await.unwrap());
        assert_eq!(store.rows_in_partition(ts).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ping() {
        let (store, _temp) = create_test_store();
        store.ping().await.unwrap();
    }
}
