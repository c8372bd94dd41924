//! Consumption worker
//!
//! Pulls batches from the durable log, persists each event into its month
//! partition, and commits the group position only up to the last contiguous
//! success in each partition. A malformed record is logged and counted as
//! handled; a persistence failure freezes the partition's commit point so
//! the record is redelivered. Duplicates from redelivery are absorbed by
//! the store's deterministic row key.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{Months, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_core::AuditEvent;
use vigil_log::{FetchedRecord, LogConsumer};
use vigil_store::EventStore;

/// Pause after a failed fetch before trying again
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Ensure month partitions exist for the current month and the next.
///
/// Provisioning ahead means a save straddling a month boundary never races
/// partition creation. Failure here is logged, not fatal: the worker treats
/// a missing partition as a per-record persistence failure later.
pub async fn provision_partitions(store: &EventStore) {
    let now = Utc::now();
    for month in [Some(now), now.checked_add_months(Months::new(1))] {
        let Some(month) = month else { continue };
        match store.ensure_partition(month).await {
            Ok(spec) => debug!(partition = %spec.name, "Month partition available"),
            Err(err) => warn!(error = %err, "Failed to provision month partition"),
        }
    }
}

/// The log-to-storage consumption loop
pub struct Worker {
    consumer: LogConsumer,
    store: EventStore,
    fetch_batch: usize,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        consumer: LogConsumer,
        store: EventStore,
        fetch_batch: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            consumer,
            store,
            fetch_batch,
            cancel,
        }
    }

    /// Run until cancelled. Mid-batch work finishes and commits before the
    /// loop exits.
    pub async fn run(self) {
        info!(group = self.consumer.group(), "Worker started");
        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.consumer.fetch(self.fetch_batch) => match result {
                    Ok(batch) => batch,
                    Err(err) => {
                        error!(error = %err, "Fetch failed");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(FETCH_RETRY_DELAY) => continue,
                        }
                    }
                },
            };

            self.process_batch(batch).await;
        }
        info!(group = self.consumer.group(), "Worker stopped");
    }

    /// Persist a batch and commit per-partition contiguous frontiers.
    ///
    /// The frontier for a partition stops advancing at the first
    /// persistence failure in that partition, so everything from the
    /// failed record on is redelivered on the next fetch.
    async fn process_batch(&self, batch: Vec<FetchedRecord>) {
        let mut frontier: BTreeMap<u32, u64> = BTreeMap::new();
        let mut frozen: BTreeSet<u32> = BTreeSet::new();

        for record in batch {
            if frozen.contains(&record.partition) {
                continue;
            }
            if self.handle_record(&record).await {
                frontier.insert(record.partition, record.offset);
            } else {
                // Keep the frontier at the last success; the failed record
                // and everything after it are redelivered
                frozen.insert(record.partition);
            }
        }

        for (partition, offset) in frontier {
            if let Err(err) = self.consumer.commit(partition, offset).await {
                error!(partition, offset, error = %err, "Commit failed");
            }
        }
    }

    /// Returns true when the record counts as handled (persisted, absorbed
    /// duplicate, or unparseable and skipped).
    async fn handle_record(&self, record: &FetchedRecord) -> bool {
        let event: AuditEvent = match serde_json::from_slice(&record.payload) {
            Ok(event) => event,
            Err(err) => {
                // A record that never parses would be redelivered forever;
                // skip it and move the position past it
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "Skipping malformed record"
                );
                return true;
            }
        };

        match self.store.save(&event).await {
            Ok(()) => {
                debug!(
                    event_id = %event.event_id,
                    partition = record.partition,
                    offset = record.offset,
                    "Event persisted"
                );
                true
            }
            Err(err) => {
                error!(
                    event_id = %event.event_id,
                    partition = record.partition,
                    offset = record.offset,
                    error = %err,
                    "Failed to persist event; will redeliver"
                );
                false
            }
        }
    }
}
