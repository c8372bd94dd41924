//! Publisher port for the ingestion side
//!
//! The gateway needs exactly two things from the log: publish one event and
//! answer a liveness probe. Keeping that behind a trait lets handler tests
//! swap in a failing publisher without a broker of any kind.

use async_trait::async_trait;
use tracing::instrument;

use vigil_core::AuditEvent;

use crate::error::LogError;
use crate::log::DurableLog;

/// Ability to durably publish audit events, keyed by actor.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Durably append one event; returns only after the log has
    /// acknowledged the append, or with an error and no partial effect.
    async fn publish(&self, event: &AuditEvent) -> Result<(), LogError>;

    /// Liveness probe for the readiness path.
    async fn ping(&self) -> Result<(), LogError>;
}

#[async_trait]
impl EventPublisher for DurableLog {
    /// Wire format: value = the event as self-describing JSON, key =
    /// `actor_id` bytes (partition assignment, per-actor ordering).
    #[instrument(skip_all, fields(event_id = %event.event_id, actor_id = %event.actor_id))]
    async fn publish(&self, event: &AuditEvent) -> Result<(), LogError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| LogError::Serialization(e.to_string()))?;
        let key = event.actor_id.as_bytes().to_vec();
        self.publish(key, payload).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), LogError> {
        DurableLog::ping(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogConfig;
    use tempfile::TempDir;

    fn sample_event(actor: &str) -> AuditEvent {
        serde_json::from_str(&format!(
            r#"{{"actor_id":"{actor}","action":"update","resource_type":"user","resource_id":"42","changes":{{"field":"email"}}}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_published_event_round_trips_through_log() {
        let temp_dir = TempDir::new().unwrap();
        let log = DurableLog::open(LogConfig {
            db_path: temp_dir.path().join("log.redb"),
            ..Default::default()
        })
        .unwrap();

        let event = sample_event("u1");
        EventPublisher::publish(&log, &event).await.unwrap();

        let consumer = log.consumer("g1");
        let batch = consumer.fetch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, b"u1".to_vec());

        let decoded: AuditEvent = serde_json::from_slice(&batch[0].payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn test_same_actor_lands_in_one_partition() {
        let temp_dir = TempDir::new().unwrap();
        let log = DurableLog::open(LogConfig {
            db_path: temp_dir.path().join("log.redb"),
            ..Default::default()
        })
        .unwrap();

        for _ in 0..3 {
            EventPublisher::publish(&log, &sample_event("same-actor"))
                .await
                .unwrap();
        }

        let consumer = log.consumer("g1");
        let batch = consumer.fetch(10).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|r| r.partition == batch[0].partition));
        assert_eq!(
            batch.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }
}
