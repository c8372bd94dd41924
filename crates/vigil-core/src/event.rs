//! The audit event record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One audit record describing an action taken by an actor on a resource.
///
/// `event_id` and `timestamp` are authoritative only from the gateway: any
/// caller-supplied values are overwritten at admission and are immutable
/// afterwards. `changes` and `metadata` are open-ended key-ordered maps,
/// stored as opaque structured blobs with no schema enforced downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Globally unique identifier, assigned by the gateway at admission
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    /// Admission time (UTC), assigned by the gateway; also the storage
    /// partitioning key
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Who performed the action; the log's partition/ordering key
    pub actor_id: String,
    /// What was done
    pub action: String,
    /// Kind of resource acted on
    pub resource_type: String,
    /// Which resource was acted on
    pub resource_id: String,
    /// What changed, as an open-ended key -> value mapping
    #[serde(default)]
    pub changes: Map<String, Value>,
    /// Caller-supplied context, uninterpreted by the pipeline
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AuditEvent {
    /// Overwrite the gateway-owned identity and admission time.
    ///
    /// Called exactly once per admitted request; the event is immutable
    /// after this point.
    pub fn stamp(&mut self) {
        self.event_id = Uuid::new_v4();
        self.timestamp = Utc::now();
    }

    /// Single-predicate containment check: does `changes` map `key` to the
    /// string `value`?
    pub fn contains_change(&self, key: &str, value: &str) -> bool {
        matches!(self.changes.get(key), Some(Value::String(s)) if s == value)
    }
}
