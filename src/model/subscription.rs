use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::object::ObjectWire;

/// One object a client declared interest in, with the revision/timestamp it
/// last observed.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbedObject {
    pub object_key: String,
    #[serde(default)]
    pub object_revision: i64,
    #[serde(default)]
    pub object_timestamp: i64,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// A parked long-poll connection. Ephemeral and in-memory only — never
/// persisted, never survives a restart.
pub struct Subscription {
    pub session: Option<String>,
    pub serial: String,
    pub interests: Vec<ProbedObject>,
    pub connected_at: Instant,
    pub deadline: Instant,
    pub responder: Option<oneshot::Sender<SubscriptionOutcome>>,
}

impl Subscription {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// What a parked subscription resolves to when woken: either a delta batch
/// (the normal wakeup path) or an empty result (timeout/shutdown).
#[derive(Debug, Clone, Serialize, Default)]
pub struct SubscriptionOutcome {
    pub objects: Vec<ObjectWire>,
}

impl SubscriptionOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_objects(objects: Vec<ObjectWire>) -> Self {
        Self { objects }
    }
}
