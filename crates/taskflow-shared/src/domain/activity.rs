//! Activity log entries: the append-only audit trail attached to each task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
    Worker,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEventType {
    Created,
    StatusChanged,
    Claimed,
    Commented,
    Updated,
    CallbackReceived,
    Completed,
    Failed,
    Cancelled,
}

/// A single field mutation recorded alongside a status change or update.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
}

/// One append-only entry in a task's activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub event_type: ActivityEventType,
    pub actor_id: Option<String>,
    pub actor_type: ActorType,
    #[serde(default)]
    pub changes: Vec<FieldChange>,
    pub comment: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        task_id: Uuid,
        event_type: ActivityEventType,
        actor_type: ActorType,
        actor_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_id,
            event_type,
            actor_id,
            actor_type,
            changes: Vec::new(),
            comment: None,
            metadata: None,
            occurred_at: now,
        }
    }

    #[must_use]
    pub fn with_change(mut self, field: impl Into<String>, old: Option<serde_json::Value>, new: Option<serde_json::Value>) -> Self {
        self.changes.push(FieldChange {
            field: field.into(),
            old_value: old,
            new_value: new,
        });
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}
