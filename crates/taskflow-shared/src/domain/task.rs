//! Tasks: the runtime materialization of a step within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow::{Boundary, JoinScope};

/// Lifecycle state of a task. Transitions are enforced by the store gateway
/// as a compare-and-set on this field, which doubles as the per-task mutual
/// exclusion token: whichever caller wins the CAS is the only one allowed to
/// act on the task's new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet handed to its executor (agent dispatch pending,
    /// manual task not yet claimed, webhook not yet sent).
    Pending,
    /// Actively running: agent dispatched, manual task claimed, webhook
    /// in flight.
    InProgress,
    /// A foreach/join task accumulating child results, not yet sealed or not
    /// yet boundary-satisfied.
    Waiting,
    /// Manual task explicitly parked by its assignee; does not count toward
    /// any boundary evaluation.
    OnHold,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// How a task's completion is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Resolved synchronously by the dispatcher (trigger, decision).
    Immediate,
    /// Driven by an agent worker pulling and reporting results.
    Automated,
    /// Completed by a human actor via the task API.
    Manual,
    /// Completed by inbound external callback(s).
    ExternalCallback,
}

/// Fan-out/fan-in batch accounting, kept as atomics at the store layer and
/// surfaced here as a plain snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct BatchCounters {
    /// `None` until the producer seals the batch or, for join tasks with a
    /// known scope, until the scope membership becomes knowable.
    pub expected_count: Option<u64>,
    pub received_count: u64,
    pub processed_count: u64,
    pub failed_count: u64,
    pub is_sealed: bool,
}

impl BatchCounters {
    #[must_use]
    pub fn done_count(&self) -> u64 {
        self.processed_count + self.failed_count
    }

    #[must_use]
    pub fn success_percent(&self) -> f64 {
        let denominator = self.expected_count.unwrap_or(0).max(1);
        100.0 * (self.processed_count as f64) / (denominator as f64)
    }
}

/// Runtime configuration captured on a join task at creation time, mirroring
/// the workflow step's `JoinConfig` but resolved against the concrete run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JoinRuntime {
    pub await_step_id: String,
    pub scope: JoinScope,
    pub boundary: Boundary,
    pub await_task_id: Option<Uuid>,
    pub deadline_at: Option<DateTime<Utc>>,
}

/// Runtime configuration for an external-callback task.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExternalRuntime {
    pub expected_callbacks: u32,
    pub received_callbacks: u32,
    pub timeout_at: Option<DateTime<Utc>>,
}

/// A single recorded webhook delivery attempt.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebhookAttempt {
    pub attempt: u32,
    pub sent_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// Runtime configuration and history for a webhook task.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct WebhookRuntime {
    pub attempts: Vec<WebhookAttempt>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Kind-specific runtime state that doesn't fit the common task fields.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskRuntime {
    None,
    Join(JoinRuntime),
    External(ExternalRuntime),
    Webhook(WebhookRuntime),
}

/// The runtime materialization of a step, within a specific run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_step_id: String,
    pub parent_id: Option<Uuid>,
    pub title: String,
    pub summary: Option<String>,
    pub status: TaskStatus,
    pub execution_mode: ExecutionMode,
    pub urgency: super::run::Urgency,
    pub assignee: Option<String>,
    pub tags: Vec<String>,
    pub batch_counters: BatchCounters,
    pub runtime: TaskRuntime,
    pub decision_result: Option<String>,
    /// Free-form payload: step inputs, produced outputs, callback bodies.
    /// Treated as opaque by the engine core and interpreted only by step
    /// strategies and condition/template evaluators.
    pub metadata: serde_json::Value,
    pub creator: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
}

impl Task {
    #[must_use]
    pub fn is_foreach_parent(&self) -> bool {
        matches!(self.runtime, TaskRuntime::None) && self.batch_counters.expected_count.is_some()
    }
}
