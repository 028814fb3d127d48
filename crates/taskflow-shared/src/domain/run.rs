//! Runs: a single instantiation of a workflow against an input payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority/urgency carried by a run's default settings and inherited by the
/// tasks it materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Run-level defaults inherited by every task the run materializes, unless a
/// step's own overrides win.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TaskDefaults {
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Number of seconds after task creation a due date is computed from, if
    /// the caller wants tasks to carry one.
    #[serde(default)]
    pub due_offset_seconds: Option<i64>,
}

/// Caller-supplied knobs that influence how a run is driven, set at start
/// time and immutable afterward.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ExecutionOptions {
    /// Step ids at which the run should halt after completion instead of
    /// auto-activating successors.
    #[serde(default)]
    pub pause_at_steps: Vec<String>,
    /// Step ids to skip entirely; their successors activate as if they had
    /// completed immediately.
    #[serde(default)]
    pub skip_steps: Vec<String>,
    /// When true, the run is validated and planned but no tasks are created.
    #[serde(default)]
    pub dry_run: bool,
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A per-run secret used to authenticate inbound external callbacks.
/// Compared in constant time to avoid leaking its value through response
/// timing.
#[derive(Clone, Serialize, Deserialize)]
pub struct CallbackSecret(String);

impl CallbackSecret {
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    #[must_use]
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn exposed(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        let a = self.0.as_bytes();
        let b = candidate.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        let mut diff: u8 = 0;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

impl std::fmt::Debug for CallbackSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CallbackSecret(<redacted>)")
    }
}

/// A single instantiation of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub status: RunStatus,
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    pub task_defaults: TaskDefaults,
    pub execution_options: ExecutionOptions,
    pub callback_secret: CallbackSecret,
    /// Step ids currently holding at least one non-terminal task.
    pub current_step_ids: Vec<String>,
    /// Step ids that have produced at least one completed task, in
    /// completion order.
    pub completed_step_ids: Vec<String>,
    pub failed_step_id: Option<String>,
    pub error_message: Option<String>,
    pub external_id: Option<String>,
    /// Set when this run was started as a subflow: the id of the parent
    /// task whose status mirrors this run's terminal outcome.
    #[serde(default)]
    pub spawned_by_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_version: u32,
        input: serde_json::Value,
        task_defaults: TaskDefaults,
        execution_options: ExecutionOptions,
        external_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            workflow_version,
            status: RunStatus::Pending,
            input,
            output: None,
            task_defaults,
            execution_options,
            callback_secret: CallbackSecret::generate(),
            current_step_ids: Vec::new(),
            completed_step_ids: Vec::new(),
            failed_step_id: None,
            error_message: None,
            external_id,
            spawned_by_task_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks this run as a subflow spawned on behalf of `task_id`; its
    /// terminal status will be mirrored onto that task.
    #[must_use]
    pub fn with_spawned_by(mut self, task_id: Uuid) -> Self {
        self.spawned_by_task_id = Some(task_id);
        self
    }

    #[must_use]
    pub fn is_paused_at(&self, step_id: &str) -> bool {
        self.execution_options
            .pause_at_steps
            .iter()
            .any(|s| s == step_id)
    }

    #[must_use]
    pub fn should_skip(&self, step_id: &str) -> bool {
        self.execution_options
            .skip_steps
            .iter()
            .any(|s| s == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_secret_matches_itself() {
        let secret = CallbackSecret::from_raw("sup3r-secret");
        assert!(secret.matches("sup3r-secret"));
        assert!(!secret.matches("wrong"));
    }

    #[test]
    fn callback_secret_rejects_different_length() {
        let secret = CallbackSecret::from_raw("short");
        assert!(!secret.matches("a-much-longer-candidate"));
    }

    #[test]
    fn callback_secret_debug_redacts() {
        let secret = CallbackSecret::from_raw("hunter2");
        assert_eq!(format!("{secret:?}"), "CallbackSecret(<redacted>)");
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn new_run_starts_running_with_fresh_secret() {
        let run = Run::new(
            "wf-1",
            1,
            serde_json::json!({}),
            TaskDefaults::default(),
            ExecutionOptions::default(),
            None,
            Utc::now(),
        );
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.current_step_ids.is_empty());
    }
}
