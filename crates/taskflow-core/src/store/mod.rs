//! Typed operations over the backing store. The reference implementation in
//! [`memory`] is an in-memory stand-in for a document store with
//! atomic update-one, find-and-modify, and indexed queries; a production
//! deployment swaps it for one backed by a real database without touching
//! any caller of [`StoreGateway`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use taskflow_shared::domain::{ActivityEntry, Run, Task, TaskStatus, Workflow};
use taskflow_shared::errors::EngineResult;

/// A single in-place mutation applied under a compare-and-set guard. Boxed
/// so callers can capture whatever state they need without the store
/// gateway knowing the shape of any particular mutation.
pub struct TaskMutation {
    apply: Box<dyn FnOnce(&mut Task) + Send>,
}

impl TaskMutation {
    pub fn new(apply: impl FnOnce(&mut Task) + Send + 'static) -> Self {
        Self {
            apply: Box::new(apply),
        }
    }

    pub fn set_status(status: TaskStatus) -> Self {
        Self::new(move |task| task.status = status)
    }

    pub(crate) fn into_fn(self) -> Box<dyn FnOnce(&mut Task) + Send> {
        self.apply
    }
}

pub struct RunMutation {
    apply: Box<dyn FnOnce(&mut Run) + Send>,
}

impl RunMutation {
    pub fn new(apply: impl FnOnce(&mut Run) + Send + 'static) -> Self {
        Self {
            apply: Box::new(apply),
        }
    }

    pub(crate) fn into_fn(self) -> Box<dyn FnOnce(&mut Run) + Send> {
        self.apply
    }
}

/// Net arithmetic applied to a task's batch counters in one atomic step.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterDeltas {
    pub received: i64,
    pub processed: i64,
    pub failed: i64,
}

/// How `expectedCount` should move as part of a counter increment.
#[derive(Debug, Clone, Copy, Default)]
pub enum ExpectedCountUpdate {
    #[default]
    Unchanged,
    /// Raise to at least this value; never lowers it (monotone sealing).
    RaiseTo(u64),
    /// `expectedCount := max(expectedCount, receivedCount)`, applied after
    /// the receive delta above.
    SealAtReceived,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub run_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub workflow_step_id: Option<String>,
    pub status_in: Vec<TaskStatus>,
    pub tags: Vec<String>,
    pub include_archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    CreatedAtAsc,
    CreatedAtDesc,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_id: Option<String>,
    pub status_in: Vec<taskflow_shared::domain::RunStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ExternalTimeout,
    JoinMaxWait,
    WebhookRetry,
    BatchDeadline,
}

#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub id: Uuid,
    pub fire_at: DateTime<Utc>,
    pub kind: TimerKind,
    pub subject_id: Uuid,
}

/// Typed store operations the engine relies on. All correctness-critical
/// methods (`atomic_transition`, `increment_counters`, `find_and_claim_one`)
/// are single round trips to the backing store so that no in-process lock is
/// ever needed to guard a cross-task invariant.
#[async_trait]
pub trait StoreGateway: Send + Sync + 'static {
    async fn get_task(&self, task_id: Uuid) -> EngineResult<Task>;
    async fn insert_task(&self, task: Task) -> EngineResult<Task>;
    async fn list_tasks(&self, filter: TaskFilter, sort: SortOrder) -> EngineResult<Vec<Task>>;

    /// Compare-and-set: applies `mutation` only if the task's current status
    /// is one of `from`. Returns `None` if the predecessor status didn't
    /// match (someone else already won the transition).
    async fn atomic_transition(
        &self,
        task_id: Uuid,
        from: &[TaskStatus],
        mutation: TaskMutation,
    ) -> EngineResult<Option<Task>>;

    /// One atomic arithmetic update to a task's batch counters.
    async fn increment_counters(
        &self,
        task_id: Uuid,
        deltas: CounterDeltas,
        expected_count_update: ExpectedCountUpdate,
    ) -> EngineResult<Task>;

    /// Leases a single matching task by applying `mutation` to the first
    /// match under `sort`. Used to claim pending work.
    async fn find_and_claim_one(
        &self,
        filter: TaskFilter,
        sort: SortOrder,
        mutation: TaskMutation,
    ) -> EngineResult<Option<Task>>;

    async fn get_run(&self, run_id: Uuid) -> EngineResult<Run>;
    async fn insert_run(&self, run: Run) -> EngineResult<Run>;
    async fn update_run(&self, run_id: Uuid, mutation: RunMutation) -> EngineResult<Run>;
    async fn list_runs(&self, filter: RunFilter) -> EngineResult<(Vec<Run>, usize)>;

    async fn append_activity(&self, entry: ActivityEntry) -> EngineResult<()>;
    async fn list_activity(&self, task_id: Uuid) -> EngineResult<Vec<ActivityEntry>>;

    async fn get_workflow(&self, workflow_id: &str) -> EngineResult<Workflow>;
    async fn put_workflow(&self, workflow: Workflow) -> EngineResult<()>;

    async fn arm_timer(&self, timer: TimerEntry) -> EngineResult<()>;
    async fn cancel_timer(&self, timer_id: Uuid) -> EngineResult<()>;
    /// Timers with `fire_at <= now`, removed from the store as part of the
    /// same call so a restart doesn't refire them.
    async fn take_due_timers(&self, now: DateTime<Utc>) -> EngineResult<Vec<TimerEntry>>;
}
