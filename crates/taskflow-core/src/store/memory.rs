//! In-memory reference [`StoreGateway`]. Advisory caches elsewhere in the
//! engine are never the source of truth; this store is — each `DashMap`
//! shard lock is the atomicity boundary that stands in for a document
//! store's update-one / find-and-modify primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use taskflow_shared::domain::{ActivityEntry, Run, Task, TaskStatus, Workflow};
use taskflow_shared::errors::{EngineError, EngineResult};

use super::{
    CounterDeltas, ExpectedCountUpdate, RunFilter, RunMutation, SortOrder, StoreGateway,
    TaskFilter, TaskMutation, TimerEntry,
};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tasks: DashMap<Uuid, Task>,
    runs: DashMap<Uuid, Run>,
    workflows: DashMap<String, Workflow>,
    activity: DashMap<Uuid, Vec<ActivityEntry>>,
    timers: DashMap<Uuid, TimerEntry>,
    sequence: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

fn matches_task_filter(task: &Task, filter: &TaskFilter) -> bool {
    if let Some(run_id) = filter.run_id {
        if task.run_id != run_id {
            return false;
        }
    }
    if let Some(parent_id) = filter.parent_id {
        if task.parent_id != Some(parent_id) {
            return false;
        }
    }
    if let Some(step_id) = &filter.workflow_step_id {
        if &task.workflow_step_id != step_id {
            return false;
        }
    }
    if !filter.status_in.is_empty() && !filter.status_in.contains(&task.status) {
        return false;
    }
    if !filter.tags.is_empty() && !filter.tags.iter().all(|t| task.tags.contains(t)) {
        return false;
    }
    if !filter.include_archived && task.archived {
        return false;
    }
    true
}

fn sort_tasks(tasks: &mut [Task], sort: SortOrder) {
    match sort {
        SortOrder::CreatedAtAsc => tasks.sort_by_key(|t| t.created_at),
        SortOrder::CreatedAtDesc => tasks.sort_by_key(|t| std::cmp::Reverse(t.created_at)),
    }
}

#[async_trait]
impl StoreGateway for InMemoryStore {
    async fn get_task(&self, task_id: Uuid) -> EngineResult<Task> {
        self.tasks
            .get(&task_id)
            .map(|t| t.clone())
            .ok_or_else(|| EngineError::task_not_found(task_id))
    }

    async fn insert_task(&self, task: Task) -> EngineResult<Task> {
        self.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn list_tasks(&self, filter: TaskFilter, sort: SortOrder) -> EngineResult<Vec<Task>> {
        let mut matched: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| matches_task_filter(entry.value(), &filter))
            .map(|entry| entry.value().clone())
            .collect();
        sort_tasks(&mut matched, sort);
        Ok(matched)
    }

    async fn atomic_transition(
        &self,
        task_id: Uuid,
        from: &[TaskStatus],
        mutation: TaskMutation,
    ) -> EngineResult<Option<Task>> {
        let Some(mut entry) = self.tasks.get_mut(&task_id) else {
            return Err(EngineError::task_not_found(task_id));
        };
        if !from.contains(&entry.status) {
            return Ok(None);
        }
        let apply = mutation.into_fn();
        apply(&mut entry);
        entry.updated_at = Utc::now();
        Ok(Some(entry.clone()))
    }

    async fn increment_counters(
        &self,
        task_id: Uuid,
        deltas: CounterDeltas,
        expected_count_update: ExpectedCountUpdate,
    ) -> EngineResult<Task> {
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| EngineError::task_not_found(task_id))?;
        let counters = &mut entry.batch_counters;
        counters.received_count = (counters.received_count as i64 + deltas.received).max(0) as u64;
        counters.processed_count = (counters.processed_count as i64 + deltas.processed).max(0) as u64;
        counters.failed_count = (counters.failed_count as i64 + deltas.failed).max(0) as u64;
        match expected_count_update {
            ExpectedCountUpdate::Unchanged => {}
            ExpectedCountUpdate::RaiseTo(value) => {
                counters.expected_count = Some(counters.expected_count.unwrap_or(0).max(value));
            }
            ExpectedCountUpdate::SealAtReceived => {
                counters.is_sealed = true;
                counters.expected_count =
                    Some(counters.expected_count.unwrap_or(0).max(counters.received_count));
            }
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn find_and_claim_one(
        &self,
        filter: TaskFilter,
        sort: SortOrder,
        mutation: TaskMutation,
    ) -> EngineResult<Option<Task>> {
        let mut timestamped: Vec<(DateTime<Utc>, Uuid)> = self
            .tasks
            .iter()
            .filter(|entry| matches_task_filter(entry.value(), &filter))
            .map(|entry| (entry.value().created_at, *entry.key()))
            .collect();
        match sort {
            SortOrder::CreatedAtAsc => timestamped.sort_by_key(|(ts, _)| *ts),
            SortOrder::CreatedAtDesc => timestamped.sort_by_key(|(ts, _)| std::cmp::Reverse(*ts)),
        }
        let Some((_, task_id)) = timestamped.into_iter().next() else {
            return Ok(None);
        };
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| EngineError::task_not_found(task_id))?;
        let apply = mutation.into_fn();
        apply(&mut entry);
        entry.updated_at = Utc::now();
        Ok(Some(entry.clone()))
    }

    async fn get_run(&self, run_id: Uuid) -> EngineResult<Run> {
        self.runs
            .get(&run_id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::run_not_found(run_id))
    }

    async fn insert_run(&self, run: Run) -> EngineResult<Run> {
        self.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn update_run(&self, run_id: Uuid, mutation: RunMutation) -> EngineResult<Run> {
        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| EngineError::run_not_found(run_id))?;
        let apply = mutation.into_fn();
        apply(&mut entry);
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn list_runs(&self, filter: RunFilter) -> EngineResult<(Vec<Run>, usize)> {
        let mut matched: Vec<Run> = self
            .runs
            .iter()
            .filter(|entry| {
                let run = entry.value();
                if let Some(workflow_id) = &filter.workflow_id {
                    if &run.workflow_id != workflow_id {
                        return false;
                    }
                }
                if !filter.status_in.is_empty() && !filter.status_in.contains(&run.status) {
                    return false;
                }
                if let Some(after) = filter.created_after {
                    if run.created_at < after {
                        return false;
                    }
                }
                if let Some(before) = filter.created_before {
                    if run.created_at > before {
                        return false;
                    }
                }
                true
            })
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        let total = matched.len();
        let limit = if filter.limit == 0 { total } else { filter.limit };
        let page = matched.into_iter().skip(filter.offset).take(limit).collect();
        Ok((page, total))
    }

    async fn append_activity(&self, entry: ActivityEntry) -> EngineResult<()> {
        self.activity.entry(entry.task_id).or_default().push(entry);
        Ok(())
    }

    async fn list_activity(&self, task_id: Uuid) -> EngineResult<Vec<ActivityEntry>> {
        Ok(self
            .activity
            .get(&task_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn get_workflow(&self, workflow_id: &str) -> EngineResult<Workflow> {
        self.workflows
            .get(workflow_id)
            .map(|w| w.clone())
            .ok_or_else(|| EngineError::not_found(format!("workflow {workflow_id}")))
    }

    async fn put_workflow(&self, workflow: Workflow) -> EngineResult<()> {
        self.workflows.insert(workflow.workflow_id.clone(), workflow);
        Ok(())
    }

    async fn arm_timer(&self, timer: TimerEntry) -> EngineResult<()> {
        self.timers.insert(timer.id, timer);
        let _ = self.next_seq();
        Ok(())
    }

    async fn cancel_timer(&self, timer_id: Uuid) -> EngineResult<()> {
        self.timers.remove(&timer_id);
        Ok(())
    }

    async fn take_due_timers(&self, now: DateTime<Utc>) -> EngineResult<Vec<TimerEntry>> {
        let due: Vec<Uuid> = self
            .timers
            .iter()
            .filter(|entry| entry.value().fire_at <= now)
            .map(|entry| *entry.key())
            .collect();
        let mut fired = Vec::with_capacity(due.len());
        for id in due {
            if let Some((_, timer)) = self.timers.remove(&id) {
                fired.push(timer);
            }
        }
        Ok(fired)
    }
}
