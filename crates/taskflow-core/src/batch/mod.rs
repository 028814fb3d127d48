//! Fan-out/fan-in coordination: foreach item ingestion, join boundary
//! evaluation, and monotone sealing. The hardest subsystem in the engine —
//! correctness here rests entirely on the store's atomic counter arithmetic
//! and compare-and-set, never on an in-process lock.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::Value;
use uuid::Uuid;

use taskflow_shared::domain::{Boundary, JoinRuntime, JoinScope, Task, TaskRuntime, TaskStatus};
use taskflow_shared::errors::{EngineError, EngineResult};

use crate::store::{CounterDeltas, ExpectedCountUpdate, SortOrder, StoreGateway, TaskFilter, TaskMutation};
use crate::task_service::TaskService;

/// Why a boundary evaluation is (or isn't) satisfied — mirrors the five-step
/// algorithm verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryReason {
    CountMet,
    ThresholdMetWithDeadline,
    ThresholdMetWarning,
    DeadlinePassed,
    NotSatisfied,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundaryEvaluation {
    pub satisfied: bool,
    pub reason: BoundaryReason,
    pub success_percent: f64,
    /// Whether the parent should finish `completed` (true) or `failed`
    /// (false) when `satisfied` is true. Meaningless otherwise.
    pub parent_succeeds: bool,
}

/// Pure boundary evaluation over a counter snapshot, independent of the
/// store so it can be unit tested and reasoned about as P3 requires
/// (repeated evaluation on identical inputs yields identical decisions).
#[must_use]
pub fn evaluate_boundary(
    expected_count: Option<u64>,
    processed_count: u64,
    failed_count: u64,
    is_sealed: bool,
    boundary: &Boundary,
    deadline_passed: bool,
) -> BoundaryEvaluation {
    let expected = expected_count.unwrap_or(0);
    let done = processed_count + failed_count;
    let success_percent = 100.0 * (processed_count as f64) / (expected.max(1) as f64);

    if let Some(min_count) = boundary.min_count {
        if processed_count >= min_count {
            return BoundaryEvaluation {
                satisfied: true,
                reason: BoundaryReason::CountMet,
                success_percent,
                parent_succeeds: true,
            };
        }
    }

    if is_sealed && done >= expected {
        return if success_percent >= boundary.min_success_percent() {
            BoundaryEvaluation {
                satisfied: true,
                reason: BoundaryReason::ThresholdMetWithDeadline,
                success_percent,
                parent_succeeds: true,
            }
        } else {
            BoundaryEvaluation {
                satisfied: true,
                reason: BoundaryReason::ThresholdMetWarning,
                success_percent,
                parent_succeeds: !boundary.fail_on_timeout,
            }
        };
    }

    if deadline_passed {
        return BoundaryEvaluation {
            satisfied: true,
            reason: BoundaryReason::DeadlinePassed,
            success_percent,
            parent_succeeds: !boundary.fail_on_timeout,
        };
    }

    BoundaryEvaluation {
        satisfied: false,
        reason: BoundaryReason::NotSatisfied,
        success_percent,
        parent_succeeds: false,
    }
}

/// Outcome handed to whoever registered interest in a parent task's boundary
/// being satisfied — in practice, the step dispatcher.
#[derive(Debug, Clone)]
pub struct BoundaryOutcome {
    pub parent_task_id: Uuid,
    pub run_id: Uuid,
    pub workflow_step_id: String,
    pub evaluation_succeeded: bool,
    pub reason: BoundaryReason,
}

#[async_trait::async_trait]
pub trait BoundarySink: Send + Sync {
    async fn on_boundary_satisfied(&self, outcome: BoundaryOutcome) -> EngineResult<()>;
}

pub struct BatchCoordinator<S: StoreGateway> {
    store: Arc<S>,
    tasks: Arc<TaskService<S>>,
    sink: OnceCell<Arc<dyn BoundarySink>>,
}

impl<S: StoreGateway> std::fmt::Debug for BatchCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator").finish()
    }
}

impl<S: StoreGateway> BatchCoordinator<S> {
    #[must_use]
    pub fn new(store: Arc<S>, tasks: Arc<TaskService<S>>) -> Self {
        Self {
            store,
            tasks,
            sink: OnceCell::new(),
        }
    }

    pub fn set_boundary_sink(&self, sink: Arc<dyn BoundarySink>) {
        let _ = self.sink.set(sink);
    }

    /// Ingests one item into a foreach parent: creates the successor child
    /// task, bumps `receivedCount`, and tags the child with `itemKey` for
    /// idempotent redelivery. Returns `None` (no new child, no counter
    /// change) when `itemKey` matches a sibling already ingested.
    pub async fn ingest_item(
        &self,
        parent_task_id: Uuid,
        successor_builder: impl FnOnce(&Value) -> Task,
        item: Value,
        item_key: Option<&str>,
    ) -> EngineResult<Option<Task>> {
        if let Some(key) = item_key {
            if self.find_sibling_by_item_key(parent_task_id, key).await?.is_some() {
                // Idempotent redelivery: acknowledged, no new child, counters
                // unchanged.
                return Ok(None);
            }
        }

        let mut child = successor_builder(&item);
        child.parent_id = Some(parent_task_id);
        if let Some(key) = item_key {
            child.tags.push(format!("item-key:{key}"));
        }
        let child = self.tasks.create(child).await?;

        self.store
            .increment_counters(
                parent_task_id,
                CounterDeltas {
                    received: 1,
                    ..Default::default()
                },
                ExpectedCountUpdate::Unchanged,
            )
            .await?;

        Ok(Some(child))
    }

    async fn find_sibling_by_item_key(&self, parent_task_id: Uuid, key: &str) -> EngineResult<Option<Task>> {
        let tag = format!("item-key:{key}");
        let siblings = self
            .store
            .list_tasks(
                TaskFilter {
                    parent_id: Some(parent_task_id),
                    include_archived: true,
                    ..Default::default()
                },
                SortOrder::CreatedAtAsc,
            )
            .await?;
        Ok(siblings.into_iter().find(|t| t.tags.iter().any(|t| t == &tag)))
    }

    /// Applies `workflowUpdate.total`/`complete` to a foreach parent's
    /// counters. Sealing is monotone: a smaller or different total after the
    /// batch is already sealed is a `Conflict`.
    pub async fn apply_workflow_update(
        &self,
        parent_task_id: Uuid,
        total: Option<u64>,
        complete: bool,
    ) -> EngineResult<Task> {
        let current = self.store.get_task(parent_task_id).await?;
        if current.batch_counters.is_sealed {
            if let Some(total) = total {
                if Some(total) != current.batch_counters.expected_count {
                    return Err(EngineError::conflict(format!(
                        "batch {parent_task_id} already sealed at {:?}, cannot reseal to {total}",
                        current.batch_counters.expected_count
                    )));
                }
            }
            return Ok(current);
        }

        if let Some(total) = total {
            self.store
                .increment_counters(parent_task_id, CounterDeltas::default(), ExpectedCountUpdate::RaiseTo(total))
                .await?;
        }
        if complete {
            self.store
                .increment_counters(parent_task_id, CounterDeltas::default(), ExpectedCountUpdate::SealAtReceived)
                .await?;
        }
        self.store.get_task(parent_task_id).await
    }

    /// Called whenever any task reaches a terminal status. Determines which
    /// waiting foreach/join parents this completion feeds into, increments
    /// their counters, and re-evaluates the boundary for each — guarded so
    /// that only one evaluation per update ever wins.
    pub async fn on_child_terminal(&self, child: &Task) -> EngineResult<()> {
        let succeeded = child.status == TaskStatus::Completed;
        for parent_id in self.resolve_counted_parents(child).await? {
            self.store
                .increment_counters(
                    parent_id,
                    CounterDeltas {
                        processed: i64::from(succeeded),
                        failed: i64::from(!succeeded),
                        ..Default::default()
                    },
                    ExpectedCountUpdate::Unchanged,
                )
                .await?;
            self.try_finalize(parent_id, false).await?;
        }
        Ok(())
    }

    /// Invoked by the timer wheel when a join/external deadline fires.
    pub async fn on_deadline(&self, parent_task_id: Uuid) -> EngineResult<()> {
        self.try_finalize(parent_task_id, true).await
    }

    /// Re-evaluates a parent's boundary without a deadline or a fresh child
    /// completion having fired it — covers a batch sealed with zero or
    /// already-satisfied items, which otherwise never sees another trigger.
    pub async fn evaluate_now(&self, parent_task_id: Uuid) -> EngineResult<()> {
        self.try_finalize(parent_task_id, false).await
    }

    async fn resolve_counted_parents(&self, child: &Task) -> EngineResult<Vec<Uuid>> {
        let mut targets = Vec::new();

        if let Some(parent_id) = child.parent_id {
            if let Ok(parent) = self.store.get_task(parent_id).await {
                if parent.status == TaskStatus::Waiting && self.counts_direct_children(&parent) {
                    targets.push(parent_id);
                }
            }
        }

        let waiting_joins = self
            .store
            .list_tasks(
                TaskFilter {
                    run_id: Some(child.run_id),
                    status_in: vec![TaskStatus::Waiting],
                    include_archived: true,
                    ..Default::default()
                },
                SortOrder::CreatedAtAsc,
            )
            .await?;

        for candidate in waiting_joins {
            if targets.contains(&candidate.id) {
                continue;
            }
            let TaskRuntime::Join(join) = &candidate.runtime else {
                continue;
            };
            let matches = match join.scope {
                JoinScope::Children => false, // handled by the direct-parent case above
                JoinScope::StepTasks => join.await_step_id == child.workflow_step_id,
                JoinScope::Descendants => match join.await_task_id {
                    Some(ancestor) => self.is_descendant(child.id, ancestor).await?,
                    None => false,
                },
            };
            if matches {
                targets.push(candidate.id);
            }
        }

        Ok(targets)
    }

    fn counts_direct_children(&self, parent: &Task) -> bool {
        match &parent.runtime {
            TaskRuntime::None => true, // a foreach parent always counts its own children
            TaskRuntime::Join(join) => join.scope == JoinScope::Children,
            _ => false,
        }
    }

    async fn is_descendant(&self, task_id: Uuid, ancestor_id: Uuid) -> EngineResult<bool> {
        let mut current = self.store.get_task(task_id).await?;
        loop {
            match current.parent_id {
                Some(parent_id) if parent_id == ancestor_id => return Ok(true),
                Some(parent_id) => current = self.store.get_task(parent_id).await?,
                None => return Ok(false),
            }
        }
    }

    /// Gates boundary (re-)evaluation behind a `waiting -> waiting`
    /// compare-and-set so concurrent callers racing to evaluate the same
    /// parent never both win.
    async fn try_finalize(&self, parent_task_id: Uuid, deadline_passed: bool) -> EngineResult<()> {
        let claimed = self
            .store
            .atomic_transition(parent_task_id, &[TaskStatus::Waiting], TaskMutation::set_status(TaskStatus::Waiting))
            .await?;
        let Some(parent) = claimed else {
            return Ok(());
        };

        let boundary = self.boundary_for(&parent);
        let evaluation = evaluate_boundary(
            parent.batch_counters.expected_count,
            parent.batch_counters.processed_count,
            parent.batch_counters.failed_count,
            parent.batch_counters.is_sealed,
            &boundary,
            deadline_passed,
        );

        if !evaluation.satisfied {
            return Ok(());
        }

        let final_status = if evaluation.parent_succeeds {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let transitioned = self
            .store
            .atomic_transition(parent_task_id, &[TaskStatus::Waiting], TaskMutation::set_status(final_status))
            .await?;
        let Some(_) = transitioned else {
            return Ok(());
        };

        if let Some(sink) = self.sink.get() {
            sink.on_boundary_satisfied(BoundaryOutcome {
                parent_task_id,
                run_id: parent.run_id,
                workflow_step_id: parent.workflow_step_id.clone(),
                evaluation_succeeded: evaluation.parent_succeeds,
                reason: evaluation.reason,
            })
            .await?;
        }
        Ok(())
    }

    fn boundary_for(&self, parent: &Task) -> Boundary {
        match &parent.runtime {
            TaskRuntime::Join(JoinRuntime { boundary, .. }) => boundary.clone(),
            _ => Boundary::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary(min_count: Option<u64>, min_percent: Option<f64>, fail_on_timeout: bool) -> Boundary {
        Boundary {
            min_count,
            min_percent,
            max_wait_ms: None,
            fail_on_timeout,
        }
    }

    #[test]
    fn satisfied_on_min_count() {
        let eval = evaluate_boundary(Some(10), 3, 0, false, &boundary(Some(3), None, false), false);
        assert!(eval.satisfied);
        assert_eq!(eval.reason, BoundaryReason::CountMet);
    }

    #[test]
    fn sealed_full_success_satisfies_threshold() {
        let eval = evaluate_boundary(Some(3), 3, 0, true, &boundary(None, Some(100.0), false), false);
        assert!(eval.satisfied);
        assert!(eval.parent_succeeds);
        assert_eq!(eval.reason, BoundaryReason::ThresholdMetWithDeadline);
    }

    #[test]
    fn sealed_partial_failure_below_threshold_fails_parent() {
        let eval = evaluate_boundary(Some(3), 2, 1, true, &boundary(None, Some(100.0), true), false);
        assert!(eval.satisfied);
        assert!(!eval.parent_succeeds);
        assert_eq!(eval.reason, BoundaryReason::ThresholdMetWarning);
    }

    #[test]
    fn sealed_partial_failure_without_fail_on_timeout_still_completes() {
        let eval = evaluate_boundary(Some(3), 2, 1, true, &boundary(None, Some(100.0), false), false);
        assert!(eval.satisfied);
        assert!(eval.parent_succeeds);
    }

    #[test]
    fn deadline_passed_with_fail_on_timeout_fails() {
        let eval = evaluate_boundary(Some(5), 1, 0, false, &boundary(None, None, true), true);
        assert!(eval.satisfied);
        assert!(!eval.parent_succeeds);
        assert_eq!(eval.reason, BoundaryReason::DeadlinePassed);
    }

    #[test]
    fn not_satisfied_while_unsealed_and_below_count() {
        let eval = evaluate_boundary(Some(5), 1, 0, false, &boundary(Some(3), None, false), false);
        assert!(!eval.satisfied);
    }

    #[test]
    fn repeated_evaluation_is_pure() {
        let b = boundary(None, Some(50.0), false);
        let a = evaluate_boundary(Some(4), 2, 2, true, &b, false);
        let c = evaluate_boundary(Some(4), 2, 2, true, &b, false);
        assert_eq!(a.satisfied, c.satisfied);
        assert_eq!(a.reason, c.reason);
    }

    use crate::activity_log::ActivityLog;
    use crate::event_bus::EventBus;
    use crate::store::memory::InMemoryStore;
    use taskflow_shared::domain::{BatchCounters, ExecutionMode, Urgency};

    fn coordinator() -> (Arc<InMemoryStore>, Arc<TaskService<InMemoryStore>>, BatchCoordinator<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(EventBus::new());
        let activity = Arc::new(ActivityLog::new(store.clone()));
        let tasks = Arc::new(TaskService::new(store.clone(), events, activity));
        let coordinator = BatchCoordinator::new(store.clone(), tasks.clone());
        (store, tasks, coordinator)
    }

    fn waiting_parent() -> Task {
        let now = chrono::Utc::now();
        Task {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            workflow_id: "wf".into(),
            workflow_step_id: "f".into(),
            parent_id: None,
            title: "batch".into(),
            summary: None,
            status: TaskStatus::Waiting,
            execution_mode: ExecutionMode::Automated,
            urgency: Urgency::Normal,
            assignee: None,
            tags: vec![],
            batch_counters: BatchCounters::default(),
            runtime: TaskRuntime::None,
            decision_result: None,
            metadata: serde_json::json!({}),
            creator: None,
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }

    fn item_child(parent: &Task, value: &Value) -> Task {
        let now = chrono::Utc::now();
        Task {
            id: Uuid::now_v7(),
            run_id: parent.run_id,
            workflow_id: parent.workflow_id.clone(),
            workflow_step_id: "g".into(),
            parent_id: None,
            title: "item".into(),
            summary: None,
            status: TaskStatus::InProgress,
            execution_mode: ExecutionMode::Automated,
            urgency: Urgency::Normal,
            assignee: None,
            tags: vec![],
            batch_counters: BatchCounters::default(),
            runtime: TaskRuntime::None,
            decision_result: None,
            metadata: value.clone(),
            creator: None,
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }

    #[tokio::test]
    async fn ingest_item_with_same_item_key_is_idempotent() {
        let (store, tasks, batch) = coordinator();
        let parent = tasks.create(waiting_parent()).await.unwrap();

        let first = batch
            .ingest_item(parent.id, |value| item_child(&parent, value), serde_json::json!({"k": "x"}), Some("x"))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = batch
            .ingest_item(parent.id, |value| item_child(&parent, value), serde_json::json!({"k": "x"}), Some("x"))
            .await
            .unwrap();
        assert!(second.is_none());

        let reloaded = store.get_task(parent.id).await.unwrap();
        assert_eq!(reloaded.batch_counters.received_count, 1);
    }
}
