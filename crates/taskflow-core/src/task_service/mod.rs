//! CRUD over tasks, hierarchy traversal, and the parent-rollup hook that
//! lets the batch coordinator learn about child terminal transitions
//! without the task service depending on it directly.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::Value;
use uuid::Uuid;

use taskflow_shared::domain::{ActivityEventType, ActorType, FieldChange, Task, TaskStatus};
use taskflow_shared::errors::{EngineError, EngineResult};

use crate::activity_log::ActivityLog;
use crate::event_bus::{EventBus, EventFieldChange};
use crate::store::{SortOrder, StoreGateway, TaskFilter, TaskMutation};

/// Notified once a task reaches a terminal status, so fan-out/fan-in
/// accounting can react without this module knowing batch coordination
/// exists.
#[async_trait]
pub trait TerminalHook: Send + Sync {
    async fn on_task_terminal(&self, task: &Task) -> EngineResult<()>;
}

/// A bounded-depth view of a task and its descendants.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskTreeNode {
    pub task: Task,
    pub children: Vec<TaskTreeNode>,
}

pub struct TaskService<S: StoreGateway> {
    store: Arc<S>,
    events: Arc<EventBus>,
    activity: Arc<ActivityLog<S>>,
    terminal_hook: OnceCell<Arc<dyn TerminalHook>>,
}

impl<S: StoreGateway> std::fmt::Debug for TaskService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService").finish()
    }
}

fn task_payload(task: &Task) -> Value {
    serde_json::to_value(task).unwrap_or(Value::Null)
}

impl<S: StoreGateway> TaskService<S> {
    #[must_use]
    pub fn new(store: Arc<S>, events: Arc<EventBus>, activity: Arc<ActivityLog<S>>) -> Self {
        Self {
            store,
            events,
            activity,
            terminal_hook: OnceCell::new(),
        }
    }

    /// Wires the batch coordinator (or any other interested party) in.
    /// Wiring happens once, at engine construction time.
    pub fn set_terminal_hook(&self, hook: Arc<dyn TerminalHook>) {
        let _ = self.terminal_hook.set(hook);
    }

    pub async fn create(&self, task: Task) -> EngineResult<Task> {
        let task = self.store.insert_task(task).await?;
        self.activity
            .record(task.id, ActivityEventType::Created, ActorType::System, None, vec![])
            .await?;
        self.events
            .publish("task.created", task.id.to_string(), task_payload(&task), vec![]);
        Ok(task)
    }

    /// Transitions a task's status under a CAS guard. Returns `Conflict` if
    /// `from` doesn't match the task's current status.
    pub async fn transition(
        &self,
        task_id: Uuid,
        from: &[TaskStatus],
        new_status: TaskStatus,
        actor_type: ActorType,
        actor_id: Option<String>,
        mutation: impl FnOnce(&mut Task) + Send + 'static,
    ) -> EngineResult<Task> {
        let previous = self.store.get_task(task_id).await?.status;
        let updated = self
            .store
            .atomic_transition(
                task_id,
                from,
                TaskMutation::new(move |task| {
                    task.status = new_status;
                    mutation(task);
                }),
            )
            .await?
            .ok_or_else(|| {
                EngineError::conflict(format!(
                    "task {task_id} is not in an allowed predecessor status for this transition"
                ))
            })?;

        let change = FieldChange {
            field: "status".into(),
            old_value: Some(serde_json::json!(previous)),
            new_value: Some(serde_json::json!(new_status)),
        };
        self.activity
            .record(
                task_id,
                ActivityEventType::StatusChanged,
                actor_type,
                actor_id,
                vec![change.clone()],
            )
            .await?;
        self.events.publish(
            "task.status.changed",
            task_id.to_string(),
            task_payload(&updated),
            vec![EventFieldChange {
                field: change.field,
                old_value: change.old_value,
                new_value: change.new_value,
            }],
        );

        if new_status.is_terminal() {
            if let Some(hook) = self.terminal_hook.get() {
                hook.on_task_terminal(&updated).await?;
            }
        }
        Ok(updated)
    }

    /// Non-status field update (assignee, tags, metadata). Applied under the
    /// same CAS discipline, keyed off the task's current status so a
    /// concurrent status transition can't silently race with it.
    pub async fn update_fields(
        &self,
        task_id: Uuid,
        actor_type: ActorType,
        actor_id: Option<String>,
        changes: Vec<FieldChange>,
        mutation: impl FnOnce(&mut Task) + Send + 'static,
    ) -> EngineResult<Task> {
        let current_status = self.store.get_task(task_id).await?.status;
        let updated = self
            .store
            .atomic_transition(task_id, &[current_status], TaskMutation::new(mutation))
            .await?
            .ok_or_else(|| {
                EngineError::conflict(format!("task {task_id} changed concurrently, retry"))
            })?;

        self.activity
            .record(task_id, ActivityEventType::Updated, actor_type, actor_id, changes.clone())
            .await?;
        self.events.publish(
            "task.updated",
            task_id.to_string(),
            task_payload(&updated),
            changes
                .into_iter()
                .map(|c| EventFieldChange {
                    field: c.field,
                    old_value: c.old_value,
                    new_value: c.new_value,
                })
                .collect(),
        );
        Ok(updated)
    }

    /// Soft-delete: sets `archived`, excluding the task from default
    /// listings without erasing its history.
    pub async fn archive(&self, task_id: Uuid) -> EngineResult<Task> {
        let updated = self
            .update_fields(
                task_id,
                ActorType::System,
                None,
                vec![FieldChange {
                    field: "archived".into(),
                    old_value: Some(serde_json::json!(false)),
                    new_value: Some(serde_json::json!(true)),
                }],
                |task| task.archived = true,
            )
            .await?;
        self.events
            .publish("task.deleted", task_id.to_string(), task_payload(&updated), vec![]);
        Ok(updated)
    }

    pub async fn get(&self, task_id: Uuid) -> EngineResult<Task> {
        self.store.get_task(task_id).await
    }

    pub async fn list(&self, filter: TaskFilter, sort: SortOrder) -> EngineResult<Vec<Task>> {
        self.store.list_tasks(filter, sort).await
    }

    pub async fn children(&self, task_id: Uuid) -> EngineResult<Vec<Task>> {
        self.store
            .list_tasks(
                TaskFilter {
                    parent_id: Some(task_id),
                    ..Default::default()
                },
                SortOrder::CreatedAtAsc,
            )
            .await
    }

    pub async fn get_with_children(&self, task_id: Uuid) -> EngineResult<(Task, Vec<Task>)> {
        let task = self.get(task_id).await?;
        let children = self.children(task_id).await?;
        Ok((task, children))
    }

    /// Depth-bounded tree rooted at `task_id`. `max_depth == 0` returns only
    /// the root with no children expanded.
    pub async fn build_tree(&self, task_id: Uuid, max_depth: u32) -> EngineResult<TaskTreeNode> {
        let task = self.get(task_id).await?;
        let children = if max_depth == 0 {
            Vec::new()
        } else {
            let mut nodes = Vec::new();
            for child in self.children(task_id).await? {
                nodes.push(Box::pin(self.build_tree(child.id, max_depth - 1)).await?);
            }
            nodes
        };
        Ok(TaskTreeNode { task, children })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use taskflow_shared::domain::{BatchCounters, ExecutionMode, TaskRuntime, Urgency};

    fn sample_task() -> Task {
        let now = chrono::Utc::now();
        Task {
            id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            workflow_id: "wf".into(),
            workflow_step_id: "a".into(),
            parent_id: None,
            title: "t".into(),
            summary: None,
            status: TaskStatus::Pending,
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

    fn service() -> TaskService<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(EventBus::new());
        let activity = Arc::new(ActivityLog::new(store.clone()));
        TaskService::new(store, events, activity)
    }

    #[tokio::test]
    async fn create_then_transition_appends_activity() {
        let service = service();
        let task = service.create(sample_task()).await.unwrap();

        let updated = service
            .transition(
                task.id,
                &[TaskStatus::Pending],
                TaskStatus::InProgress,
                ActorType::System,
                None,
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);

        let history = service.activity.history(task.id).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn transition_with_wrong_predecessor_is_conflict() {
        let service = service();
        let task = service.create(sample_task()).await.unwrap();

        let result = service
            .transition(
                task.id,
                &[TaskStatus::InProgress],
                TaskStatus::Completed,
                ActorType::System,
                None,
                |_| {},
            )
            .await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn archive_excludes_from_default_listing() {
        let service = service();
        let task = service.create(sample_task()).await.unwrap();
        service.archive(task.id).await.unwrap();

        let listed = service
            .list(TaskFilter::default(), SortOrder::CreatedAtAsc)
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn build_tree_respects_depth_bound() {
        let service = service();
        let root = service.create(sample_task()).await.unwrap();
        let mut child = sample_task();
        child.parent_id = Some(root.id);
        service.create(child).await.unwrap();

        let tree = service.build_tree(root.id, 0).await.unwrap();
        assert!(tree.children.is_empty());

        let tree = service.build_tree(root.id, 5).await.unwrap();
        assert_eq!(tree.children.len(), 1);
    }
}
