//! Lifecycle of workflow runs: create, advance, finalize.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::Value;
use uuid::Uuid;

use taskflow_shared::domain::{
    ActorType, ExecutionMode, ExecutionOptions, Run, RunStatus, Task, TaskDefaults, TaskStatus,
};
use taskflow_shared::errors::{EngineError, EngineResult};

use crate::dispatcher::{base_task, Dispatcher};
use crate::event_bus::EventBus;
use crate::store::{RunFilter, RunMutation, StoreGateway, TaskFilter};
use crate::task_service::TaskService;

/// The narrow surface the dispatcher needs from the run registry, kept as a
/// trait so the two can reference each other without a generic cycle.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get(&self, run_id: Uuid) -> EngineResult<Run>;
    async fn note_step_active(&self, run_id: Uuid, step_id: &str) -> EngineResult<()>;
    async fn note_step_completed(&self, run_id: Uuid, step_id: &str) -> EngineResult<()>;
    async fn fail_run(&self, run_id: Uuid, step_id: &str) -> EngineResult<()>;
    async fn mark_completed(&self, run_id: Uuid) -> EngineResult<()>;
    async fn mark_failed(&self, run_id: Uuid) -> EngineResult<()>;
    /// Starts a nested run on behalf of a subflow task: the trigger step's
    /// root task becomes a child of `parent_task_id` instead of a fresh
    /// root, and the run's terminal status later mirrors onto that task.
    async fn start_nested(&self, workflow_id: &str, input: Value, parent_task_id: Uuid) -> EngineResult<Run>;
}

pub struct RunRegistry<S: StoreGateway> {
    store: Arc<S>,
    events: Arc<EventBus>,
    tasks: Arc<TaskService<S>>,
    dispatcher: OnceCell<Arc<Dispatcher<S>>>,
}

impl<S: StoreGateway> std::fmt::Debug for RunRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry").finish()
    }
}

fn run_payload(run: &Run) -> Value {
    serde_json::to_value(run).unwrap_or(Value::Null)
}

impl<S: StoreGateway> RunRegistry<S> {
    #[must_use]
    pub fn new(store: Arc<S>, events: Arc<EventBus>, tasks: Arc<TaskService<S>>) -> Self {
        Self {
            store,
            events,
            tasks,
            dispatcher: OnceCell::new(),
        }
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<Dispatcher<S>>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    fn dispatcher(&self) -> EngineResult<&Arc<Dispatcher<S>>> {
        self.dispatcher
            .get()
            .ok_or_else(|| EngineError::fatal("run_registry", "dispatcher not wired"))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn start_workflow(
        &self,
        workflow_id: impl Into<String>,
        input: Value,
        task_defaults: TaskDefaults,
        options: ExecutionOptions,
        external_id: Option<String>,
    ) -> EngineResult<(Run, Task)> {
        let workflow_id = workflow_id.into();
        let workflow = self.store.get_workflow(&workflow_id).await?;
        let trigger = workflow
            .trigger_step()
            .ok_or_else(|| EngineError::fatal("run_registry", "workflow has no trigger step"))?
            .clone();

        let run = Run::new(
            workflow_id,
            workflow.version,
            input.clone(),
            task_defaults,
            options,
            external_id,
            chrono::Utc::now(),
        );
        let run = self.store.insert_run(run).await?;

        let title = workflow
            .root_task_title_template
            .clone()
            .unwrap_or_else(|| workflow.name.clone());
        let mut root_task = base_task(&run, &trigger, None, ExecutionMode::Immediate, title);
        root_task.workflow_step_id = "__root__".into();
        root_task.status = TaskStatus::Waiting;
        let root_task = self.tasks.create(root_task).await?;

        self.events.publish("workflow.run.created", run.id.to_string(), run_payload(&run), vec![]);

        let run = self
            .store
            .update_run(run.id, RunMutation::new(|r| r.status = RunStatus::Running))
            .await?;
        self.events
            .publish("workflow.run.started", run.id.to_string(), run_payload(&run), vec![]);

        self.dispatcher()?
            .activate_step(&run, &trigger, Some(root_task.id), input)
            .await?;

        let run = self.store.get_run(run.id).await?;
        Ok((run, root_task))
    }

    async fn start_nested_internal(&self, workflow_id: &str, input: Value, parent_task_id: Uuid) -> EngineResult<Run> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let trigger = workflow
            .trigger_step()
            .ok_or_else(|| EngineError::fatal("run_registry", "workflow has no trigger step"))?
            .clone();

        let run = Run::new(
            workflow_id,
            workflow.version,
            input.clone(),
            TaskDefaults::default(),
            ExecutionOptions::default(),
            None,
            chrono::Utc::now(),
        )
        .with_spawned_by(parent_task_id);
        let run = self.store.insert_run(run).await?;
        self.events.publish("workflow.run.created", run.id.to_string(), run_payload(&run), vec![]);

        let run = self
            .store
            .update_run(run.id, RunMutation::new(|r| r.status = RunStatus::Running))
            .await?;
        self.events
            .publish("workflow.run.started", run.id.to_string(), run_payload(&run), vec![]);

        self.dispatcher()?
            .activate_step(&run, &trigger, Some(parent_task_id), input)
            .await?;

        self.store.get_run(run.id).await
    }

    pub async fn cancel_run(&self, run_id: Uuid, actor: Option<String>) -> EngineResult<Run> {
        let run = self.store.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let run = self
            .store
            .update_run(run_id, RunMutation::new(|r| r.status = RunStatus::Cancelled))
            .await?;

        let descendants = self
            .tasks
            .list(
                TaskFilter {
                    run_id: Some(run_id),
                    include_archived: true,
                    ..Default::default()
                },
                crate::store::SortOrder::CreatedAtAsc,
            )
            .await?;
        for task in descendants {
            if task.status.is_terminal() {
                continue;
            }
            // Idempotent: a task another caller already moved out of its
            // prior status simply fails this CAS, which is fine here.
            let _ = self
                .tasks
                .transition(
                    task.id,
                    &[TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Waiting, TaskStatus::OnHold],
                    TaskStatus::Cancelled,
                    ActorType::System,
                    actor.clone(),
                    |_| {},
                )
                .await;
        }

        self.events
            .publish("workflow.run.cancelled", run.id.to_string(), run_payload(&run), vec![]);
        Ok(run)
    }

    pub async fn list_runs(&self, filter: RunFilter) -> EngineResult<(Vec<Run>, usize)> {
        self.store.list_runs(filter).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> EngineResult<Run> {
        self.store.get_run(run_id).await
    }
}

#[async_trait]
impl<S: StoreGateway> RunStore for RunRegistry<S> {
    async fn get(&self, run_id: Uuid) -> EngineResult<Run> {
        self.store.get_run(run_id).await
    }

    async fn note_step_active(&self, run_id: Uuid, step_id: &str) -> EngineResult<()> {
        let step_id = step_id.to_string();
        let run = self
            .store
            .update_run(run_id, RunMutation::new(move |r| {
                if !r.current_step_ids.iter().any(|s| s == &step_id) {
                    r.current_step_ids.push(step_id);
                }
            }))
            .await?;
        self.events.publish(
            "workflow.run.step.started",
            run.id.to_string(),
            run_payload(&run),
            vec![],
        );
        Ok(())
    }

    async fn note_step_completed(&self, run_id: Uuid, step_id: &str) -> EngineResult<()> {
        let step_id_owned = step_id.to_string();
        let run = self
            .store
            .update_run(run_id, RunMutation::new(move |r| {
                r.current_step_ids.retain(|s| s != &step_id_owned);
                if !r.completed_step_ids.iter().any(|s| s == &step_id_owned) {
                    r.completed_step_ids.push(step_id_owned);
                }
            }))
            .await?;
        self.events.publish(
            "workflow.run.step.completed",
            run.id.to_string(),
            run_payload(&run),
            vec![],
        );
        Ok(())
    }

    async fn fail_run(&self, run_id: Uuid, step_id: &str) -> EngineResult<()> {
        let step_id = step_id.to_string();
        let run = self
            .store
            .update_run(run_id, RunMutation::new(move |r| {
                if r.failed_step_id.is_none() {
                    r.failed_step_id = Some(step_id.clone());
                    r.error_message = Some(format!("step {step_id} failed"));
                }
            }))
            .await?;
        self.events
            .publish("workflow.run.step.failed", run.id.to_string(), run_payload(&run), vec![]);
        Ok(())
    }

    async fn mark_completed(&self, run_id: Uuid) -> EngineResult<()> {
        let run = self
            .store
            .update_run(run_id, RunMutation::new(|r| r.status = RunStatus::Completed))
            .await?;
        self.events
            .publish("workflow.run.completed", run.id.to_string(), run_payload(&run), vec![]);
        self.mirror_to_spawning_task(&run, TaskStatus::Completed).await
    }

    async fn mark_failed(&self, run_id: Uuid) -> EngineResult<()> {
        let run = self
            .store
            .update_run(run_id, RunMutation::new(|r| r.status = RunStatus::Failed))
            .await?;
        self.events
            .publish("workflow.run.failed", run.id.to_string(), run_payload(&run), vec![]);
        self.mirror_to_spawning_task(&run, TaskStatus::Failed).await
    }

    async fn start_nested(&self, workflow_id: &str, input: Value, parent_task_id: Uuid) -> EngineResult<Run> {
        self.start_nested_internal(workflow_id, input, parent_task_id).await
    }
}

impl<S: StoreGateway> RunRegistry<S> {
    /// Mirrors a subflow run's terminal status onto the task that spawned
    /// it. The resulting task transition runs through the normal terminal
    /// hook, so the subflow step's own `onCompletion` fires from there.
    async fn mirror_to_spawning_task(&self, run: &Run, status: TaskStatus) -> EngineResult<()> {
        let Some(parent_task_id) = run.spawned_by_task_id else {
            return Ok(());
        };
        let _ = self
            .tasks
            .transition(parent_task_id, &[TaskStatus::Waiting], status, ActorType::System, None, |_| {})
            .await;
        Ok(())
    }
}
