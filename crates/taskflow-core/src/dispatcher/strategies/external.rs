//! External steps wait for one or more out-of-band callbacks to arrive
//! through the callback ingress before the step is considered complete.

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use taskflow_shared::domain::{ExecutionMode, ExternalRuntime, StepConfig, Task, TaskRuntime, TaskStatus};
use taskflow_shared::errors::{EngineError, EngineResult};

use crate::store::{StoreGateway, TaskMutation, TimerEntry, TimerKind};

use super::super::{base_task, ActivationContext, Dispatcher, StepStrategy};

pub struct ExternalStrategy;

#[async_trait]
impl<S: StoreGateway> StepStrategy<S> for ExternalStrategy {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task> {
        let StepConfig::External(config) = &ctx.step.config else {
            return Err(EngineError::fatal(
                "dispatcher",
                format!("step {} is not an external step", ctx.step.step_id),
            ));
        };

        let timeout_at = config.timeout_ms.map(|ms| chrono::Utc::now() + Duration::milliseconds(ms as i64));

        let mut task = base_task(ctx.run, ctx.step, ctx.parent_task_id, ExecutionMode::ExternalCallback, "Awaiting callback");
        task.status = TaskStatus::Waiting;
        task.metadata = ctx.input.clone();
        task.runtime = TaskRuntime::External(ExternalRuntime {
            expected_callbacks: config.expected_callbacks,
            received_callbacks: 0,
            timeout_at,
        });
        let task = dispatcher.tasks.create(task).await?;

        if let Some(timeout_at) = timeout_at {
            dispatcher
                .timers
                .arm(TimerEntry {
                    id: Uuid::now_v7(),
                    fire_at: timeout_at,
                    kind: TimerKind::ExternalTimeout,
                    subject_id: task.id,
                })
                .await?;
        }

        Ok(task)
    }
}

impl ExternalStrategy {
    /// Invoked by the timer wheel when an external step's own deadline
    /// passes. A declared timeout that elapses before enough callbacks
    /// arrived always fails the task; there is no success outcome for an
    /// external step reaching its own deadline, unlike a join's boundary,
    /// which a default-succeeding evaluation would otherwise imply.
    pub async fn on_timeout<S: StoreGateway>(dispatcher: &Dispatcher<S>, task_id: Uuid) -> EngineResult<()> {
        let task = dispatcher.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(());
        }
        let TaskRuntime::External(ext) = &task.runtime else {
            return Err(EngineError::fatal("dispatcher", "external timeout fired for a non-external task"));
        };
        if ext.received_callbacks >= ext.expected_callbacks {
            return Ok(());
        }

        let updated = dispatcher
            .store
            .atomic_transition(task_id, &[TaskStatus::Waiting], TaskMutation::set_status(TaskStatus::Failed))
            .await?;
        if let Some(updated) = updated {
            dispatcher
                .complete_step(updated.run_id, &updated.workflow_step_id, false, None, &updated.metadata)
                .await?;
        }
        Ok(())
    }
}
