//! Join steps register a waiting task with the batch coordinator; they
//! produce no children of their own; their boundary is satisfied by
//! someone else's terminal transitions feeding into it.

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use taskflow_shared::domain::{ExecutionMode, JoinRuntime, JoinScope, StepConfig, Task, TaskRuntime, TaskStatus};
use taskflow_shared::errors::{EngineError, EngineResult};

use crate::store::{SortOrder, StoreGateway, TaskFilter, TimerEntry, TimerKind};

use super::super::{base_task, ActivationContext, Dispatcher, StepStrategy};

pub struct JoinStrategy;

#[async_trait]
impl<S: StoreGateway> StepStrategy<S> for JoinStrategy {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task> {
        let StepConfig::Join(config) = &ctx.step.config else {
            return Err(EngineError::fatal(
                "dispatcher",
                format!("step {} is not a join step", ctx.step.step_id),
            ));
        };

        // `awaitTaskId` names a step id in the static graph; resolve it to
        // the concrete task this run already materialized for that step.
        let await_task_id = if config.scope == JoinScope::Descendants {
            match &config.await_task_id {
                Some(step_id) => {
                    let candidates = dispatcher
                        .store
                        .list_tasks(
                            TaskFilter {
                                run_id: Some(ctx.run.id),
                                workflow_step_id: Some(step_id.clone()),
                                include_archived: true,
                                ..Default::default()
                            },
                            SortOrder::CreatedAtAsc,
                        )
                        .await?;
                    candidates.first().map(|t| t.id)
                }
                None => None,
            }
        } else {
            None
        };

        let deadline_at = config
            .boundary
            .max_wait_ms
            .map(|ms| chrono::Utc::now() + Duration::milliseconds(ms as i64));

        let mut task = base_task(ctx.run, ctx.step, ctx.parent_task_id, ExecutionMode::Immediate, "Join");
        task.status = TaskStatus::Waiting;
        task.metadata = ctx.input.clone();
        task.runtime = TaskRuntime::Join(JoinRuntime {
            await_step_id: config.await_step_id.clone(),
            scope: config.scope,
            boundary: config.boundary.clone(),
            await_task_id,
            deadline_at,
        });
        let task = dispatcher.tasks.create(task).await?;

        if let Some(deadline_at) = deadline_at {
            dispatcher
                .timers
                .arm(TimerEntry {
                    id: Uuid::now_v7(),
                    fire_at: deadline_at,
                    kind: TimerKind::JoinMaxWait,
                    subject_id: task.id,
                })
                .await?;
        }

        dispatcher.batch.evaluate_now(task.id).await?;
        dispatcher.store.get_task(task.id).await
    }
}
