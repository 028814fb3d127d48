//! Manual steps are identical to agent steps except for the surfaced
//! execution mode: completion is driven by a human actor via the task API.

use async_trait::async_trait;

use taskflow_shared::domain::{ExecutionMode, Task, TaskStatus};
use taskflow_shared::errors::EngineResult;

use crate::store::StoreGateway;

use super::super::{base_task, ActivationContext, Dispatcher, StepStrategy};

pub struct ManualStrategy;

#[async_trait]
impl<S: StoreGateway> StepStrategy<S> for ManualStrategy {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task> {
        let mut task = base_task(ctx.run, ctx.step, ctx.parent_task_id, ExecutionMode::Manual, "Manual review");
        task.status = TaskStatus::InProgress;
        task.metadata = ctx.input.clone();
        dispatcher.tasks.create(task).await
    }
}
