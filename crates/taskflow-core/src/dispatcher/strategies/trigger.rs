//! Trigger steps activate and complete in the same beat, forwarding
//! straight to their single outgoing connection.

use async_trait::async_trait;

use taskflow_shared::domain::{ExecutionMode, Task, TaskStatus};
use taskflow_shared::errors::EngineResult;

use crate::store::StoreGateway;

use super::super::{base_task, ActivationContext, Dispatcher, StepStrategy};

pub struct TriggerStrategy;

#[async_trait]
impl<S: StoreGateway> StepStrategy<S> for TriggerStrategy {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task> {
        let mut task = base_task(ctx.run, ctx.step, ctx.parent_task_id, ExecutionMode::Immediate, "Trigger");
        task.status = TaskStatus::Completed;
        task.metadata = ctx.input.clone();
        let task = dispatcher.tasks.create(task).await?;
        dispatcher
            .complete_step(ctx.run.id, &ctx.step.step_id, true, None, &task.metadata)
            .await?;
        Ok(task)
    }
}
