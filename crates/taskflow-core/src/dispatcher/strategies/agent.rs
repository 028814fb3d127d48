//! Agent steps hand off to an external worker: the engine creates the task
//! and does nothing further until that worker reports completion through
//! the task API.

use async_trait::async_trait;

use taskflow_shared::domain::{ExecutionMode, Task, TaskStatus};
use taskflow_shared::errors::EngineResult;

use crate::store::StoreGateway;

use super::super::{base_task, ActivationContext, Dispatcher, StepStrategy};

pub struct AgentStrategy;

#[async_trait]
impl<S: StoreGateway> StepStrategy<S> for AgentStrategy {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task> {
        let mut task = base_task(ctx.run, ctx.step, ctx.parent_task_id, ExecutionMode::Automated, "Agent task");
        task.status = TaskStatus::InProgress;
        task.metadata = ctx.input.clone();
        dispatcher.tasks.create(task).await
    }
}
