//! Foreach steps fan out one child task per item, either drawn synchronously
//! from the input payload or arriving later as streaming callbacks.

use async_trait::async_trait;
use serde_json::Value;

use taskflow_shared::domain::{BatchCounters, ExecutionMode, ItemsSource, StepConfig, StepKind, Task, TaskStatus};
use taskflow_shared::errors::{EngineError, EngineResult};

use crate::store::StoreGateway;

use super::super::{base_task, ActivationContext, Dispatcher, StepStrategy};
use super::resolve_path;

pub struct ForeachStrategy;

#[async_trait]
impl<S: StoreGateway> StepStrategy<S> for ForeachStrategy {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task> {
        let StepConfig::Foreach(config) = &ctx.step.config else {
            return Err(EngineError::fatal(
                "dispatcher",
                format!("step {} is not a foreach step", ctx.step.step_id),
            ));
        };

        let mut parent = base_task(ctx.run, ctx.step, ctx.parent_task_id, ExecutionMode::Immediate, "Foreach batch");
        parent.status = TaskStatus::Waiting;
        parent.metadata = ctx.input.clone();
        parent.batch_counters = BatchCounters::default();
        let parent = dispatcher.tasks.create(parent).await?;

        if config.items_source != ItemsSource::Payload {
            return Ok(parent);
        }

        let items = extract_items(&ctx.input, config.items_path.as_deref(), config.max_items);
        let total = items.len() as u64;

        if let Some(successor_step_id) = ctx.step.connections.iter().find(|c| c.is_unconditional()) {
            let workflow = dispatcher.store.get_workflow(&ctx.run.workflow_id).await?;
            let successor = workflow
                .step(&successor_step_id.target_step_id)
                .ok_or_else(|| {
                    EngineError::fatal(
                        "dispatcher",
                        format!("unknown foreach successor {}", successor_step_id.target_step_id),
                    )
                })?
                .clone();
            let run = ctx.run;
            let parent_id = parent.id;

            for item in items {
                let successor = successor.clone();
                dispatcher
                    .batch
                    .ingest_item(parent_id, move |value| build_item_child(run, &successor, parent_id, value), item, None)
                    .await?;
            }
        }

        dispatcher.batch.apply_workflow_update(parent.id, Some(total), true).await?;
        dispatcher.batch.evaluate_now(parent.id).await?;
        dispatcher.store.get_task(parent.id).await
    }
}

/// Builds one fan-out child task for `successor`, tagging it with the raw
/// item value. Shared between synchronous payload-sourced fan-out and
/// items streamed in later through the callback ingress.
pub(crate) fn build_item_child(
    run: &taskflow_shared::domain::Run,
    successor: &taskflow_shared::domain::Step,
    parent_id: uuid::Uuid,
    value: &Value,
) -> Task {
    let mut child = base_task(run, successor, Some(parent_id), item_execution_mode(successor.kind()), "Foreach item");
    child.status = item_initial_status(successor.kind());
    child.metadata = serde_json::json!({ "_item": value });
    child
}

fn item_execution_mode(kind: StepKind) -> ExecutionMode {
    match kind {
        StepKind::Agent => ExecutionMode::Automated,
        StepKind::Manual => ExecutionMode::Manual,
        StepKind::External => ExecutionMode::ExternalCallback,
        _ => ExecutionMode::Immediate,
    }
}

fn item_initial_status(kind: StepKind) -> TaskStatus {
    match kind {
        StepKind::Agent | StepKind::Manual => TaskStatus::InProgress,
        StepKind::External | StepKind::Join => TaskStatus::Waiting,
        _ => TaskStatus::Pending,
    }
}

fn extract_items(input: &Value, items_path: Option<&str>, max_items: Option<u32>) -> Vec<Value> {
    let raw = match items_path {
        Some(path) => resolve_path(input, path).unwrap_or(Value::Null),
        None => input.clone(),
    };
    let mut items: Vec<Value> = match raw {
        Value::Array(arr) => arr,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    if let Some(max) = max_items {
        items.truncate(max as usize);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_items_draws_from_path_and_bounds_count() {
        let input = serde_json::json!({"rows": [1, 2, 3, 4]});
        let items = extract_items(&input, Some("rows"), Some(2));
        assert_eq!(items, vec![serde_json::json!(1), serde_json::json!(2)]);
    }

    #[test]
    fn extract_items_wraps_non_array_payload() {
        let input = serde_json::json!({"single": true});
        let items = extract_items(&input, None, None);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn extract_items_empty_when_path_missing() {
        let input = serde_json::json!({});
        let items = extract_items(&input, Some("rows"), None);
        assert!(items.is_empty());
    }
}
