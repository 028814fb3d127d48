//! Subflow steps spawn a nested run and leave their task waiting until the
//! child run reaches a terminal status, at which point the task mirrors it
//! via `RunRegistry::mark_completed`/`mark_failed` and the ordinary
//! terminal-hook path takes it from there.

use async_trait::async_trait;
use serde_json::Value;

use taskflow_shared::domain::{ExecutionMode, StepConfig, Task, TaskStatus};
use taskflow_shared::errors::{EngineError, EngineResult};

use crate::store::StoreGateway;

use super::super::{base_task, ActivationContext, Dispatcher, StepStrategy};
use super::resolve_path;

pub struct SubflowStrategy;

#[async_trait]
impl<S: StoreGateway> StepStrategy<S> for SubflowStrategy {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task> {
        let StepConfig::Subflow(config) = &ctx.step.config else {
            return Err(EngineError::fatal(
                "dispatcher",
                format!("step {} is not a subflow step", ctx.step.step_id),
            ));
        };

        let mut task = base_task(ctx.run, ctx.step, ctx.parent_task_id, ExecutionMode::Immediate, "Subflow");
        task.status = TaskStatus::Waiting;
        task.metadata = ctx.input.clone();
        let task = dispatcher.tasks.create(task).await?;

        let mapped_input = apply_input_mapping(&config.input_mapping, &ctx.input);
        dispatcher.runs.start_nested(&config.workflow_id, mapped_input, task.id).await?;

        Ok(task)
    }
}

/// Builds the child run's input from `mapping`. An empty/null mapping
/// passes the parent payload through unchanged; an object maps each key to
/// a dot-path resolved against `{input: <parent payload>}`; any other
/// scalar is used verbatim as a literal.
fn apply_input_mapping(mapping: &Value, input: &Value) -> Value {
    match mapping {
        Value::Null => input.clone(),
        Value::Object(fields) if fields.is_empty() => input.clone(),
        Value::Object(fields) => {
            let scope = serde_json::json!({ "input": input });
            let mut mapped = serde_json::Map::with_capacity(fields.len());
            for (key, source) in fields {
                let value = match source {
                    Value::String(path) => resolve_path(&scope, path).unwrap_or(Value::Null),
                    other => other.clone(),
                };
                mapped.insert(key.clone(), value);
            }
            Value::Object(mapped)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mapping_passes_payload_through() {
        let input = serde_json::json!({"a": 1});
        assert_eq!(apply_input_mapping(&Value::Null, &input), input);
        assert_eq!(apply_input_mapping(&serde_json::json!({}), &input), input);
    }

    #[test]
    fn object_mapping_resolves_dot_paths_against_input() {
        let input = serde_json::json!({"order": {"id": "o-1"}});
        let mapping = serde_json::json!({"orderId": "input.order.id", "fixed": 7});
        let mapped = apply_input_mapping(&mapping, &input);
        assert_eq!(mapped, serde_json::json!({"orderId": "o-1", "fixed": 7}));
    }
}
