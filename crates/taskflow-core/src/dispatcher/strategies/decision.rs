//! Decision steps evaluate their outgoing connections' conditions against
//! `{input, output}` in declared order and complete immediately, recording
//! the chosen target as `decisionResult`.

use async_trait::async_trait;
use serde_json::Value;

use taskflow_shared::domain::{ExecutionMode, Task, TaskStatus};
use taskflow_shared::errors::EngineResult;

use crate::store::StoreGateway;

use super::super::{base_task, ActivationContext, Dispatcher, StepStrategy};

/// Evaluates a connection's opaque condition string. The engine never
/// interprets conditions itself; this is the pluggable seam a deployment
/// can replace with a richer expression language.
pub trait ConditionEvaluator: Send + Sync + std::fmt::Debug {
    fn evaluate(&self, condition: &str, input: &Value, output: &Value) -> bool;
}

/// Dot-path truthiness / equality evaluator: `"output.status"` is truthy if
/// that path resolves to a non-empty, non-zero, non-null value;
/// `"output.status == approved"` compares the resolved value's string form.
#[derive(Debug, Default)]
pub struct DefaultConditionEvaluator;

impl ConditionEvaluator for DefaultConditionEvaluator {
    fn evaluate(&self, condition: &str, input: &Value, output: &Value) -> bool {
        let scope = serde_json::json!({ "input": input, "output": output });
        if let Some((path, expected)) = condition.split_once("==") {
            let resolved = super::resolve_path(&scope, path.trim());
            let expected = expected.trim().trim_matches('"');
            return resolved.map(|v| scalar_string(&v) == expected).unwrap_or(false);
        }
        super::resolve_path(&scope, condition.trim())
            .map(|v| super::is_truthy(&v))
            .unwrap_or(false)
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct DecisionStrategy;

#[async_trait]
impl<S: StoreGateway> StepStrategy<S> for DecisionStrategy {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task> {
        let chosen = ctx
            .step
            .connections
            .iter()
            .find(|c| {
                c.condition
                    .as_deref()
                    .map(|cond| dispatcher.evaluator.evaluate(cond, &ctx.input, &ctx.input))
                    .unwrap_or(false)
            })
            .map(|c| c.target_step_id.clone())
            .or_else(|| ctx.step.default_connection.clone());

        let mut task = base_task(ctx.run, ctx.step, ctx.parent_task_id, ExecutionMode::Immediate, "Decision");
        task.status = TaskStatus::Completed;
        task.metadata = ctx.input.clone();
        task.decision_result = chosen.clone();
        let task = dispatcher.tasks.create(task).await?;
        dispatcher
            .complete_step(ctx.run.id, &ctx.step.step_id, true, chosen.as_deref(), &task.metadata)
            .await?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_path_condition_is_truthy_when_nonempty() {
        let evaluator = DefaultConditionEvaluator;
        let output = serde_json::json!({"status": "approved"});
        assert!(evaluator.evaluate("output.status", &Value::Null, &output));
    }

    #[test]
    fn equality_condition_compares_scalar_form() {
        let evaluator = DefaultConditionEvaluator;
        let output = serde_json::json!({"status": "approved"});
        assert!(evaluator.evaluate("output.status == approved", &Value::Null, &output));
        assert!(!evaluator.evaluate("output.status == rejected", &Value::Null, &output));
    }

    #[test]
    fn missing_path_is_not_truthy() {
        let evaluator = DefaultConditionEvaluator;
        assert!(!evaluator.evaluate("output.missing", &Value::Null, &serde_json::json!({})));
    }
}
