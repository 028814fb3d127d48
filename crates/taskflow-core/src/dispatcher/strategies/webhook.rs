//! Webhook steps perform one outbound HTTP call per attempt, with template
//! rendering and exponential backoff retries scheduled on the timer wheel
//! so the run loop never blocks on network latency.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use uuid::Uuid;

use taskflow_shared::domain::{
    ExecutionMode, StepConfig, Task, TaskRuntime, TaskStatus, WebhookAttempt, WebhookRuntime,
};
use taskflow_shared::errors::{EngineError, EngineResult};

use crate::store::{StoreGateway, TaskMutation, TimerEntry, TimerKind};

use super::super::{base_task, ActivationContext, Dispatcher, StepStrategy};
use super::resolve_path;

pub struct WebhookStrategy;

#[async_trait]
impl<S: StoreGateway> StepStrategy<S> for WebhookStrategy {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task> {
        let StepConfig::Webhook(_) = &ctx.step.config else {
            return Err(EngineError::fatal(
                "dispatcher",
                format!("step {} is not a webhook step", ctx.step.step_id),
            ));
        };

        let mut task = base_task(ctx.run, ctx.step, ctx.parent_task_id, ExecutionMode::Automated, "Webhook");
        task.status = TaskStatus::InProgress;
        task.metadata = ctx.input.clone();
        task.runtime = TaskRuntime::Webhook(WebhookRuntime::default());
        let task = dispatcher.tasks.create(task).await?;

        dispatcher
            .timers
            .arm(TimerEntry {
                id: Uuid::now_v7(),
                fire_at: Utc::now(),
                kind: TimerKind::WebhookRetry,
                subject_id: task.id,
            })
            .await?;
        Ok(task)
    }
}

impl WebhookStrategy {
    /// Performs one outbound attempt. Called by the timer wheel, whether
    /// for the first attempt or a backed-off retry.
    pub async fn retry<S: StoreGateway>(dispatcher: &Dispatcher<S>, task_id: Uuid) -> EngineResult<()> {
        let task = dispatcher.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(());
        }
        let run = dispatcher.store.get_run(task.run_id).await?;
        let workflow = dispatcher.store.get_workflow(&task.workflow_id).await?;
        let step = workflow.step(&task.workflow_step_id).ok_or_else(|| {
            EngineError::fatal("dispatcher", format!("webhook step {} missing", task.workflow_step_id))
        })?;
        let StepConfig::Webhook(config) = &step.config else {
            return Err(EngineError::fatal("dispatcher", "webhook step config mismatch"));
        };

        let scope = serde_json::json!({ "input": task.metadata, "run": { "inputPayload": run.input } });
        let url = render_template(&config.url_template, &scope);
        let method = Method::from_str(&config.method).unwrap_or(Method::POST);
        let body = config.body_template.as_ref().map(|tpl| render_template(tpl, &scope));

        let mut request = dispatcher.http.request(method, url);
        for (key, value) in &config.headers {
            request = request.header(key, render_template(value, &scope));
        }
        if let Some(body) = &body {
            request = request.body(body.clone());
        }

        let TaskRuntime::Webhook(mut runtime) = task.runtime.clone() else {
            return Err(EngineError::fatal("dispatcher", "webhook task missing webhook runtime"));
        };
        let attempt_number = runtime.attempts.len() as u32;

        let (status_code, error) = if dispatcher.webhook_breaker.allow_request() {
            let outcome = request.send().await;
            match &outcome {
                Ok(response) => {
                    dispatcher.webhook_breaker.record_success();
                    (Some(response.status().as_u16()), None)
                }
                Err(err) => {
                    dispatcher.webhook_breaker.record_failure();
                    (None, Some(err.to_string()))
                }
            }
        } else {
            (None, Some("circuit breaker open, request skipped".to_string()))
        };
        runtime.attempts.push(WebhookAttempt {
            attempt: attempt_number,
            sent_at: Utc::now(),
            status_code,
            error,
        });

        let succeeded = status_code.map(|code| config.is_success(code)).unwrap_or(false);

        if succeeded {
            let updated = dispatcher
                .store
                .atomic_transition(
                    task_id,
                    &[TaskStatus::InProgress],
                    TaskMutation::new(move |t| {
                        t.status = TaskStatus::Completed;
                        t.runtime = TaskRuntime::Webhook(runtime.clone());
                    }),
                )
                .await?;
            if let Some(updated) = updated {
                dispatcher
                    .complete_step(updated.run_id, &updated.workflow_step_id, true, None, &updated.metadata)
                    .await?;
            }
            return Ok(());
        }

        if attempt_number + 1 >= config.max_retries {
            let updated = dispatcher
                .store
                .atomic_transition(
                    task_id,
                    &[TaskStatus::InProgress],
                    TaskMutation::new(move |t| {
                        t.status = TaskStatus::Failed;
                        t.runtime = TaskRuntime::Webhook(runtime.clone());
                    }),
                )
                .await?;
            if let Some(updated) = updated {
                dispatcher
                    .complete_step(updated.run_id, &updated.workflow_step_id, false, None, &updated.metadata)
                    .await?;
            }
            return Ok(());
        }

        let delay = dispatcher.retry_policy.delay_for_attempt(attempt_number);
        let next_attempt_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        runtime.next_attempt_at = Some(next_attempt_at);
        dispatcher
            .store
            .atomic_transition(
                task_id,
                &[TaskStatus::InProgress],
                TaskMutation::new(move |t| t.runtime = TaskRuntime::Webhook(runtime.clone())),
            )
            .await?;
        dispatcher
            .timers
            .arm(TimerEntry {
                id: Uuid::now_v7(),
                fire_at: next_attempt_at,
                kind: TimerKind::WebhookRetry,
                subject_id: task_id,
            })
            .await?;
        Ok(())
    }
}

/// Renders `{{dot.path}}` placeholders against the evaluation scope.
fn render_template(template: &str, scope: &serde_json::Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let path = after[..end].trim();
        let value = resolve_path(scope, path).unwrap_or(serde_json::Value::Null);
        out.push_str(&scalar(&value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
