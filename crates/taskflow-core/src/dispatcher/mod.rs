//! Per-step-kind activation strategies plus the shared `onCompletion` logic
//! that evaluates outgoing connections and advances (or finalizes) the run.

pub mod strategies;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use taskflow_shared::domain::{
    Connection, ExecutionMode, Run, Step, StepKind, StepTaskOverrides, Task, TaskStatus, Urgency,
    Workflow,
};
use taskflow_shared::errors::{EngineError, EngineResult};
use taskflow_shared::resilience::{AtomicCircuitBreaker, CircuitBreakerBehavior};

use crate::batch::{BatchCoordinator, BoundaryOutcome, BoundarySink};
use crate::event_bus::EventBus;
use crate::run_registry::RunStore;
use crate::store::{RunMutation, StoreGateway};
use crate::task_service::{TaskService, TerminalHook};
use crate::timer::{TimerSink, TimerWheel};

/// Everything a strategy needs to activate one step for one run.
pub struct ActivationContext<'a> {
    pub run: &'a Run,
    pub step: &'a Step,
    pub parent_task_id: Option<Uuid>,
    pub input: Value,
}

#[async_trait]
pub trait StepStrategy<S: StoreGateway>: Send + Sync {
    async fn activate(&self, dispatcher: &Dispatcher<S>, ctx: ActivationContext<'_>) -> EngineResult<Task>;
}

fn merge_overrides(run: &Run, overrides: &StepTaskOverrides) -> (Option<String>, Vec<String>, Urgency) {
    let assignee = overrides.assignee.clone().or_else(|| run.task_defaults.assignee.clone());
    let mut tags = run.task_defaults.tags.clone();
    tags.extend(overrides.tags.iter().cloned());
    (assignee, tags, run.task_defaults.urgency)
}

/// Builds the common fields every activated task shares, before a strategy
/// layers on kind-specific runtime state.
pub fn base_task(
    run: &Run,
    step: &Step,
    parent_task_id: Option<Uuid>,
    execution_mode: ExecutionMode,
    title: impl Into<String>,
) -> Task {
    let (assignee, tags, urgency) = merge_overrides(run, &step.overrides);
    let now = Utc::now();
    Task {
        id: Uuid::now_v7(),
        run_id: run.id,
        workflow_id: run.workflow_id.clone(),
        workflow_step_id: step.step_id.clone(),
        parent_id: parent_task_id,
        title: title.into(),
        summary: None,
        status: TaskStatus::Pending,
        execution_mode,
        urgency,
        assignee,
        tags,
        batch_counters: Default::default(),
        runtime: taskflow_shared::domain::TaskRuntime::None,
        decision_result: None,
        metadata: serde_json::json!({}),
        creator: None,
        created_at: now,
        updated_at: now,
        archived: false,
    }
}

pub struct Dispatcher<S: StoreGateway> {
    pub(crate) store: Arc<S>,
    pub(crate) tasks: Arc<TaskService<S>>,
    pub(crate) batch: Arc<BatchCoordinator<S>>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) timers: Arc<TimerWheel<S>>,
    pub(crate) runs: Arc<dyn RunStore>,
    pub(crate) http: reqwest::Client,
    pub(crate) evaluator: Arc<dyn strategies::decision::ConditionEvaluator>,
    pub(crate) retry_policy: taskflow_shared::config::BackoffConfig,
    pub(crate) webhook_breaker: Arc<dyn CircuitBreakerBehavior>,
    strategies: HashMap<StepKind, Box<dyn StepStrategy<S>>>,
}

impl<S: StoreGateway> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish()
    }
}

impl<S: StoreGateway> Dispatcher<S> {
    #[must_use]
    pub fn new(
        store: Arc<S>,
        tasks: Arc<TaskService<S>>,
        batch: Arc<BatchCoordinator<S>>,
        events: Arc<EventBus>,
        timers: Arc<TimerWheel<S>>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        let mut strategies: HashMap<StepKind, Box<dyn StepStrategy<S>>> = HashMap::new();
        strategies.insert(StepKind::Trigger, Box::new(strategies::trigger::TriggerStrategy));
        strategies.insert(StepKind::Agent, Box::new(strategies::agent::AgentStrategy));
        strategies.insert(StepKind::Manual, Box::new(strategies::manual::ManualStrategy));
        strategies.insert(StepKind::Decision, Box::new(strategies::decision::DecisionStrategy));
        strategies.insert(StepKind::Foreach, Box::new(strategies::foreach::ForeachStrategy));
        strategies.insert(StepKind::Join, Box::new(strategies::join::JoinStrategy));
        strategies.insert(StepKind::External, Box::new(strategies::external::ExternalStrategy));
        strategies.insert(StepKind::Webhook, Box::new(strategies::webhook::WebhookStrategy));
        strategies.insert(StepKind::Subflow, Box::new(strategies::subflow::SubflowStrategy));
        Self {
            store,
            tasks,
            batch,
            events,
            timers,
            runs,
            http: reqwest::Client::new(),
            evaluator: Arc::new(strategies::decision::DefaultConditionEvaluator),
            retry_policy: taskflow_shared::config::BackoffConfig::default(),
            webhook_breaker: Arc::new(AtomicCircuitBreaker::new(5, std::time::Duration::from_secs(30))),
            strategies,
        }
    }

    /// Overrides the webhook retry/backoff policy, e.g. from `EngineConfig`.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: taskflow_shared::config::BackoffConfig) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Overrides the circuit breaker guarding outbound webhook calls, e.g.
    /// from `EngineConfig`.
    #[must_use]
    pub fn with_circuit_breaker_config(mut self, config: &taskflow_shared::config::CircuitBreakerConfig) -> Self {
        self.webhook_breaker = Arc::new(AtomicCircuitBreaker::new(config.failure_threshold, config.open_duration));
        self
    }

    /// Activates a step for `run`. Returns `None` when the step was listed
    /// in `skipSteps`: no task is materialized, but its unconditional
    /// successors are activated as if it had completed.
    pub async fn activate_step(
        &self,
        run: &Run,
        step: &Step,
        parent_task_id: Option<Uuid>,
        input: Value,
    ) -> EngineResult<Option<Task>> {
        if run.should_skip(&step.step_id) {
            self.activate_successors(run, step, None, &Value::Null).await?;
            return Ok(None);
        }
        let strategy = self
            .strategies
            .get(&step.kind())
            .ok_or_else(|| EngineError::fatal("dispatcher", format!("no strategy for step {}", step.step_id)))?;
        // Marked current *before* the strategy runs: a strategy that
        // completes synchronously (trigger, decision) immediately removes
        // the step again via `complete_step`, so the add must land first.
        self.runs.note_step_active(run.id, &step.step_id).await?;
        let task = strategy
            .activate(
                self,
                ActivationContext {
                    run,
                    step,
                    parent_task_id,
                    input,
                },
            )
            .await?;
        Ok(Some(task))
    }

    /// Shared `onCompletion`: evaluates outgoing connections and activates
    /// every satisfied target. Called once a task's terminal status is
    /// known, by whichever strategy or coordinator observed it.
    /// `decision_result`, when present, is the target step id a decision
    /// task selected; it overrides the default unconditional-connection fan
    /// out for that one completion.
    pub async fn complete_step(
        &self,
        run_id: Uuid,
        step_id: &str,
        succeeded: bool,
        decision_result: Option<&str>,
        output: &Value,
    ) -> EngineResult<()> {
        let run = self.runs.get(run_id).await?;
        let workflow = self.store.get_workflow(&run.workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::fatal("dispatcher", format!("step {step_id} missing from snapshot")))?
            .clone();

        self.runs.note_step_completed(run_id, step_id).await?;

        if run.status.is_terminal() {
            // The run was cancelled (or otherwise finalized) while this
            // step's task was still in flight: its completion is recorded
            // above, but no successor is activated and the run's terminal
            // status is left untouched.
            return Ok(());
        }

        if !succeeded {
            if let Some(handler) = step.connections.iter().find(Connection::is_error_handler) {
                self.activate_by_id(&run, &workflow, &handler.target_step_id, None, output.clone())
                    .await?;
            } else {
                self.runs.fail_run(run_id, step_id).await?;
            }
            self.maybe_finalize(run_id).await?;
            return Ok(());
        }

        self.activate_successors(&run, &step, decision_result, output).await?;
        self.maybe_finalize(run_id).await?;
        Ok(())
    }

    async fn activate_successors(
        &self,
        run: &Run,
        step: &Step,
        decision_result: Option<&str>,
        output: &Value,
    ) -> EngineResult<()> {
        let workflow = self.store.get_workflow(&run.workflow_id).await?;
        let targets: Vec<&Connection> = if let Some(chosen) = decision_result {
            step.connections.iter().filter(|c| c.target_step_id == chosen).collect()
        } else {
            step.connections.iter().filter(|c| c.is_unconditional()).collect()
        };

        if run.is_paused_at(&step.step_id) {
            return Ok(());
        }

        for connection in targets {
            self.activate_by_id(run, &workflow, &connection.target_step_id, None, output.clone())
                .await?;
        }
        Ok(())
    }

    async fn activate_by_id(
        &self,
        run: &Run,
        workflow: &Workflow,
        step_id: &str,
        parent_task_id: Option<Uuid>,
        input: Value,
    ) -> EngineResult<()> {
        let step = workflow
            .step(step_id)
            .ok_or_else(|| EngineError::fatal("dispatcher", format!("unknown successor step {step_id}")))?;
        self.activate_step(run, step, parent_task_id, input).await?;
        Ok(())
    }

    async fn maybe_finalize(&self, run_id: Uuid) -> EngineResult<()> {
        let run = self.runs.get(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        if run.current_step_ids.is_empty() {
            if run.failed_step_id.is_some() {
                self.runs.mark_failed(run_id).await?;
            } else {
                self.runs.mark_completed(run_id).await?;
            }
        }
        Ok(())
    }
}

/// Bridges task-service terminal notifications into the batch coordinator
/// and then into the shared completion path.
pub struct DispatcherTerminalHook<S: StoreGateway> {
    pub dispatcher: Arc<Dispatcher<S>>,
}

#[async_trait]
impl<S: StoreGateway> TerminalHook for DispatcherTerminalHook<S> {
    async fn on_task_terminal(&self, task: &Task) -> EngineResult<()> {
        self.dispatcher.batch.on_child_terminal(task).await?;
        if task.parent_id.is_none() || !matches!(task.runtime, taskflow_shared::domain::TaskRuntime::Join(_)) {
            // Waiting batch parents resolve through `BoundarySink`, not here;
            // everything else (agent/manual/decision/external/webhook/trigger)
            // completes the step directly.
            if !matches!(task.status, TaskStatus::Waiting) {
                let succeeded = task.status == TaskStatus::Completed;
                self.dispatcher
                    .complete_step(
                        task.run_id,
                        &task.workflow_step_id,
                        succeeded,
                        task.decision_result.as_deref(),
                        &task.metadata,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

/// Bridges batch-coordinator boundary satisfaction into the shared
/// completion path.
#[async_trait]
impl<S: StoreGateway> BoundarySink for Dispatcher<S> {
    async fn on_boundary_satisfied(&self, outcome: BoundaryOutcome) -> EngineResult<()> {
        self.complete_step(
            outcome.run_id,
            &outcome.workflow_step_id,
            outcome.evaluation_succeeded,
            None,
            &serde_json::json!({ "reason": format!("{:?}", outcome.reason) }),
        )
        .await
    }
}

/// Bridges timer-wheel firings into the relevant coordinator.
#[async_trait]
impl<S: StoreGateway> TimerSink for Dispatcher<S> {
    async fn on_timer_fired(&self, timer: crate::store::TimerEntry) -> EngineResult<()> {
        use crate::store::TimerKind;
        match timer.kind {
            TimerKind::ExternalTimeout => {
                strategies::external::ExternalStrategy::on_timeout(self, timer.subject_id).await
            }
            TimerKind::JoinMaxWait | TimerKind::BatchDeadline => {
                self.batch.on_deadline(timer.subject_id).await
            }
            TimerKind::WebhookRetry => {
                strategies::webhook::WebhookStrategy::retry(self, timer.subject_id).await
            }
        }
    }
}
