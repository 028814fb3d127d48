//! Execution engine core: the store gateway trait and in-memory reference
//! implementation, event bus, activity log, task service, run registry,
//! step dispatcher, batch coordinator, callback ingress, and timer wheel.
//!
//! [`Engine`] wires all of these together in the order their `OnceCell`
//! back-references require; everything else in this crate can be used
//! independently by anything that only needs a subset (tests, in particular).

pub mod activity_log;
pub mod batch;
pub mod callback;
pub mod dispatcher;
pub mod event_bus;
pub mod run_registry;
pub mod store;
pub mod task_service;
pub mod timer;

use std::sync::Arc;

use taskflow_shared::config::EngineConfig;

use activity_log::ActivityLog;
use batch::BatchCoordinator;
use callback::CallbackIngress;
use dispatcher::{Dispatcher, DispatcherTerminalHook};
use event_bus::EventBus;
use run_registry::RunRegistry;
use store::StoreGateway;
use task_service::TaskService;
use timer::TimerWheel;

/// The fully wired engine: every component plus the handful of `OnceCell`
/// back-references connecting them. Construct once per process (or per
/// test) via [`Engine::new`].
pub struct Engine<S: StoreGateway> {
    pub store: Arc<S>,
    pub events: Arc<EventBus>,
    pub activity: Arc<ActivityLog<S>>,
    pub tasks: Arc<TaskService<S>>,
    pub batch: Arc<BatchCoordinator<S>>,
    pub timers: Arc<TimerWheel<S>>,
    pub runs: Arc<RunRegistry<S>>,
    pub dispatcher: Arc<Dispatcher<S>>,
    pub callback: Arc<CallbackIngress<S>>,
}

impl<S: StoreGateway> Engine<S> {
    /// Wires every component against `store`, applying `config`'s webhook
    /// retry policy. Wiring order matters: each `OnceCell` back-reference
    /// is set only after the component it points to exists.
    #[must_use]
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Self {
        let events = Arc::new(EventBus::new());
        let activity = Arc::new(ActivityLog::new(store.clone()));
        let tasks = Arc::new(TaskService::new(store.clone(), events.clone(), activity.clone()));
        let batch = Arc::new(BatchCoordinator::new(store.clone(), tasks.clone()));
        let timers = Arc::new(TimerWheel::new(store.clone()));
        let runs = Arc::new(RunRegistry::new(store.clone(), events.clone(), tasks.clone()));

        let dispatcher = Arc::new(
            Dispatcher::new(store.clone(), tasks.clone(), batch.clone(), events.clone(), timers.clone(), runs.clone())
                .with_retry_policy(config.default_retry_policy.clone())
                .with_circuit_breaker_config(&config.webhook_circuit_breaker),
        );

        tasks.set_terminal_hook(Arc::new(DispatcherTerminalHook { dispatcher: dispatcher.clone() }));
        batch.set_boundary_sink(dispatcher.clone());
        runs.set_dispatcher(dispatcher.clone());
        timers.set_sink(dispatcher.clone());

        let callback = Arc::new(CallbackIngress::new(store.clone(), tasks.clone(), batch.clone()));

        Self {
            store,
            events,
            activity,
            tasks,
            batch,
            timers,
            runs,
            dispatcher,
            callback,
        }
    }

    /// Spawns the timer wheel's background tick loop at the configured
    /// granularity. Callers that want to stop it must abort the handle.
    pub fn spawn_timer_loop(&self, config: &EngineConfig) -> tokio::task::JoinHandle<()> {
        self.timers.clone().spawn_loop(config.timer_granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::memory::InMemoryStore;
    use taskflow_shared::domain::{ExecutionOptions, TaskDefaults, Workflow};

    fn trigger_only_workflow(id: &str) -> Workflow {
        serde_json::from_value(serde_json::json!({
            "workflow_id": id,
            "name": "trivial",
            "version": 1,
            "steps": [
                {
                    "step_id": "start",
                    "config": { "kind": "trigger" },
                    "connections": []
                }
            ]
        }))
        .expect("fixture workflow should deserialize")
    }

    #[tokio::test]
    async fn engine_wiring_runs_a_trigger_only_workflow_to_completion() {
        let store = Arc::new(InMemoryStore::new());
        store.put_workflow(trigger_only_workflow("wf-trivial")).await.unwrap();

        let engine = Engine::new(store, &EngineConfig::default());
        let (run, _root_task) = engine
            .runs
            .start_workflow("wf-trivial", serde_json::json!({}), TaskDefaults::default(), ExecutionOptions::default(), None)
            .await
            .unwrap();

        let run = engine.runs.get_run(run.id).await.unwrap();
        assert_eq!(run.status, taskflow_shared::domain::RunStatus::Completed);
    }
}
