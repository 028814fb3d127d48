//! Domain model for the execution engine: workflow definitions, runs,
//! tasks, and their activity log.

pub mod activity;
pub mod run;
pub mod task;
pub mod workflow;

pub use activity::{ActivityEntry, ActivityEventType, ActorType, FieldChange};
pub use run::{CallbackSecret, ExecutionOptions, Run, RunStatus, TaskDefaults, Urgency};
pub use task::{
    BatchCounters, ExecutionMode, ExternalRuntime, JoinRuntime, Task, TaskRuntime, TaskStatus,
    WebhookAttempt, WebhookRuntime,
};
pub use workflow::{
    Boundary, Connection, ExternalConfig, ForeachConfig, ItemsSource, JoinConfig, JoinScope, Step,
    StepConfig, StepKind, StepTaskOverrides, SubflowConfig, WebhookConfig, Workflow,
};
