//! Workflow definitions: the immutable-once-published graph a run instantiates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The kind of a step, and correspondingly of the task it materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Trigger,
    Agent,
    Manual,
    Decision,
    Foreach,
    Join,
    External,
    Webhook,
    Subflow,
}

/// An outgoing edge from a step. Conditions are opaque strings handed to a
/// pluggable evaluator; the engine never interprets them itself.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Connection {
    pub target_step_id: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl Connection {
    /// An unconditional connection is always activated on `onCompletion`.
    #[must_use]
    pub fn is_unconditional(&self) -> bool {
        self.condition.is_none()
    }

    /// Whether this connection's condition matches the `error` handler
    /// pattern used by the non-foreach failure policy.
    #[must_use]
    pub fn is_error_handler(&self) -> bool {
        self.condition.as_deref() == Some("error")
    }
}

/// Where a foreach step draws its items from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemsSource {
    Payload,
    ExternalCallback,
}

/// The set of tasks a join's boundary evaluates counters over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinScope {
    /// Immediate children of the join's parent task.
    Children,
    /// All tasks in the run whose `workflow_step_id` equals `await_step_id`.
    StepTasks,
    /// Transitive descendants of a designated ancestor task.
    Descendants,
}

/// The predicate that decides when a `waiting` fan-in step completes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Boundary {
    #[serde(default)]
    pub min_count: Option<u64>,
    /// Success-percentage threshold. Used as the `minSuccessPercent` the
    /// boundary evaluator checks once a sealed batch is fully drained.
    #[serde(default)]
    pub min_percent: Option<f64>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    #[serde(default)]
    pub fail_on_timeout: bool,
}

impl Boundary {
    #[must_use]
    pub fn min_success_percent(&self) -> f64 {
        self.min_percent.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ForeachConfig {
    pub items_source: ItemsSource,
    #[serde(default)]
    pub items_path: Option<String>,
    #[serde(default)]
    pub max_items: Option<u32>,
    #[serde(default)]
    pub expected_count_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JoinConfig {
    pub await_step_id: String,
    pub scope: JoinScope,
    #[serde(default)]
    pub boundary: Boundary,
    /// Required when `scope == Descendants`: the task whose descendants are
    /// counted.
    #[serde(default)]
    pub await_task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExternalConfig {
    #[serde(default = "ExternalConfig::default_expected_callbacks")]
    pub expected_callbacks: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ExternalConfig {
    fn default_expected_callbacks() -> u32 {
        1
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebhookConfig {
    pub method: String,
    pub url_template: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default = "WebhookConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "WebhookConfig::default_success_codes")]
    pub success_status_codes: Vec<u16>,
}

impl WebhookConfig {
    fn default_max_retries() -> u32 {
        3
    }
    fn default_success_codes() -> Vec<u16> {
        (200..300).collect()
    }

    #[must_use]
    pub fn is_success(&self, status: u16) -> bool {
        self.success_status_codes.contains(&status)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubflowConfig {
    pub workflow_id: String,
    /// Opaque mapping applied to the child run's input payload; evaluated
    /// the same way step conditions are, by a pluggable evaluator.
    #[serde(default)]
    pub input_mapping: serde_json::Value,
}

/// Kind-specific step configuration. `Trigger`, `Agent`, `Manual`, and
/// `Decision` carry no configuration of their own: agent/manual steps are
/// driven entirely by an external actor, and decision routing lives on the
/// step's connections.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    Trigger,
    Agent,
    Manual,
    Decision,
    Foreach(ForeachConfig),
    Join(JoinConfig),
    External(ExternalConfig),
    Webhook(WebhookConfig),
    Subflow(SubflowConfig),
}

impl StepConfig {
    #[must_use]
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Trigger => StepKind::Trigger,
            Self::Agent => StepKind::Agent,
            Self::Manual => StepKind::Manual,
            Self::Decision => StepKind::Decision,
            Self::Foreach(_) => StepKind::Foreach,
            Self::Join(_) => StepKind::Join,
            Self::External(_) => StepKind::External,
            Self::Webhook(_) => StepKind::Webhook,
            Self::Subflow(_) => StepKind::Subflow,
        }
    }
}

/// Per-step overrides layered on top of a run's `TaskDefaults`. Step config
/// wins over the run-level defaults when both are present.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StepTaskOverrides {
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A node in the workflow graph definition.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Step {
    pub step_id: String,
    pub config: StepConfig,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Fallback target for decision steps when no connection condition
    /// matches.
    #[serde(default)]
    pub default_connection: Option<String>,
    #[serde(default)]
    pub overrides: StepTaskOverrides,
}

impl Step {
    #[must_use]
    pub fn kind(&self) -> StepKind {
        self.config.kind()
    }
}

/// An immutable-once-published workflow graph.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub name: String,
    pub version: u32,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub root_task_title_template: Option<String>,
}

impl Workflow {
    /// The unique trigger step that a run activates on start.
    pub fn trigger_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.kind() == StepKind::Trigger)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_workflow() -> Workflow {
        Workflow {
            workflow_id: "wf-1".into(),
            name: "Linear".into(),
            version: 1,
            root_task_title_template: None,
            steps: vec![
                Step {
                    step_id: "trigger".into(),
                    config: StepConfig::Trigger,
                    connections: vec![Connection {
                        target_step_id: "a".into(),
                        condition: None,
                        label: None,
                    }],
                    default_connection: None,
                    overrides: StepTaskOverrides::default(),
                },
                Step {
                    step_id: "a".into(),
                    config: StepConfig::Agent,
                    connections: vec![],
                    default_connection: None,
                    overrides: StepTaskOverrides::default(),
                },
            ],
        }
    }

    #[test]
    fn finds_unique_trigger_step() {
        let wf = sample_workflow();
        assert_eq!(wf.trigger_step().unwrap().step_id, "trigger");
    }

    #[test]
    fn looks_up_step_by_id() {
        let wf = sample_workflow();
        assert!(wf.step("a").is_some());
        assert!(wf.step("missing").is_none());
    }

    #[test]
    fn connection_condition_classification() {
        let unconditional = Connection {
            target_step_id: "x".into(),
            condition: None,
            label: None,
        };
        let error_handler = Connection {
            target_step_id: "y".into(),
            condition: Some("error".into()),
            label: None,
        };
        assert!(unconditional.is_unconditional());
        assert!(!error_handler.is_unconditional());
        assert!(error_handler.is_error_handler());
    }

    #[test]
    fn webhook_success_codes_default_to_2xx() {
        let cfg = WebhookConfig {
            method: "POST".into(),
            url_template: "https://example.com".into(),
            headers: HashMap::new(),
            body_template: None,
            max_retries: WebhookConfig::default_max_retries(),
            success_status_codes: WebhookConfig::default_success_codes(),
        };
        assert!(cfg.is_success(204));
        assert!(!cfg.is_success(500));
    }

    #[test]
    fn boundary_min_success_percent_defaults_to_zero() {
        let boundary = Boundary::default();
        assert_eq!(boundary.min_success_percent(), 0.0);
    }
}
