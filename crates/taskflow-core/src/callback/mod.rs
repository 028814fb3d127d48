//! The unified callback entry point external systems use to report back
//! into a run: single-shot external-task completions and streamed foreach
//! items both land here, normalized into one shape before being routed to
//! the task service or the batch coordinator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use taskflow_shared::domain::{ActorType, StepKind, Task, TaskRuntime, TaskStatus};
use taskflow_shared::errors::{EngineError, EngineResult};

use crate::batch::BatchCoordinator;
use crate::dispatcher::strategies::foreach::build_item_child;
use crate::store::{SortOrder, StoreGateway, TaskFilter};
use crate::task_service::TaskService;

const SECRET_HEADER: &str = "x-workflow-secret";
const AUTH_HEADER: &str = "authorization";

/// Raw request metadata, recorded (sanitized) onto the target task.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub headers: Vec<(String, String)>,
    pub remote_addr: Option<String>,
}

impl RequestInfo {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn sanitized(&self) -> Value {
        let headers: serde_json::Map<String, Value> = self
            .headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case(SECRET_HEADER) && !k.eq_ignore_ascii_case(AUTH_HEADER))
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        serde_json::json!({ "headers": headers, "remoteAddr": self.remote_addr })
    }
}

pub struct CallbackRequest {
    pub run_id: Uuid,
    pub step_id: String,
    pub secret: String,
    pub payload: Value,
    pub request_info: RequestInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub acknowledged: bool,
    pub task_id: Uuid,
    pub task_status: TaskStatus,
    pub child_task_ids: Vec<Uuid>,
    pub received_count: Option<u64>,
    pub expected_count: Option<u64>,
    pub is_complete: bool,
    pub join_result: Option<Value>,
}

pub struct CallbackIngress<S: StoreGateway> {
    store: Arc<S>,
    tasks: Arc<TaskService<S>>,
    batch: Arc<BatchCoordinator<S>>,
}

impl<S: StoreGateway> CallbackIngress<S> {
    #[must_use]
    pub fn new(store: Arc<S>, tasks: Arc<TaskService<S>>, batch: Arc<BatchCoordinator<S>>) -> Self {
        Self { store, tasks, batch }
    }

    pub async fn handle(&self, request: CallbackRequest) -> EngineResult<CallbackResponse> {
        let run = self.store.get_run(request.run_id).await?;
        if !run.callback_secret.matches(&request.secret) {
            return Err(EngineError::unauthorized("callback secret mismatch"));
        }

        let task = self
            .store
            .list_tasks(
                TaskFilter {
                    run_id: Some(request.run_id),
                    workflow_step_id: Some(request.step_id.clone()),
                    include_archived: true,
                    ..Default::default()
                },
                SortOrder::CreatedAtAsc,
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::not_found(format!("no task for step {}", request.step_id)))?;

        let workflow = self.store.get_workflow(&run.workflow_id).await?;
        let step = workflow
            .step(&request.step_id)
            .ok_or_else(|| EngineError::fatal("callback", format!("step {} missing from snapshot", request.step_id)))?
            .clone();

        let workflow_update = merge_workflow_update(&request.payload, &request.request_info);

        let mut response = CallbackResponse {
            acknowledged: true,
            task_id: task.id,
            task_status: task.status,
            child_task_ids: Vec::new(),
            received_count: None,
            expected_count: None,
            is_complete: false,
            join_result: None,
        };

        match step.kind() {
            StepKind::External => {
                let completed = self.complete_external(&task, &request.payload).await?;
                response.task_status = completed.status;
                response.is_complete = completed.status.is_terminal();
                if let TaskRuntime::External(ext) = &completed.runtime {
                    response.received_count = Some(u64::from(ext.received_callbacks));
                    response.expected_count = Some(u64::from(ext.expected_callbacks));
                }
            }
            StepKind::Foreach => {
                let (updated, children) = self.ingest_foreach_items(&task, &request.payload, &workflow_update).await?;
                response.task_status = updated.status;
                response.child_task_ids = children;
                response.received_count = Some(updated.batch_counters.received_count);
                response.expected_count = updated.batch_counters.expected_count;
                response.is_complete = updated.status.is_terminal();
            }
            StepKind::Join => {
                return Err(EngineError::validation("join steps are not directly callable"));
            }
            other => {
                return Err(EngineError::validation(format!("step kind {other:?} does not accept callbacks")));
            }
        }

        self.append_callback_history(task.id, &request.request_info).await?;

        Ok(response)
    }

    async fn complete_external(&self, task: &Task, payload: &Value) -> EngineResult<Task> {
        let TaskRuntime::External(ext) = &task.runtime else {
            return Err(EngineError::fatal("callback", "external task missing external runtime"));
        };
        let received = ext.received_callbacks + 1;
        let expected = ext.expected_callbacks;
        let payload = payload.clone();

        if received >= expected {
            self.tasks
                .transition(
                    task.id,
                    &[TaskStatus::Waiting],
                    TaskStatus::Completed,
                    ActorType::System,
                    None,
                    move |t| {
                        if let TaskRuntime::External(ext) = &mut t.runtime {
                            ext.received_callbacks = received;
                        }
                        t.metadata = payload;
                    },
                )
                .await
        } else {
            self.tasks
                .update_fields(task.id, ActorType::System, None, vec![], move |t| {
                    if let TaskRuntime::External(ext) = &mut t.runtime {
                        ext.received_callbacks = received;
                    }
                    t.metadata = payload;
                })
                .await
        }
    }

    async fn ingest_foreach_items(
        &self,
        task: &Task,
        payload: &Value,
        workflow_update: &WorkflowUpdate,
    ) -> EngineResult<(Task, Vec<Uuid>)> {
        let items = extract_callback_items(payload);
        let item_key = payload.get("itemKey").and_then(Value::as_str);
        let mut children = Vec::with_capacity(items.len());

        if !items.is_empty() {
            let workflow = self.store.get_workflow(&task.workflow_id).await?;
            let step = workflow
                .step(&task.workflow_step_id)
                .ok_or_else(|| EngineError::fatal("callback", "foreach step missing from snapshot"))?;
            let successor_id = step
                .connections
                .iter()
                .find(|c| c.is_unconditional())
                .map(|c| c.target_step_id.clone())
                .ok_or_else(|| EngineError::fatal("callback", "foreach step has no successor connection"))?;
            let successor = workflow
                .step(&successor_id)
                .ok_or_else(|| EngineError::fatal("callback", format!("unknown foreach successor {successor_id}")))?
                .clone();
            let run = self.store.get_run(task.run_id).await?;
            let parent_id = task.id;
            // `itemKey` dedup only applies to a single logical item per
            // callback; a batched `items` array carries no per-element key.
            let single_item_key = if items.len() == 1 { item_key } else { None };

            for item in items {
                let successor = successor.clone();
                let run_ref = &run;
                if let Some(child) = self
                    .batch
                    .ingest_item(
                        parent_id,
                        move |value| build_item_child(run_ref, &successor, parent_id, value),
                        item,
                        single_item_key,
                    )
                    .await?
                {
                    children.push(child.id);
                }
            }
        }

        if workflow_update.total.is_some() || workflow_update.complete {
            self.batch.apply_workflow_update(task.id, workflow_update.total, workflow_update.complete).await?;
        }
        self.batch.evaluate_now(task.id).await?;

        let updated = self.store.get_task(task.id).await?;
        Ok((updated, children))
    }

    async fn append_callback_history(&self, task_id: Uuid, request_info: &RequestInfo) -> EngineResult<()> {
        let entry = request_info.sanitized();
        let current = self.store.get_task(task_id).await?;
        let mut metadata = current.metadata.clone();
        let history = metadata
            .as_object_mut()
            .map(|obj| obj.entry("callbackHistory").or_insert_with(|| Value::Array(Vec::new())));
        if let Some(Value::Array(history)) = history {
            history.push(entry);
        }
        self.tasks.update_fields(task_id, ActorType::System, None, vec![], move |t| t.metadata = metadata).await?;
        Ok(())
    }
}

struct WorkflowUpdate {
    total: Option<u64>,
    complete: bool,
}

fn merge_workflow_update(payload: &Value, request_info: &RequestInfo) -> WorkflowUpdate {
    let payload_update = payload.get("workflowUpdate");
    let mut total = payload_update.and_then(|u| u.get("total")).and_then(Value::as_u64);
    let mut complete = payload_update.and_then(|u| u.get("complete")).and_then(Value::as_bool).unwrap_or(false);

    if let Some(header) = request_info.header("x-expected-count") {
        if let Ok(parsed) = header.parse::<u64>() {
            total = Some(parsed);
        }
    }
    if let Some(header) = request_info.header("x-workflow-complete") {
        complete = matches!(header.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
    }

    WorkflowUpdate { total, complete }
}

/// `items` wins over `item`; absent both, the payload itself (minus
/// `workflowUpdate`) is treated as a single bare item rather than no item
/// at all.
fn extract_callback_items(payload: &Value) -> Vec<Value> {
    if let Some(items) = payload.get("items").and_then(Value::as_array) {
        return items.clone();
    }
    if let Some(item) = payload.get("item") {
        return vec![item.clone()];
    }
    let mut rest = payload.clone();
    if let Some(obj) = rest.as_object_mut() {
        obj.remove("workflowUpdate");
    }
    vec![rest]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_request_info_drops_secret_headers() {
        let info = RequestInfo {
            headers: vec![
                ("X-Workflow-Secret".into(), "s3cr3t".into()),
                ("Authorization".into(), "Bearer abc".into()),
                ("Content-Type".into(), "application/json".into()),
            ],
            remote_addr: Some("127.0.0.1".into()),
        };
        let sanitized = info.sanitized();
        let headers = sanitized.get("headers").unwrap().as_object().unwrap();
        assert!(!headers.contains_key("X-Workflow-Secret"));
        assert!(!headers.contains_key("Authorization"));
        assert!(headers.contains_key("Content-Type"));
    }

    #[test]
    fn header_overrides_win_over_payload() {
        let payload = serde_json::json!({"workflowUpdate": {"total": 3, "complete": false}});
        let info = RequestInfo {
            headers: vec![("X-Expected-Count".into(), "9".into()), ("X-Workflow-Complete".into(), "true".into())],
            remote_addr: None,
        };
        let update = merge_workflow_update(&payload, &info);
        assert_eq!(update.total, Some(9));
        assert!(update.complete);
    }

    #[test]
    fn extract_items_prefers_items_array_over_single_item() {
        let payload = serde_json::json!({"items": [1, 2], "item": 3});
        assert_eq!(extract_callback_items(&payload), vec![serde_json::json!(1), serde_json::json!(2)]);
    }

    #[test]
    fn extract_items_falls_back_to_bare_payload_minus_workflow_update() {
        let payload = serde_json::json!({"k": "c", "workflowUpdate": {"total": 3}});
        assert_eq!(extract_callback_items(&payload), vec![serde_json::json!({"k": "c"})]);
    }
}
