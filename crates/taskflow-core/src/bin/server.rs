//! Thin axum binding for the execution engine's HTTP surface. All decisions
//! happen in the component layer (`taskflow_core::Engine` and friends);
//! this binary only translates HTTP requests into calls against it and
//! serializes the results back out.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info};
use uuid::Uuid;

use taskflow_core::callback::{CallbackRequest, RequestInfo};
use taskflow_core::store::memory::InMemoryStore;
use taskflow_core::store::{SortOrder, TaskFilter};
use taskflow_core::Engine;
use taskflow_shared::config::EngineConfig;
use taskflow_shared::domain::{ExecutionOptions, TaskDefaults};
use taskflow_shared::errors::EngineError;

#[derive(Parser, Debug)]
#[command(name = "taskflow-server", about = "Workflow execution engine HTTP server")]
struct Cli {
    /// Path to a config file layered under defaults and `TASKFLOW_` env vars.
    #[arg(long)]
    config: Option<String>,
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,
}

type AppEngine = Arc<Engine<InMemoryStore>>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    let config = match EngineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load engine configuration");
            std::process::exit(1);
        }
    };

    let store = Arc::new(InMemoryStore::new());
    let engine = Arc::new(Engine::new(store, &config));
    let _timer_loop = engine.spawn_timer_loop(&config);

    let app = router(engine);
    let listener = match tokio::net::TcpListener::bind(&cli.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "store or listen address unreachable at startup");
            std::process::exit(2);
        }
    };

    info!(addr = %cli.listen, "taskflow-server listening");
    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!(error = %err, "server exited with error");
        std::process::exit(1);
    }
}

fn router(engine: AppEngine) -> Router {
    Router::new()
        .route("/runs", post(start_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/callback/{step_id}", post(callback))
        .route("/events/stream", get(events_stream))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::timeout::TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .with_state(engine)
}

fn engine_error_response(err: EngineError) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(serde_json::json!({ "error": err.to_string() })))
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    workflow_id: String,
    #[serde(default)]
    input_payload: Value,
    #[serde(default)]
    task_defaults: TaskDefaults,
    #[serde(default)]
    execution_options: ExecutionOptions,
    #[serde(default)]
    external_id: Option<String>,
}

async fn start_run(
    State(engine): State<AppEngine>,
    Json(request): Json<StartRunRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (run, root_task) = engine
        .runs
        .start_workflow(
            request.workflow_id,
            request.input_payload,
            request.task_defaults,
            request.execution_options,
            request.external_id,
        )
        .await
        .map_err(engine_error_response)?;
    Ok(Json(serde_json::json!({ "run": run, "rootTask": root_task })))
}

#[derive(Debug, Deserialize)]
struct GetRunQuery {
    #[serde(default)]
    include_tasks: bool,
}

async fn get_run(
    State(engine): State<AppEngine>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetRunQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let run = engine.runs.get_run(id).await.map_err(engine_error_response)?;
    if !query.include_tasks {
        return Ok(Json(serde_json::json!({ "run": run })));
    }
    let tasks = engine
        .tasks
        .list(
            TaskFilter {
                run_id: Some(id),
                ..Default::default()
            },
            SortOrder::CreatedAtAsc,
        )
        .await
        .map_err(engine_error_response)?;
    Ok(Json(serde_json::json!({ "run": run, "tasks": tasks })))
}

async fn cancel_run(
    State(engine): State<AppEngine>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let run = engine.runs.cancel_run(id, None).await.map_err(engine_error_response)?;
    Ok(Json(serde_json::json!({ "run": run })))
}

async fn callback(
    State(engine): State<AppEngine>,
    Path((run_id, step_id)): Path<(Uuid, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let secret = headers
        .get("x-workflow-secret")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| engine_error_response(EngineError::unauthorized("missing X-Workflow-Secret header")))?
        .to_string();

    let request_info = RequestInfo {
        headers: headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect(),
        remote_addr: None,
    };

    let response = engine
        .callback
        .handle(CallbackRequest {
            run_id,
            step_id,
            secret,
            payload,
            request_info,
        })
        .await
        .map_err(engine_error_response)?;
    Ok(Json(serde_json::to_value(response).unwrap_or(Value::Null)))
}

/// `*`-subscribes to the event bus and relays every event as a named SSE
/// frame, with a heartbeat ticker merged in so idle connections aren't
/// silently dropped by intermediaries.
async fn events_stream(
    State(engine): State<AppEngine>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    engine.events.subscribe(
        "*",
        Box::new(move |event| {
            let _ = tx.send(event.clone());
        }),
    );

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        Ok(SseEvent::default()
            .event(event.topic.clone())
            .json_data(event)
            .unwrap_or_else(|_| SseEvent::default().event("error")))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(30)).text(":heartbeat"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
