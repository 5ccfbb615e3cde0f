//! REST + WebSocket surface for the queue engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::enqueue::EnqueueService;
use crate::error::EnqueueError;
use crate::events::{inference_channel, EventHub, JobEvent};
use crate::queue::{InferenceTask, JobSource, JobStatus};
use crate::store::{Database, ExecutionStore, InferenceStore};
use crate::workers::CancelRegistry;

/// WS close code for an unknown task id.
const CLOSE_NOT_FOUND: u16 = 4004;

/// Keep-alive interval for idle WebSocket streams.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub enqueue: EnqueueService,
    pub executions: ExecutionStore,
    pub tasks: InferenceStore,
    pub hub: Arc<EventHub>,
    pub execution_cancels: Arc<CancelRegistry>,
    pub inference_cancels: Arc<CancelRegistry>,
    pub db: Arc<Database>,
    pub started: Instant,
}

/// Build the Axum router with queue REST and streaming routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/executions/run", post(run_execution))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/inference/chat", post(chat_inference))
        .route("/inference/{id}", get(get_inference))
        .route("/inference/{id}/cancel", post(cancel_inference))
        .route("/inference/{id}/stream", get(stream_inference))
        .route("/admin/health", get(health))
        .with_state(state)
}

fn bad_id() -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Invalid job ID"})),
    )
}

fn not_found(what: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{what} not found")})),
    )
}

fn enqueue_error(e: EnqueueError) -> (StatusCode, Json<Value>) {
    match e {
        EnqueueError::InvalidInput(message) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
        }
        EnqueueError::Store(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

fn store_error(e: crate::error::StoreError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

// ── Executions ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RunExecutionRequest {
    agent_id: String,
    #[serde(default)]
    input: Value,
}

async fn run_execution(
    State(state): State<AppState>,
    Json(body): Json<RunExecutionRequest>,
) -> impl IntoResponse {
    match state.enqueue.enqueue_execution(
        &body.agent_id,
        body.input,
        JobSource::ManualRun,
        None,
        None,
    ) {
        Ok(execution_id) => (
            StatusCode::OK,
            Json(json!({"execution_id": execution_id, "status": "QUEUED"})),
        ),
        Err(e) => enqueue_error(e),
    }
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(execution_id) = Uuid::parse_str(&id) else {
        return bad_id();
    };
    match state.executions.get(execution_id) {
        Ok(Some(exec)) => (StatusCode::OK, Json(json!(exec))),
        Ok(None) => not_found("Execution"),
        Err(e) => store_error(e),
    }
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(execution_id) = Uuid::parse_str(&id) else {
        return bad_id();
    };
    let row = match state.executions.get(execution_id) {
        Ok(Some(exec)) => exec,
        Ok(None) => return not_found("Execution"),
        Err(e) => return store_error(e),
    };

    // Cancelling a terminal job is a no-op that still succeeds.
    if !row.status.is_terminal() {
        if let Err(e) = state.executions.request_cancel(execution_id) {
            return store_error(e);
        }
        if state.execution_cancels.signal(execution_id) {
            info!(execution_id = %execution_id, "Signalled in-process cancel");
        }
    }

    (
        StatusCode::OK,
        Json(json!({"status": "cancel_requested", "execution_id": execution_id})),
    )
}

// ── Inference ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatRequest {
    model_id: String,
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    parameters: Value,
}

async fn chat_inference(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    match state.enqueue.enqueue_inference(
        &body.model_id,
        body.messages,
        body.parameters,
        JobSource::Chat,
        None,
    ) {
        Ok(task_id) => (
            StatusCode::OK,
            Json(json!({"task_id": task_id, "status": "QUEUED"})),
        ),
        Err(e) => enqueue_error(e),
    }
}

async fn get_inference(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return bad_id();
    };
    match state.tasks.get(task_id) {
        Ok(Some(task)) => (StatusCode::OK, Json(json!(task))),
        Ok(None) => not_found("Task"),
        Err(e) => store_error(e),
    }
}

async fn cancel_inference(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        return bad_id();
    };
    let row = match state.tasks.get(task_id) {
        Ok(Some(task)) => task,
        Ok(None) => return not_found("Task"),
        Err(e) => return store_error(e),
    };

    if !row.status.is_terminal() {
        if let Err(e) = state.tasks.request_cancel(task_id) {
            return store_error(e);
        }
        if state.inference_cancels.signal(task_id) {
            info!(task_id = %task_id, "Signalled in-process cancel");
        }
    }

    (
        StatusCode::OK,
        Json(json!({"status": "cancel_requested", "task_id": task_id})),
    )
}

// ── WebSocket streaming ─────────────────────────────────────────────────

async fn stream_inference(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, state, id))
}

async fn handle_stream(mut socket: WebSocket, state: AppState, id: String) {
    let Ok(task_id) = Uuid::parse_str(&id) else {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_NOT_FOUND,
                reason: "Invalid task ID".into(),
            })))
            .await;
        return;
    };

    // Subscribe before reading the row so no event can slip between the two.
    let channel = inference_channel(task_id);
    let mut rx = state.hub.subscribe(&channel);

    let row = match state.tasks.get(task_id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_NOT_FOUND,
                    reason: "Task not found".into(),
                })))
                .await;
            return;
        }
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Stream lookup failed");
            return;
        }
    };
    info!(task_id = %task_id, "WebSocket stream connected");

    // A task that finished before the client connected still gets its one
    // terminal event, synthesized from the durable row.
    if row.status.is_terminal() {
        let _ = send_event(&mut socket, &terminal_event_from_row(&row)).await;
        return;
    }

    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        if send_event(&mut socket, &event).await.is_err() {
                            debug!(task_id = %task_id, "Client disconnected during send");
                            break;
                        }
                        if terminal {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(task_id = %task_id, missed = n, "WS client lagged behind stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!(task_id = %task_id, "Event channel closed");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if send_event(&mut socket, &JobEvent::Ping).await.is_err() {
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(task_id = %task_id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(task_id = %task_id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(task_id = %task_id, "WebSocket stream closed");
}

async fn send_event(socket: &mut WebSocket, event: &JobEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "Failed to serialize event");
            Ok(())
        }
    }
}

/// Rebuild the terminal event for a task that is already finished.
fn terminal_event_from_row(task: &InferenceTask) -> JobEvent {
    match task.status {
        JobStatus::Failed => JobEvent::error(
            task.task_id,
            task.error_log.clone().unwrap_or_else(|| "failed".into()),
            None,
        ),
        JobStatus::Canceled => JobEvent::canceled(task.task_id),
        _ => JobEvent::done(
            task.task_id,
            task.result.clone().unwrap_or(Value::Null),
            task.tokens_per_second.unwrap_or(0.0),
        ),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_version = state
        .db
        .sqlite_version()
        .unwrap_or_else(|_| "unknown".to_string());
    Json(json!({
        "status": "ok",
        "sqlite_version": sqlite_version,
        "uptime_sec": state.started.elapsed().as_secs(),
    }))
}
