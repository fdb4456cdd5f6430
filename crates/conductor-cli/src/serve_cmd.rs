//! `conductor serve`: the webhook/trigger/metrics HTTP surface plus the
//! three background queue consumers (`tasks`, `subtasks`, `notifications`)
//! that actually drive work forward.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use conductor_core::config::ProjectConfig;
use conductor_core::forge::{GitHubForgeClient, SourceForgeClient};
use conductor_core::harness::{ClaudeCodeAdapter, HarnessRegistry};
use conductor_core::queue::{ConsumerConfig, Queue};
use conductor_core::subtask_processor::{self, SubtaskProcessorContext};
use conductor_core::task_processor::{self, TaskProcessorContext};
use conductor_core::webhook::{self, WebhookContext, WebhookError};
use conductor_core::workspace::WorkspaceManager;
use conductor_db::queries::{agent_runs, notifications, subtasks, tasks};

use crate::config::ConductorConfig;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ServerState {
    pool: PgPool,
    task_queue: Queue,
    notification_queue: Queue,
    forge_client: Arc<dyn SourceForgeClient>,
    webhook_secret: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self { status, message: msg.into() }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{err:#}") }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/webhooks", post(handle_webhook))
        .route("/trigger", post(handle_trigger))
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health_live))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Start the HTTP server and the three background queue consumers. Runs
/// until Ctrl+C, then drains in-flight queue jobs before returning.
pub async fn run_serve(
    pool: PgPool,
    bind: &str,
    port: u16,
    workspace_root: &str,
    harness_name: &str,
    config: ConductorConfig,
) -> Result<()> {
    let forge_client: Arc<dyn SourceForgeClient> = Arc::new(GitHubForgeClient::new(
        config.github_app_id.clone(),
        config.github_private_key_pem.clone(),
    ));

    let task_queue = Queue::new(pool.clone(), "tasks");
    let subtask_queue = Queue::new(pool.clone(), "subtasks");
    let notification_queue = Queue::new(pool.clone(), "notifications");

    let state = Arc::new(ServerState {
        pool: pool.clone(),
        task_queue: task_queue.clone(),
        notification_queue: notification_queue.clone(),
        forge_client: Arc::clone(&forge_client),
        webhook_secret: config.webhook_secret.clone(),
    });

    let cancel = tokio_util::sync::CancellationToken::new();
    let workspace_manager = Arc::new(WorkspaceManager::new(PathBuf::from(workspace_root)));
    let mut registry = HarnessRegistry::new();
    registry.register(ClaudeCodeAdapter::new());
    let harness_registry = Arc::new(registry);

    let defaults = ProjectConfig::parse("version: \"1.0\"\n").expect("default config is valid");

    let tasks_handle = tokio::spawn(run_tasks_consumer(
        pool.clone(),
        task_queue.clone(),
        subtask_queue.clone(),
        notification_queue.clone(),
        Arc::clone(&forge_client),
        Arc::clone(&harness_registry),
        Arc::clone(&workspace_manager),
        harness_name.to_string(),
        cancel.clone(),
    ));
    let subtasks_handle = tokio::spawn(run_subtasks_consumer(
        pool.clone(),
        subtask_queue.clone(),
        Arc::clone(&forge_client),
        Arc::clone(&harness_registry),
        Arc::clone(&workspace_manager),
        harness_name.to_string(),
        defaults.max_parallel(),
        defaults.subtask_timeout(),
        cancel.clone(),
    ));
    let notifications_handle = tokio::spawn(run_notifications_consumer(pool.clone(), cancel.clone()));

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("conductor serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, draining queue consumers");
    cancel.cancel();
    let _ = tokio::join!(tasks_handle, subtasks_handle, notifications_handle);
    tracing::info!("conductor serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Queue consumers
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_tasks_consumer(
    pool: PgPool,
    task_queue: Queue,
    subtask_queue: Queue,
    notification_queue: Queue,
    forge_client: Arc<dyn SourceForgeClient>,
    harness_registry: Arc<HarnessRegistry>,
    workspace_manager: Arc<WorkspaceManager>,
    harness_name: String,
    cancel: tokio_util::sync::CancellationToken,
) {
    let config = ConsumerConfig { concurrency: 2, ..ConsumerConfig::default() };
    conductor_core::queue::run_consumer(pool.clone(), "tasks".to_string(), config, cancel, move |job| {
        let pool = pool.clone();
        let task_queue = task_queue.clone();
        let subtask_queue = subtask_queue.clone();
        let notification_queue = notification_queue.clone();
        let forge_client = Arc::clone(&forge_client);
        let harness_registry = Arc::clone(&harness_registry);
        let workspace_manager = Arc::clone(&workspace_manager);
        let harness_name = harness_name.clone();
        async move {
            let ctx = TaskProcessorContext {
                pool: &pool,
                task_queue: &task_queue,
                subtask_queue: &subtask_queue,
                notification_queue: &notification_queue,
                forge_client: forge_client.as_ref(),
                harness_registry: &harness_registry,
                workspace_manager: &workspace_manager,
                harness_name: &harness_name,
            };
            task_processor::handle_task_job(&ctx, &job).await
        }
    })
    .await;
}

#[derive(Debug, Deserialize)]
struct SubtaskJobPayload {
    subtask_id: Uuid,
    task_id: Uuid,
}

#[allow(clippy::too_many_arguments)]
async fn run_subtasks_consumer(
    pool: PgPool,
    subtask_queue: Queue,
    forge_client: Arc<dyn SourceForgeClient>,
    harness_registry: Arc<HarnessRegistry>,
    workspace_manager: Arc<WorkspaceManager>,
    harness_name: String,
    concurrency: usize,
    subtask_timeout: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let config = ConsumerConfig { concurrency, ..ConsumerConfig::default() };
    let branch_pattern = "conductor/{task_id}/{short_description}".to_string();
    conductor_core::queue::run_consumer(pool.clone(), subtask_queue.name().to_string(), config, cancel, move |job| {
        let pool = pool.clone();
        let forge_client = Arc::clone(&forge_client);
        let harness_registry = Arc::clone(&harness_registry);
        let workspace_manager = Arc::clone(&workspace_manager);
        let harness_name = harness_name.clone();
        let branch_pattern = branch_pattern.clone();
        async move {
            let payload: SubtaskJobPayload =
                serde_json::from_value(job.payload.0.clone()).context("invalid subtask job payload")?;
            let task = tasks::get_task(&pool, payload.task_id)
                .await?
                .with_context(|| format!("task {} not found", payload.task_id))?;
            let ctx = SubtaskProcessorContext {
                pool: &pool,
                workspace_manager: &workspace_manager,
                harness_registry: &harness_registry,
                forge_client: forge_client.as_ref(),
                harness_name: &harness_name,
                branch_pattern: &branch_pattern,
                subtask_timeout,
            };
            subtask_processor::process_subtask(&ctx, &task, payload.subtask_id).await
        }
    })
    .await;
}

/// Notification transports themselves are out of scope here; the consumer's
/// only job is to mark each queued notification as sent so it drops out of
/// `list_unsent`.
async fn run_notifications_consumer(pool: PgPool, cancel: tokio_util::sync::CancellationToken) {
    let config = ConsumerConfig::default();
    conductor_core::queue::run_consumer(pool.clone(), "notifications".to_string(), config, cancel, move |job| {
        let pool = pool.clone();
        async move {
            let notification_id = job
                .job_id
                .strip_prefix("notify-")
                .context("notification job id missing notify- prefix")?;
            let id = Uuid::parse_str(notification_id).context("notification job id is not a UUID")?;
            notifications::mark_sent(&pool, id).await?;
            Ok(())
        }
    })
    .await;
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_webhook(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<axum::response::Response, AppError> {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing signature header"))?;

    webhook::verify_signature(&state.webhook_secret, &body, signature).map_err(|e| match e {
        WebhookError::SignatureMismatch | WebhookError::MalformedSignature | WebhookError::MissingSignature => {
            AppError::new(StatusCode::UNAUTHORIZED, e.to_string())
        }
    })?;

    let event_type = headers
        .get("X-Conductor-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("board_item")
        .to_string();

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))?;

    let ctx = WebhookContext {
        pool: &state.pool,
        task_queue: &state.task_queue,
        notification_queue: &state.notification_queue,
        forge_client: state.forge_client.as_ref(),
    };

    let reply = match event_type.as_str() {
        "pull_request" => {
            webhook::handle_pull_request_event(&ctx, &payload).await.map_err(AppError::internal)?;
            None
        }
        "issue_comment" => webhook::handle_issue_comment_event(&ctx, &payload).await.map_err(AppError::internal)?,
        _ => {
            webhook::handle_board_event(&ctx, &payload).await.map_err(AppError::internal)?;
            None
        }
    };

    Ok(Json(serde_json::json!({ "ok": true, "reply": reply })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    repository_full_name: String,
    installation_id: i64,
    title: String,
    description: Option<String>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    task_id: Uuid,
    status: String,
}

async fn handle_trigger(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<TriggerRequest>,
) -> Result<axum::response::Response, AppError> {
    let task = tasks::insert_task(
        &state.pool,
        &format!("manual-{}", Uuid::new_v4()),
        "",
        &req.repository_full_name,
        0,
        req.installation_id,
        &req.title,
        req.description.as_deref().unwrap_or(""),
    )
    .await
    .map_err(AppError::internal)?;

    state
        .task_queue
        .enqueue(
            &format!("decompose-{}", task.id),
            serde_json::json!({ "task_id": task.id, "action": "decompose" }),
            3,
        )
        .await
        .map_err(AppError::internal)?;

    Ok((
        StatusCode::CREATED,
        Json(TriggerResponse { task_id: task.id, status: task.status.to_string() }),
    )
        .into_response())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn health_live() -> impl IntoResponse {
    StatusCode::OK
}

async fn health_ready(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics(State(state): State<Arc<ServerState>>) -> Result<axum::response::Response, AppError> {
    let task_counts = tasks::count_by_status(&state.pool).await.map_err(AppError::internal)?;
    let subtask_counts = subtasks::count_by_status(&state.pool).await.map_err(AppError::internal)?;
    let run_counts = agent_runs::count_by_type(&state.pool).await.map_err(AppError::internal)?;
    let (input_tokens, output_tokens, cost_usd) =
        agent_runs::global_totals(&state.pool).await.map_err(AppError::internal)?;
    let avg_duration = tasks::average_duration_seconds(&state.pool).await.map_err(AppError::internal)?;

    let mut body = String::new();
    body.push_str("# HELP conductor_tasks_total Tasks by status.\n# TYPE conductor_tasks_total gauge\n");
    for (status, count) in &task_counts {
        body.push_str(&format!("conductor_tasks_total{{status=\"{status}\"}} {count}\n"));
    }
    body.push_str("# HELP conductor_subtasks_total Subtasks by status.\n# TYPE conductor_subtasks_total gauge\n");
    for (status, count) in &subtask_counts {
        body.push_str(&format!("conductor_subtasks_total{{status=\"{status}\"}} {count}\n"));
    }
    body.push_str("# HELP conductor_agent_runs_total Agent runs by type.\n# TYPE conductor_agent_runs_total gauge\n");
    for (run_type, count) in &run_counts {
        body.push_str(&format!("conductor_agent_runs_total{{type=\"{run_type}\"}} {count}\n"));
    }
    body.push_str("# HELP conductor_tokens_total Tokens consumed across every agent run.\n# TYPE conductor_tokens_total counter\n");
    body.push_str(&format!("conductor_tokens_total{{direction=\"input\"}} {input_tokens}\n"));
    body.push_str(&format!("conductor_tokens_total{{direction=\"output\"}} {output_tokens}\n"));
    body.push_str("# HELP conductor_cost_usd_total Estimated USD cost across every agent run.\n# TYPE conductor_cost_usd_total counter\n");
    body.push_str(&format!("conductor_cost_usd_total {cost_usd}\n"));
    if let Some(avg) = avg_duration {
        body.push_str(
            "# HELP conductor_task_duration_seconds_avg Average wall-clock duration of completed tasks.\n# TYPE conductor_task_duration_seconds_avg gauge\n",
        );
        body.push_str(&format!("conductor_task_duration_seconds_avg {avg}\n"));
    }

    Ok(([("content-type", "text/plain; version=0.0.4")], body).into_response())
}
