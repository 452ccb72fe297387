//! Compute grid dispatcher.
//!
//! Serves the submission protocol over HTTP: submit, query, stream and cancel tasks, plus grid
//! status and an operator circuit reset. Every call except the public allow-list passes through
//! [`interceptor::authenticate`]. Background loops dispatch queued work to execution backends,
//! age starving tasks and drop expired terminal tasks.

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::stream::{Stream, StreamExt};
use grid_core::auth::keys::HttpKeySource;
use grid_core::auth::{IssuersFile, TokenValidator};
use grid_core::breaker::{CircuitBreaker, CircuitSnapshot};
use grid_core::executor::{ExecutorRegistry, Executors};
use grid_core::role::Capability;
use grid_core::scheduler::{PriorityTaskScheduler, SchedulerError};
use grid_core::task::NewTask;
use grid_core::{Priority, Role, TaskId, TaskResult, TaskState};
use interceptor::Caller;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::{watch, Notify},
    task::JoinHandle,
};

pub mod config;
pub mod dispatch;
pub mod interceptor;
mod stream;

use config::GridConfig;
use dispatch::DispatchOptions;

const REAPER_INTERVAL_CAP: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<PriorityTaskScheduler>,
    pub validator: Arc<TokenValidator>,
    pub executors: Executors,
    pub default_backend: String,
    pub public_methods: Arc<[String]>,
    pub dispatch_slots: usize,
    /// Signalled when new work may be dispatchable.
    pub wakeup: Arc<Notify>,
    /// Flipped to `true` once on shutdown; ends background loops and open result streams.
    pub shutdown: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("validator", &self.validator)
            .field("executors", &self.executors)
            .field("default_backend", &self.default_backend)
            .field("public_methods", &self.public_methods)
            .field("dispatch_slots", &self.dispatch_slots)
            .finish_non_exhaustive()
    }
}

/// Load issuers and backends from `cfg` and assemble the shared state.
pub fn build_state(cfg: &GridConfig) -> anyhow::Result<AppState> {
    let issuers = IssuersFile::load(&cfg.issuers_file).context("load issuers file")?;
    let source = HttpKeySource::new(cfg.keyset_fetch_timeout()).context("init key source")?;
    let validator = TokenValidator::new(issuers.issuers, Arc::new(source), cfg.cache_policy())
        .context("init token validator")?;
    build_state_with(cfg, validator, &ExecutorRegistry::builtin())
}

/// Assemble state from an already-built validator and registry.
pub fn build_state_with(
    cfg: &GridConfig,
    validator: TokenValidator,
    registry: &ExecutorRegistry,
) -> anyhow::Result<AppState> {
    let executors = registry.build(&cfg.backend_settings());
    if !executors.contains(&cfg.default_backend) {
        anyhow::bail!(
            "default backend {:?} is not available (known: {:?})",
            cfg.default_backend,
            registry.names().collect::<Vec<_>>()
        );
    }

    let breaker = Arc::new(CircuitBreaker::new(
        cfg.circuit_breaker_failure_threshold,
        cfg.breaker_cooldown(),
    ));
    let scheduler = Arc::new(PriorityTaskScheduler::new(cfg.scheduler_config(), breaker));

    Ok(AppState {
        scheduler,
        validator: Arc::new(validator),
        executors,
        default_backend: cfg.default_backend.clone(),
        public_methods: cfg.public_methods.clone().into(),
        dispatch_slots: cfg.dispatch_concurrency.max(1),
        wakeup: Arc::new(Notify::new()),
        shutdown: Arc::new(watch::channel(false).0),
    })
}

pub fn dispatch_options(cfg: &GridConfig) -> DispatchOptions {
    DispatchOptions {
        concurrency: cfg.dispatch_concurrency.max(1),
        poll_interval: Duration::from_millis(cfg.dispatch_poll_ms.max(1)),
        aging_interval: Duration::from_millis(cfg.aging_interval_ms.max(1)),
        reaper_interval: Duration::from_millis(cfg.retention_ms.max(1)).min(REAPER_INTERVAL_CAP),
    }
}

pub fn router(state: AppState) -> Router {
    let auth = middleware::from_fn_with_state(state.clone(), interceptor::authenticate);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/tasks", post(submit_task))
        .route("/v1/tasks/:task_id", get(get_task))
        .route("/v1/tasks/:task_id/stream", get(stream_results))
        .route("/v1/tasks/:task_id/cancel", post(cancel_task))
        .route("/v1/status", get(get_status))
        .route("/v1/admin/circuit/reset", post(reset_circuit))
        .layer(auth)
        .with_state(state)
}

#[derive(Debug)]
pub struct GridServer {
    pub addr: SocketAddr,
    shutdown_tx: Arc<watch::Sender<bool>>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl GridServer {
    pub async fn start(
        state: AppState,
        bind: SocketAddr,
        opts: DispatchOptions,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind grid dispatcher to {bind}"))?;
        let addr = listener.local_addr().context("grid dispatcher local_addr")?;

        let shutdown_tx = state.shutdown.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let join = tokio::spawn(run_server(
            listener,
            state,
            opts,
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown_tx.send_replace(true);
        self.join.await.context("join grid dispatcher task")??;
        Ok(())
    }
}

async fn run_server(
    listener: TcpListener,
    state: AppState,
    opts: DispatchOptions,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bg: Vec<JoinHandle<anyhow::Result<()>>> = vec![
        tokio::spawn(dispatch::dispatch_loop(
            state.clone(),
            opts.clone(),
            shutdown_rx.clone(),
        )),
        tokio::spawn(dispatch::aging_loop(
            state.clone(),
            opts.aging_interval,
            shutdown_rx.clone(),
        )),
        tokio::spawn(dispatch::retention_loop(
            state.clone(),
            opts.reaper_interval,
            shutdown_rx.clone(),
        )),
    ];

    let app = router(state);
    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    // Background loops stop whenever the server ends, including on error.
    let server_res = server.await;
    shutdown_tx.send_replace(true);

    for h in bg {
        match h.await {
            Ok(Err(err)) => tracing::warn!(
                event = "grid.server.loop_error",
                error = %format!("{err:#}"),
                "background loop exited with error"
            ),
            Err(err) => tracing::warn!(
                event = "grid.server.loop_panicked",
                error = %err,
                "background loop panicked"
            ),
            Ok(Ok(())) => {}
        }
    }

    server_res.context("grid dispatcher serve")?;
    Ok(())
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SubmitTaskRequest {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub backend: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
    pub status: TaskState,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GridStatusResponse {
    pub active_workers: usize,
    pub queued_tasks: usize,
    pub worker_slots: usize,
    pub circuit: CircuitSnapshot,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn submit_task(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitTaskResponse>, ApiError> {
    ctx.require(Capability::Submit)?;

    let id = match req.task_id {
        Some(id) if id.trim().is_empty() => return Err(ApiError::bad_request("empty task_id")),
        Some(id) => TaskId::new(id),
        None => TaskId::generate(),
    };
    let backend = req
        .backend
        .unwrap_or_else(|| state.default_backend.clone());
    if !state.executors.contains(&backend) {
        return Err(ApiError::bad_request(format!("unknown backend: {backend}")));
    }

    let accepted = state
        .scheduler
        .enqueue(
            NewTask {
                id,
                payload: req.payload,
                priority: req.priority,
                backend,
                owner_role: ctx.role(),
                owner_subject: ctx.principal.subject.clone(),
            },
            Utc::now(),
        )
        .map_err(ApiError::from)?;
    state.wakeup.notify_one();

    tracing::info!(
        event = "grid.submission.accepted",
        task_id = %accepted.task_id,
        subject = %ctx.principal.subject,
        priority = ?accepted.priority,
        "task submitted"
    );
    Ok(Json(SubmitTaskResponse {
        task_id: accepted.task_id,
        status: accepted.status,
    }))
}

async fn get_task(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResult>, ApiError> {
    ctx.require(Capability::View)?;
    let result = state
        .scheduler
        .query(&TaskId::new(task_id))
        .map_err(ApiError::from)?;
    Ok(Json(result))
}

async fn stream_results(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(task_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    ctx.require(Capability::View)?;
    let (initial, rx) = state
        .scheduler
        .watch(&TaskId::new(task_id))
        .map_err(ApiError::from)?;

    let events = stream::task_results(state.scheduler.clone(), initial, rx)
        .take_until(shutting_down(state.shutdown.subscribe()))
        .map(|result| Event::default().event("task").json_data(&result));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn shutting_down(mut rx: watch::Receiver<bool>) {
    // A dropped sender also counts as shutdown.
    let _ = rx.wait_for(|closing| *closing).await;
}

async fn cancel_task(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResult>, ApiError> {
    ctx.require(Capability::Submit)?;
    let cancelled = state
        .scheduler
        .cancel(&TaskId::new(task_id), Utc::now())
        .map_err(ApiError::from)?;
    tracing::info!(
        event = "grid.submission.cancelled",
        task_id = %cancelled.result.task_id,
        subject = %ctx.principal.subject,
        previous = %cancelled.previous,
        "task cancel requested"
    );
    Ok(Json(cancelled.result))
}

async fn get_status(
    State(state): State<AppState>,
    Caller(ctx): Caller,
) -> Result<Json<GridStatusResponse>, ApiError> {
    ctx.require(Capability::View)?;
    let status = state.scheduler.status();
    Ok(Json(GridStatusResponse {
        active_workers: status.running,
        queued_tasks: status.queued,
        worker_slots: state.dispatch_slots,
        circuit: status.circuit,
    }))
}

async fn reset_circuit(
    State(state): State<AppState>,
    Caller(ctx): Caller,
) -> Result<Json<CircuitSnapshot>, ApiError> {
    ctx.require(Capability::ManageWorkers)?;
    let breaker = state.scheduler.breaker();
    breaker.reset();
    state.wakeup.notify_one();
    tracing::warn!(
        event = "grid.admin.circuit_reset",
        subject = %ctx.principal.subject,
        "circuit breaker reset by operator"
    );
    Ok(Json(breaker.snapshot()))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: Cow<'static, str>,
    required_roles: Option<Vec<Role>>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            message: message.into(),
            required_roles: None,
        }
    }

    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: &'static str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn permission_denied(required_roles: Vec<Role>) -> Self {
        let names: Vec<&str> = required_roles.iter().map(|r| r.as_str()).collect();
        Self {
            status: StatusCode::FORBIDDEN,
            message: format!("permission denied: requires one of {}", names.join(", ")).into(),
            required_roles: Some(required_roles),
        }
    }

    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: &'static str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn required_roles(&self) -> Option<&[Role]> {
        self.required_roles.as_deref()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match &err {
            SchedulerError::NotFound(_) => Self::not_found(err.to_string()),
            SchedulerError::DuplicateId(_) | SchedulerError::InvalidTransition { .. } => {
                Self::conflict(err.to_string())
            }
            SchedulerError::SubmitNotPermitted(_) => {
                Self::permission_denied(Capability::Submit.granted_to())
            }
            SchedulerError::CircuitOpen(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self.required_roles {
            Some(roles) => json!({ "error": self.message, "required_roles": roles }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}
