use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use gpulease_core::client::GpuOrchestrator;
use gpulease_core::infrastructure::{shared, SharedStateStore};
use gpulease_core::infrastructure_in_memory::InMemoryStateStore;
use gpulease_core::types::{GroupHealth, HandoffRecord, LeaseGrant, LeaseStatus};
use gpulease_core::Error;

use crate::config::Settings;
use crate::handlers::*;

pub type AppState = Arc<GpuOrchestrator>;

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub storage: String,
    pub settings: Settings,
    pub api_key: Option<String>,
    pub max_concurrency: usize,
}

pub async fn run(opts: ServeOptions) -> anyhow::Result<()> {
    let store = create_store(&opts.storage)?;
    let collaborators = crate::collaborators::build(&opts.settings)?;
    let orchestrator = GpuOrchestrator::open(
        store,
        opts.settings.groups.clone(),
        collaborators,
        opts.settings.orchestrator(),
    )?;

    let recovery = orchestrator.recovery();
    if !recovery.is_clean() {
        tracing::warn!(
            interrupted = recovery.interrupted.len(),
            "handoffs interrupted by the last shutdown were marked FAILED"
        );
    }
    if opts.settings.groups.is_empty() {
        tracing::warn!("no service groups configured, health watchdog has nothing to probe");
    }

    let cancel = CancellationToken::new();
    let watchdog = orchestrator.start_watchdog(cancel.clone());
    let state: AppState = Arc::new(orchestrator);

    if opts.api_key.is_some() {
        tracing::info!("🔐 API key authentication enabled");
    } else {
        tracing::warn!("⚠️  No GPULEASE_API_KEY set, server is open (dev mode)");
    }

    let app = router(state, opts.api_key.map(Arc::from), opts.max_concurrency);

    let addr = format!("{}:{}", opts.host, opts.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("🔒 gpulease server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    cancel.cancel();
    if let Err(e) = watchdog.await {
        tracing::error!(error = %e, "health watchdog task panicked");
    }
    Ok(())
}

pub fn router(state: AppState, api_key: Option<Arc<str>>, max_concurrency: usize) -> Router {
    Router::new()
        // Health is always open (no auth)
        .route("/health", get(health))
        .route("/lease", get(lease_status))
        .route("/lease/acquire", post(acquire_lease))
        .route("/lease/force-release", post(force_release))
        .route("/lease/{id}", delete(release_lease))
        .route("/handoffs", post(start_handoff).get(list_handoffs))
        .route("/handoffs/{id}", get(get_handoff))
        .route("/handoffs/{id}/abort", post(abort_handoff))
        .route("/ha", get(ha_status))
        .route("/ha/{group}/failback", post(failback))
        .route("/events", get(events))
        .layer(middleware::from_fn_with_state(api_key, auth_middleware))
        .layer(ConcurrencyLimitLayer::new(max_concurrency.max(1)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

// ─── Auth Middleware ────────────────────────────────────────────────────────

async fn auth_middleware(
    State(api_key): State<Option<Arc<str>>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // No key configured: dev mode
    let Some(expected) = api_key else {
        return Ok(next.run(request).await);
    };

    if request.uri().path() == "/health" {
        return Ok(next.run(request).await);
    }

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if token == &*expected {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("🚫 Unauthorized request to {}", request.uri().path());
        Err(StatusCode::UNAUTHORIZED)
    }
}

// ─── Error Mapping ──────────────────────────────────────────────────────────

/// A failed handoff answers with the status of its underlying cause.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::HandoffFailed { cause, .. } => status_for(cause),
        Error::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
        Error::NotOwner { .. } => StatusCode::FORBIDDEN,
        Error::HandoffInProgress { .. }
        | Error::AbortTooLate { .. }
        | Error::PrimaryUnhealthy(_)
        | Error::Aborted => StatusCode::CONFLICT,
        Error::HandoffNotFound(_) | Error::UnknownGroup(_) => StatusCode::NOT_FOUND,
        Error::Collaborator(_) => StatusCode::BAD_GATEWAY,
        Error::InterruptedByRestart | Error::Cancelled | Error::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn failure<T: Serialize>(err: Error) -> Reply<T> {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (status, Json(ApiResponse::err(err.to_string())))
}

fn bad_request<T: Serialize>(msg: String) -> Reply<T> {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::err(msg)))
}

fn ok<T: Serialize>(data: T) -> Reply<T> {
    (StatusCode::OK, Json(ApiResponse::ok(data)))
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let status = state.registry().status();
    Json(ApiResponse::ok(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        lease_owner: status.lease.map(|l| l.owner),
        queue_depth: status.queue_depth,
        active_handoff: state.coordinator().active(),
    }))
}

async fn lease_status(State(state): State<AppState>) -> Reply<LeaseStatus> {
    ok(state.registry().status())
}

/// Long-polls up to `max_wait_ms`. A client that disconnects gives up its
/// queue slot.
async fn acquire_lease(
    State(state): State<AppState>,
    Json(req): Json<AcquireLeaseRequest>,
) -> Reply<LeaseGrant> {
    if let Err(e) = req.validate() {
        return bad_request(e);
    }

    let registry = state.registry();
    let max_wait = req
        .max_wait_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or(registry.config().default_max_wait);

    match registry.acquire(&req.service_id(), &req.reason, max_wait).await {
        Ok(grant) if grant.existing => ok(grant),
        Ok(grant) => (StatusCode::CREATED, Json(ApiResponse::ok(grant))),
        Err(e) => failure(e),
    }
}

async fn release_lease(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Reply<ReleaseResponse> {
    match state.registry().release(id) {
        Ok(next) => ok(ReleaseResponse { next }),
        Err(e) => failure(e),
    }
}

async fn force_release(State(state): State<AppState>) -> Reply<ForceReleaseResponse> {
    match state.registry().force_release() {
        Ok(released) => ok(ForceReleaseResponse {
            released,
            next: state.registry().current(),
        }),
        Err(e) => failure(e),
    }
}

/// Answers 202 with the INITIATED record; the handoff runs in the background.
async fn start_handoff(
    State(state): State<AppState>,
    Json(req): Json<StartHandoffRequest>,
) -> Reply<HandoffRecord> {
    let kind = match req.parse() {
        Ok(kind) => kind,
        Err(e) => return bad_request(e),
    };

    match state.coordinator().spawn(kind) {
        Ok((record, _task)) => (StatusCode::ACCEPTED, Json(ApiResponse::ok(record))),
        Err(e) => failure(e),
    }
}

async fn list_handoffs(State(state): State<AppState>) -> Reply<Vec<HandoffRecord>> {
    match state.coordinator().history() {
        Ok(history) => ok(history),
        Err(e) => failure(e),
    }
}

async fn get_handoff(State(state): State<AppState>, Path(id): Path<Uuid>) -> Reply<HandoffRecord> {
    match state.coordinator().get(id) {
        Ok(record) => ok(record),
        Err(e) => failure(e),
    }
}

async fn abort_handoff(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Reply<HandoffRecord> {
    let coordinator = state.coordinator();
    match coordinator.abort(id).and_then(|()| coordinator.get(id)) {
        Ok(record) => (StatusCode::ACCEPTED, Json(ApiResponse::ok(record))),
        Err(e) => failure(e),
    }
}

async fn ha_status(State(state): State<AppState>) -> Reply<Vec<GroupHealth>> {
    ok(state.watchdog().groups())
}

async fn failback(State(state): State<AppState>, Path(group): Path<String>) -> Reply<GroupHealth> {
    match state.watchdog().failback(&group) {
        Ok(health) => ok(health),
        Err(e) => failure(e),
    }
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.events().receiver()).filter_map(|item| match item {
        Ok(event) => SseEvent::default()
            .event(event.kind.as_str())
            .json_data(&event)
            .ok()
            .map(Ok::<_, Infallible>),
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            tracing::warn!(missed, "SSE subscriber lagging, oldest events dropped");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ─── Storage Backend Selection ──────────────────────────────────────────────

pub fn create_store(storage: &str) -> anyhow::Result<SharedStateStore> {
    if storage == "memory" {
        tracing::info!("💾 Storage backend: in-memory (state will not survive restarts)");
        return Ok(shared(InMemoryStateStore::new()));
    }

    if let Some(path) = storage.strip_prefix("sqlite:") {
        #[cfg(feature = "sqlite")]
        {
            tracing::info!("💾 Storage backend: SQLite ({})", path);
            let store = gpulease_core::infrastructure_sqlite::SqliteStateStore::open(path)
                .with_context(|| format!("failed to open SQLite store at '{path}'"))?;
            return Ok(shared(store));
        }
        #[cfg(not(feature = "sqlite"))]
        {
            let _ = path;
            anyhow::bail!(
                "SQLite storage requested but the `sqlite` feature is not enabled. \
                 Rebuild with: cargo build --features sqlite"
            );
        }
    }

    anyhow::bail!("Unknown storage backend: '{storage}'. Use 'memory' or 'sqlite:<path>'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use gpulease_core::client::OrchestratorConfig;
    use tower::ServiceExt;

    fn app(api_key: Option<&str>) -> Router {
        let collaborators = crate::collaborators::build(&Settings::default()).unwrap();
        let orchestrator =
            GpuOrchestrator::in_memory(Vec::new(), collaborators, OrchestratorConfig::default())
                .unwrap();
        router(Arc::new(orchestrator), api_key.map(Arc::from), 16)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open_with_auth_enabled() {
        let app = app(Some("secret"));

        let health = app.clone().oneshot(request("GET", "/health", None)).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let denied = app.clone().oneshot(request("GET", "/lease", None)).await.unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut authed = request("GET", "/lease", None);
        authed
            .headers_mut()
            .insert("authorization", "Bearer secret".parse().unwrap());
        let allowed = app.oneshot(authed).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_acquire_and_release_over_http() {
        let app = app(None);
        let body = serde_json::json!({"service": "study", "reason": "training"});

        let created = app
            .clone()
            .oneshot(request("POST", "/lease/acquire", Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let grant = json_body(created).await;
        let lease_id = grant["data"]["lease"]["lease_id"].as_str().unwrap().to_string();

        let again = app
            .clone()
            .oneshot(request("POST", "/lease/acquire", Some(body)))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        assert_eq!(json_body(again).await["data"]["existing"], true);

        let foreign = app
            .clone()
            .oneshot(request("DELETE", &format!("/lease/{}", Uuid::new_v4()), None))
            .await
            .unwrap();
        assert_eq!(foreign.status(), StatusCode::FORBIDDEN);

        let released = app
            .oneshot(request("DELETE", &format!("/lease/{lease_id}"), None))
            .await
            .unwrap();
        assert_eq!(released.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let app = app(None);

        let bad_kind = app
            .clone()
            .oneshot(request(
                "POST",
                "/handoffs",
                Some(serde_json::json!({"kind": "sideways"})),
            ))
            .await
            .unwrap();
        assert_eq!(bad_kind.status(), StatusCode::BAD_REQUEST);

        let missing = app
            .clone()
            .oneshot(request("GET", &format!("/handoffs/{}", Uuid::new_v4()), None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let unknown_group = app
            .oneshot(request("POST", "/ha/nope/failback", None))
            .await
            .unwrap();
        assert_eq!(unknown_group.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&Error::Timeout {
                operation: "lease acquire".into(),
                after_ms: 10
            }),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            status_for(&Error::HandoffInProgress {
                active: Uuid::new_v4()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&Error::Cancelled), StatusCode::INTERNAL_SERVER_ERROR);

        let cleanup_timeout = Error::HandoffFailed {
            handoff_id: Uuid::new_v4(),
            phase: gpulease_core::types::Phase::CleanupWait,
            lease_committed: false,
            reason: "GPU memory cleanup timed out after 60000ms".into(),
            cause: Box::new(Error::Timeout {
                operation: "GPU memory cleanup".into(),
                after_ms: 60_000,
            }),
        };
        assert_eq!(status_for(&cleanup_timeout), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(status_for(&Error::Aborted), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_handoff_from_wrong_owner_is_refused() {
        let app = app(None);
        let body = serde_json::json!({"service": "study", "reason": "training"});
        let created = app
            .clone()
            .oneshot(request("POST", "/lease/acquire", Some(body)))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let refused = app
            .clone()
            .oneshot(request(
                "POST",
                "/handoffs",
                Some(serde_json::json!({"kind": "prime_to_study"})),
            ))
            .await
            .unwrap();
        assert_eq!(refused.status(), StatusCode::FORBIDDEN);

        let history = app.oneshot(request("GET", "/handoffs", None)).await.unwrap();
        assert_eq!(json_body(history).await["data"], serde_json::json!([]));
    }

    #[test]
    fn test_storage_backend_selection() {
        assert!(create_store("memory").is_ok());
        assert!(create_store("redis://localhost").is_err());
    }
}
