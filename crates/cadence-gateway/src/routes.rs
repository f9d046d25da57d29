//! API route handlers for the gateway.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{FromRequest, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use cadence_core::error::{CadenceError, ErrorKind};
use cadence_core::lead::LeadRecord;
use cadence_core::types::{ControlAction, DraftState};
use cadence_scheduler::{
    ControlScope, DraftSubmission, IngestOutcome, LaunchRequest, RunStatus,
};
use cadence_trigger::{bearer_matches, secret_matches};

use crate::server::AppState;

type ApiResult = std::result::Result<Json<Value>, ApiError>;

/// A failure rendered as `{"ok": false, "reason", "hint", "error", "debug"}`.
pub struct ApiError(pub CadenceError);

impl From<CadenceError> for ApiError {
    fn from(e: CadenceError) -> Self {
        Self(e)
    }
}

fn status_for(err: &CadenceError) -> StatusCode {
    match err {
        CadenceError::RunAlreadyActive { .. }
        | CadenceError::AlreadySent { .. }
        | CadenceError::ApprovalInProgress { .. } => StatusCode::CONFLICT,
        _ => match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::IllegalTransition | ErrorKind::CapacityBlocked => StatusCode::CONFLICT,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::ProviderFailure if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ProviderFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::ConfigurationMissing => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!("⚠️ Request failed ({status}): {}", self.0);
        }
        let body = json!({
            "ok": false,
            "reason": self.0.reason(),
            "hint": self.0.hint(),
            "error": self.0.to_string(),
            "debug": self.0.debug(),
        });
        (status, Json(body)).into_response()
    }
}

/// JSON body extractor whose rejections come back as validation errors in
/// the API error shape.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(CadenceError::Validation(format!(
                "invalid request body: {}",
                rejection.body_text()
            ))
            .into()),
        }
    }
}

pub(crate) fn unauthorized(message: &str) -> Response {
    ApiError(CadenceError::Unauthorized(message.to_string())).into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn required(field: &str, value: &str) -> std::result::Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(CadenceError::Validation(format!("{field} is required")).into());
    }
    Ok(())
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "cadence",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ---- Scheduler ----

#[derive(Debug, Default, Deserialize)]
struct TickBody {
    #[serde(default, alias = "maxRuns", alias = "maxRunsToAdvance")]
    max_runs: Option<u32>,
}

/// Tick entry point. Bearer-guarded when a trigger secret is configured.
pub async fn scheduler_tick(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.config.trigger.secret.as_deref()
        && !bearer_matches(header(&headers, "authorization"), secret)
    {
        return unauthorized("missing or invalid bearer token");
    }

    let body: TickBody = if body.iter().all(u8::is_ascii_whitespace) {
        TickBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(e) => {
                return ApiError(CadenceError::Validation(format!("invalid tick body: {e}")))
                    .into_response();
            }
        }
    };
    let max_runs = body
        .max_runs
        .unwrap_or(state.config.scheduler.max_runs_per_tick);

    match state.scheduler.tick(max_runs).await {
        Ok(report) => Json(json!({ "ok": true, "report": report })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// Operator-initiated tick; status mirrors the invocation outcome.
pub async fn manual_trigger(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let result = state
        .invoker
        .invoke_manual(header(&headers, "authorization"))
        .await;
    let status = if result.ok {
        StatusCode::OK
    } else if result.reason.as_deref() == Some("unauthorized") {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result)).into_response()
}

// ---- Webhooks ----

#[derive(Debug, Deserialize)]
pub struct LeadBatch {
    #[serde(default, alias = "externalRunId", alias = "runId")]
    pub external_run_id: String,
    #[serde(default)]
    pub leads: Vec<LeadRecord>,
}

/// Lead-enrichment delivery. Unknown or closed runs answer `ok: false`
/// with 200 so the pipeline does not redeliver.
pub async fn ingest_leads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(batch): ApiJson<LeadBatch>,
) -> ApiResult {
    if let Some(secret) = state.config.webhook.shared_secret.as_deref()
        && !secret_matches(header(&headers, "X-Webhook-Secret"), secret)
    {
        return Err(CadenceError::Unauthorized("invalid webhook secret".into()).into());
    }

    let outcome = state.ingestor.ingest(&batch.external_run_id, batch.leads)?;
    Ok(Json(match outcome {
        IngestOutcome::Merged(r) => json!({
            "ok": true,
            "runId": r.run_id,
            "received": r.received,
            "inserted": r.inserted,
            "updated": r.updated,
            "unchanged": r.unchanged,
            "rejected": r.rejected,
            "poolSize": r.pool_size,
        }),
        IngestOutcome::UnknownRun => json!({ "ok": false, "reason": "unknown_run" }),
        IngestOutcome::RunClosed { run_id, state } => json!({
            "ok": false,
            "reason": "run_closed",
            "runId": run_id,
            "state": state,
        }),
    }))
}

// ---- Runs ----

pub async fn launch_run(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<LaunchRequest>,
) -> ApiResult {
    let receipt = state.launcher.launch(req).await?;
    Ok(Json(json!({
        "ok": true,
        "runId": receipt.run_id,
        "state": receipt.state,
        "leadsSeeded": receipt.leads_seeded,
        "limits": receipt.limits,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RunListQuery {
    #[serde(alias = "brandId")]
    pub brand: Option<String>,
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RunListQuery>,
) -> Json<Value> {
    state.nudger.nudge();
    let now = Utc::now();
    let records = match q.brand.as_deref() {
        Some(brand) => state.store.list_by_brand(brand),
        None => state.store.list(),
    };
    let runs: Vec<RunStatus> = records.iter().map(|r| RunStatus::of(r, now)).collect();
    Json(json!({ "ok": true, "count": runs.len(), "runs": runs }))
}

pub async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    state.nudger.nudge();
    let status = state
        .store
        .status(&id, Utc::now())
        .ok_or_else(|| CadenceError::not_found("run", &id))?;
    Ok(Json(json!({ "ok": true, "status": status })))
}

#[derive(Debug, Deserialize)]
pub struct ControlBody {
    pub action: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, alias = "brandId")]
    pub brand_id: String,
    #[serde(default, alias = "experimentId")]
    pub experiment_id: Option<String>,
}

pub async fn control_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ControlBody>,
) -> ApiResult {
    required("brand_id", &body.brand_id)?;
    let action: ControlAction = body.action.parse()?;
    let scope = ControlScope {
        brand_id: body.brand_id,
        experiment_id: body.experiment_id,
    };
    let outcome = state.control.control(&scope, &id, action, body.reason)?;
    Ok(Json(json!({
        "ok": true,
        "runId": outcome.run_id,
        "action": outcome.action.as_str(),
        "from": outcome.from,
        "to": outcome.to,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExternalLinkBody {
    #[serde(default, alias = "externalRunId")]
    pub external_run_id: String,
}

pub async fn link_external_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ExternalLinkBody>,
) -> ApiResult {
    required("external_run_id", &body.external_run_id)?;
    let record = state.store.link_external(&id, &body.external_run_id)?;
    Ok(Json(json!({
        "ok": true,
        "runId": record.run.id,
        "externalRunId": record.run.external_run_id,
    })))
}

// ---- Replies ----

pub async fn submit_reply(
    State(state): State<Arc<AppState>>,
    ApiJson(submission): ApiJson<DraftSubmission>,
) -> ApiResult {
    let draft = state.approver.drafts().submit(submission)?;
    Ok(Json(json!({ "ok": true, "draft": draft })))
}

#[derive(Debug, Deserialize)]
pub struct ReplyListQuery {
    #[serde(alias = "brandId")]
    pub brand: Option<String>,
    pub state: Option<DraftState>,
}

pub async fn list_replies(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ReplyListQuery>,
) -> Json<Value> {
    let drafts = state.approver.drafts().list(q.brand.as_deref(), q.state);
    Json(json!({ "ok": true, "count": drafts.len(), "drafts": drafts }))
}

pub async fn approve_reply(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let approval = state.approver.approve_and_send(&id).await?;
    Ok(Json(json!({
        "ok": true,
        "draftId": approval.draft_id,
        "receipt": approval.receipt,
    })))
}

// ---- Audit & providers ----

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

pub async fn audit_log(State(state): State<Arc<AppState>>, Query(q): Query<AuditQuery>) -> ApiResult {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let entries = match &state.db {
        Some(db) => db.recent_sends(limit)?,
        None => Vec::new(),
    };
    Ok(Json(json!({ "ok": true, "count": entries.len(), "entries": entries })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProviderTestBody {
    #[serde(default)]
    pub scope: String,
}

pub async fn test_providers(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<ProviderTestBody>,
) -> ApiResult {
    let reports = state
        .scheduler
        .provider()
        .test_connectivity(&body.scope)
        .await?;
    let all_reachable = reports.iter().all(|r| r.reachable);
    Ok(Json(json!({ "ok": all_reachable, "providers": reports })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router_from_arc;
    use axum::Router;
    use axum::body::Body;
    use axum::http::Request;
    use cadence_core::config::CadenceConfig;
    use cadence_scheduler::SchedulerDb;
    use tower::ServiceExt;

    const CONFIG: &str = r#"
        [gateway]
        operator_token = "op-token"

        [scheduler]
        tick_interval_secs = 3600

        [trigger]
        secret = "tick-secret"
        backoff_step_ms = 1
        nudge_min_interval_secs = 3600

        [webhook]
        shared_secret = "hook-secret"

        [[catalog.campaigns]]
        id = "camp-1"
        brand_id = "brand-1"
        experiments = ["exp-1"]

        [catalog.campaigns.limits]
        daily_cap = 5
        hourly_cap = 5
        min_spacing_minutes = 0
        timezone = "UTC"

        [[catalog.experiments]]
        id = "exp-1"
        brand_id = "brand-1"
        external_run_id = "ext-1"
        message = { subject = "Hi {{name}}", body = "Hello from Cadence" }
        leads = [
            { email = "ann@acme.io", name = "Ann" },
            { email = "bo@acme.io", name = "Bo" },
        ]

        [[catalog.experiments]]
        id = "exp-2"
        brand_id = "brand-1"
        message = { subject = "Hi", body = "Hello" }
    "#;

    fn test_state() -> Arc<AppState> {
        let config: CadenceConfig = toml::from_str(CONFIG).unwrap();
        let db = Arc::new(SchedulerDb::in_memory().unwrap());
        Arc::new(AppState::build(config, Some(db)).unwrap())
    }

    fn app() -> (Arc<AppState>, Router) {
        let state = test_state();
        (state.clone(), build_router_from_arc(state))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .header("X-Operator-Token", "op-token")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri)
            .header("X-Operator-Token", "op-token")
            .body(Body::empty())
            .unwrap()
    }

    fn tick(auth: Option<&str>, body: Value) -> Request<Body> {
        let mut req = Request::post("/api/v1/scheduler/tick").header("content-type", "application/json");
        if let Some(auth) = auth {
            req = req.header("Authorization", auth);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    fn launch_body(experiment: &str) -> Value {
        json!({
            "brandId": "brand-1",
            "campaignId": "camp-1",
            "experimentId": experiment,
            "owner": { "ownerType": "campaign", "ownerId": "camp-1" },
        })
    }

    async fn launch(app: &Router) -> String {
        let (status, body) = send(app, post("/api/v1/runs", launch_body("exp-1"))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["runId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_, app) = app();
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "cadence");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_operator_routes_require_token() {
        let (_, app) = app();
        let req = Request::get("/api/v1/runs").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["reason"], "unauthorized");

        let req = Request::get("/api/v1/runs?token=op-token").body(Body::empty()).unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_launch_twice_is_rejected() {
        let (state, app) = app();
        let run_id = launch(&app).await;

        let (status, body) = send(&app, post("/api/v1/runs", launch_body("exp-1"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);
        assert_eq!(body["reason"], "run_already_active");
        assert_eq!(body["debug"]["activeRunId"], run_id.as_str());
        assert!(body["hint"].is_string());
        assert_eq!(state.store.len(), 1);
    }

    #[tokio::test]
    async fn test_launch_unlinked_experiment() {
        let (_, app) = app();
        let (status, body) = send(&app, post("/api/v1/runs", launch_body("exp-2"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"], "runtime_mapping_missing");
        assert_eq!(body["debug"]["experimentId"], "exp-2");
    }

    #[tokio::test]
    async fn test_tick_endpoint() {
        let (state, app) = app();
        let run_id = launch(&app).await;

        let (status, _) = send(&app, tick(None, json!({ "maxRuns": 1 }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, tick(Some("Bearer nope"), json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, tick(Some("Bearer tick-secret"), json!({ "maxRuns": 1 }))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["report"]["dispatched"], 1);
        assert_eq!(state.store.get(&run_id).unwrap().pool.stats().contacted, 1);

        let (status, body) = send(&app, tick(Some("Bearer tick-secret"), json!({ "maxRuns": 0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"], "validation");
    }

    #[tokio::test]
    async fn test_manual_trigger_statuses() {
        let (_, app) = app();
        let req = Request::post("/api/v1/scheduler/trigger").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);
        assert_eq!(body["attemptCount"], 0);

        let req = Request::post("/api/v1/scheduler/trigger")
            .header("Authorization", "Bearer tick-secret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["attemptCount"], 1);
        assert_eq!(body["source"], "manual");
    }

    #[tokio::test]
    async fn test_webhook_ingestion() {
        let (state, app) = app();
        let run_id = launch(&app).await;
        let delivery = json!({
            "externalRunId": "ext-1",
            "leads": [
                { "email": "Cy@Acme.io", "fullName": "Cy", "companyName": "Acme" },
                { "email": "ann@acme.io", "jobTitle": "CEO" },
            ],
        });
        let hook = |secret: &str, body: &Value| {
            Request::post("/api/v1/webhooks/leads")
                .header("content-type", "application/json")
                .header("X-Webhook-Secret", secret)
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let (status, _) = send(&app, hook("wrong", &delivery)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, hook("hook-secret", &delivery)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!((body["inserted"].as_u64(), body["updated"].as_u64()), (Some(1), Some(1)));
        assert_eq!(body["poolSize"], 3);

        let (_, body) = send(&app, hook("hook-secret", &delivery)).await;
        assert_eq!(body["poolSize"], 3);
        assert_eq!(state.store.get(&run_id).unwrap().pool.len(), 3);

        let unknown = json!({ "externalRunId": "ext-404", "leads": [] });
        let (status, body) = send(&app, hook("hook-secret", &unknown)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": false, "reason": "unknown_run" }));
    }

    #[tokio::test]
    async fn test_control_and_terminal_rejection() {
        let (_, app) = app();
        let run_id = launch(&app).await;
        let uri = format!("/api/v1/runs/{run_id}/control");

        let (status, body) = send(&app, post(&uri, json!({ "action": "cancel", "brandId": "brand-1" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["to"], "cancelled");

        let (status, body) = send(&app, post(&uri, json!({ "action": "resume", "brandId": "brand-1" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);
        assert_eq!(body["reason"], "illegal_transition");
        assert_eq!(body["debug"]["state"], "cancelled");

        let (status, body) = send(&app, post(&uri, json!({ "action": "explode", "brandId": "brand-1" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"], "validation");

        let (status, body) = send(&app, post(&uri, json!({ "action": "pause", "brandId": "brand-9" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["reason"], "run_not_found");
    }

    #[tokio::test]
    async fn test_run_status_and_listing() {
        let (_, app) = app();
        let run_id = launch(&app).await;

        let (status, body) = send(&app, get(&format!("/api/v1/runs/{run_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["run"]["id"], run_id.as_str());
        assert_eq!(body["status"]["pool"]["total"], 2);

        let (_, body) = send(&app, get("/api/v1/runs?brand=brand-1")).await;
        assert_eq!(body["count"], 1);
        let (_, body) = send(&app, get("/api/v1/runs?brand=brand-2")).await;
        assert_eq!(body["count"], 0);

        let (status, body) = send(&app, get("/api/v1/runs/run-missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["reason"], "run_not_found");
    }

    #[tokio::test]
    async fn test_link_external_run() {
        let (state, app) = app();
        let run_id = launch(&app).await;
        let (status, body) = send(
            &app,
            post(&format!("/api/v1/runs/{run_id}/external"), json!({ "externalRunId": "ext-9" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["externalRunId"], "ext-9");
        assert_eq!(state.store.resolve_external("ext-9").as_deref(), Some(run_id.as_str()));
    }

    #[tokio::test]
    async fn test_reply_approval_is_at_most_once() {
        let (_, app) = app();
        let (status, body) = send(
            &app,
            post(
                "/api/v1/replies",
                json!({
                    "brandId": "brand-1",
                    "threadId": "thread-1",
                    "recipient": { "email": "ann@acme.io", "name": "Ann" },
                    "subject": "Re: intro",
                    "body": "Thanks Ann",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let draft_id = body["draft"]["id"].as_str().unwrap().to_string();

        let (_, body) = send(&app, get("/api/v1/replies?brand=brand-1&state=awaiting_approval")).await;
        assert_eq!(body["count"], 1);

        let uri = format!("/api/v1/replies/{draft_id}/approve");
        let (status, body) = send(&app, post(&uri, json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["draftId"], draft_id.as_str());

        let (status, body) = send(&app, post(&uri, json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["reason"], "already_sent");

        let (_, body) = send(&app, get("/api/v1/audit?limit=10")).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["entries"][0]["outcome"], "sent");
    }

    #[tokio::test]
    async fn test_provider_connectivity() {
        let (_, app) = app();
        let (status, body) = send(&app, post("/api/v1/providers/test", json!({ "scope": "brand-1" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert!(!body["providers"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_validation_errors() {
        let (_, app) = app();
        let raw = |uri: &str, content_type: Option<&str>, body: &str| {
            let mut req = Request::post(uri).header("X-Operator-Token", "op-token");
            if let Some(ct) = content_type {
                req = req.header("content-type", ct);
            }
            req.body(Body::from(body.to_string())).unwrap()
        };
        let json = Some("application/json");
        let cases = [
            raw("/api/v1/runs", json, "{not json"),
            raw("/api/v1/runs", json, r#"{"brandId": 5}"#),
            raw("/api/v1/runs", None, &launch_body("exp-1").to_string()),
            raw("/api/v1/runs/run-x/control", json, "[]"),
            raw("/api/v1/runs/run-x/external", json, "{"),
            raw("/api/v1/replies", json, r#"{"brandId": "brand-1"}"#),
            raw("/api/v1/providers/test", json, "nope"),
        ];
        for req in cases {
            let uri = req.uri().to_string();
            let (status, body) = send(&app, req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}: {body}");
            assert_eq!(body["ok"], false, "{uri}");
            assert_eq!(body["reason"], "validation", "{uri}");
            assert!(body["error"].as_str().unwrap().contains("invalid request body"));
        }

        let req = Request::post("/api/v1/webhooks/leads")
            .header("content-type", "application/json")
            .header("X-Webhook-Secret", "hook-secret")
            .body(Body::from("{\"externalRunId\": "))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["reason"], "validation");
    }

    #[tokio::test]
    async fn test_near_miss_secrets_are_rejected() {
        let (_, app) = app();
        for req in [
            Request::get("/api/v1/runs?token=op-toke").body(Body::empty()).unwrap(),
            Request::get("/api/v1/runs?token=").body(Body::empty()).unwrap(),
            Request::get("/api/v1/runs")
                .header("X-Operator-Token", "op-token ")
                .body(Body::empty())
                .unwrap(),
        ] {
            let (status, body) = send(&app, req).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["reason"], "unauthorized");
        }

        let req = Request::post("/api/v1/webhooks/leads")
            .header("content-type", "application/json")
            .header("X-Webhook-Secret", "hook-secre")
            .body(Body::from(json!({ "externalRunId": "ext-1" }).to_string()))
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&CadenceError::not_found("run", "r")), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&CadenceError::provider("timeout", true)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CadenceError::provider("rejected", false)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&CadenceError::ConfigurationMissing("endpoint".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
