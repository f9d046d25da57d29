//! HTTP server implementation using Axum.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    extract::State,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cadence_core::catalog::Catalog;
use cadence_core::config::CadenceConfig;
use cadence_core::error::Result;
use cadence_scheduler::engine::DEFAULT_CLAIM_LEASE_MINUTES;
use cadence_scheduler::{
    DraftStore, LeadIngestor, ReplyApprover, RunControl, RunLauncher, RunStore, SchedulerDb,
    TickScheduler,
};
use cadence_trigger::{Nudger, TickInvoker, secret_matches};

/// Shared state for the gateway server.
pub struct AppState {
    pub config: CadenceConfig,
    pub start_time: Instant,
    pub store: Arc<RunStore>,
    pub scheduler: Arc<TickScheduler>,
    pub launcher: RunLauncher,
    pub control: RunControl,
    pub ingestor: LeadIngestor,
    pub approver: ReplyApprover,
    /// Send log; absent when running without a database.
    pub db: Option<Arc<SchedulerDb>>,
    /// In-process invoker used by the periodic loop and the manual trigger.
    pub invoker: Arc<TickInvoker>,
    pub nudger: Arc<Nudger>,
}

impl AppState {
    /// Wire every component from config. With a database, runs and drafts
    /// are restored from it and every dispatch is logged to it.
    pub fn build(config: CadenceConfig, db: Option<Arc<SchedulerDb>>) -> Result<Self> {
        let catalog = Arc::new(Catalog::from_config(&config.catalog));
        let provider = cadence_providers::create_provider(&config.provider)?;

        let (store, drafts) = match &db {
            Some(db) => {
                let store = RunStore::persistent(db.clone());
                let restored = store.restore()?;
                tracing::info!("📂 Restored {restored} run(s) from the database");
                (store, DraftStore::persistent(db.clone())?)
            }
            None => (RunStore::in_memory(), DraftStore::in_memory()),
        };
        let store = Arc::new(store);
        let lease = chrono::Duration::try_seconds(config.scheduler.claim_lease_secs as i64)
            .unwrap_or_else(|| chrono::Duration::minutes(DEFAULT_CLAIM_LEASE_MINUTES));

        let mut scheduler = TickScheduler::new(store.clone(), provider.clone(), catalog.clone())
            .with_error_budget(config.scheduler.dispatch_error_budget)
            .with_claim_lease(lease);
        let drafts = drafts.with_sending_lease(lease);
        let mut approver = ReplyApprover::new(Arc::new(drafts), provider);
        if let Some(db) = &db {
            scheduler = scheduler.with_send_log(db.clone());
            approver = approver.with_send_log(db.clone());
        }
        let scheduler = Arc::new(scheduler);

        let invoker = Arc::new(cadence_trigger::local_invoker(
            &config.trigger,
            scheduler.clone(),
            config.scheduler.max_runs_per_tick,
        ));
        let nudger = cadence_trigger::nudger(&config.trigger, invoker.clone());

        Ok(Self {
            launcher: RunLauncher::new(store.clone(), catalog),
            control: RunControl::new(store.clone()),
            ingestor: LeadIngestor::new(store.clone()),
            start_time: Instant::now(),
            config,
            store,
            scheduler,
            approver,
            db,
            invoker,
            nudger,
        })
    }
}

/// Operator token middleware. Validates the X-Operator-Token header or ?token= query.
async fn require_operator(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    // No token configured: operator routes are open.
    let Some(expected) = state.config.gateway.operator_token.as_deref() else {
        return next.run(req).await;
    };

    let from_header = req
        .headers()
        .get("X-Operator-Token")
        .and_then(|v| v.to_str().ok());
    if secret_matches(from_header, expected) {
        return next.run(req).await;
    }

    let from_query = req.uri().query().is_some_and(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.strip_prefix("token="))
            .any(|token| secret_matches(Some(token), expected))
    });
    if from_query {
        return next.run(req).await;
    }

    super::routes::unauthorized("invalid or missing operator token")
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    // Operator routes: require the operator token when one is configured
    let protected = Router::new()
        .route(
            "/api/v1/runs",
            get(super::routes::list_runs).post(super::routes::launch_run),
        )
        .route("/api/v1/runs/{id}", get(super::routes::get_run))
        .route("/api/v1/runs/{id}/control", post(super::routes::control_run))
        .route("/api/v1/runs/{id}/external", post(super::routes::link_external_run))
        .route(
            "/api/v1/replies",
            get(super::routes::list_replies).post(super::routes::submit_reply),
        )
        .route("/api/v1/replies/{id}/approve", post(super::routes::approve_reply))
        .route("/api/v1/audit", get(super::routes::audit_log))
        .route("/api/v1/providers/test", post(super::routes::test_providers))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_operator,
        ));

    // Public routes: each carries its own credential check
    let public = Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/api/v1/scheduler/tick", post(super::routes::scheduler_tick))
        .route("/api/v1/scheduler/trigger", post(super::routes::manual_trigger))
        .route("/api/v1/webhooks/leads", post(super::routes::ingest_leads));

    let router = protected.merge(public);
    let router = if shared.config.gateway.cors {
        router.layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: CADENCE_CORS_ORIGINS=https://ops.example.com,https://admin.example.com
            if let Ok(origins_str) = std::env::var("CADENCE_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http()).with_state(shared)
}

/// Start the HTTP server and the periodic trigger.
pub async fn start(config: CadenceConfig) -> anyhow::Result<()> {
    let db_path = std::path::PathBuf::from(&config.scheduler.db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(SchedulerDb::open(&db_path)?);
    tracing::info!("📂 Database: {}", db_path.display());

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let tick_interval = config.scheduler.tick_interval_secs;
    let state = Arc::new(AppState::build(config, Some(db))?);

    if state.config.trigger.secret.is_none() {
        tracing::warn!("⚠️ No trigger secret configured: tick endpoint is open, manual trigger disabled");
    }
    if state.config.gateway.operator_token.is_none() {
        tracing::warn!("⚠️ No operator token configured: operator routes are open");
    }

    let periodic = cadence_trigger::spawn_periodic(state.invoker.clone(), tick_interval);

    let app = build_router_from_arc(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🚀 Cadence gateway listening on http://{addr}");

    let served = axum::serve(listener, app).await;
    periodic.abort();
    served?;
    Ok(())
}
