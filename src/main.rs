mod assets;
mod catalog;
mod config;
mod http;
mod idempotency;
mod merge;
mod metrics;
mod models;
mod pricing;
mod services;
mod sessions;
#[cfg(test)]
mod testing;
mod validator;
mod wizard;

use assets::FolderTree;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use catalog::Catalog;
use chrono::{DateTime, Utc};
use idempotency::ReceiptCache;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, PriceMode, SubmissionReceipt, UploadMode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use services::Services;
use sessions::{SessionStore, SharedSession};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;
use wizard::{SkuPatch, WizardError, WizardErrorKind, WizardSession};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "wizard.api", "server crashed: {err:#}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let catalog = Arc::new(Catalog::load()?);
    let services = Services::from_env(catalog.clone());
    let folders = match services.assets.list_folders().await {
        Ok(specs) => FolderTree::from_specs(&specs),
        Err(err) => {
            warn!(target = "wizard.api", error = %err, "folder listing failed; using catalog folders");
            FolderTree::from_specs(&catalog.folders)
        }
    };
    if folders.is_empty() {
        warn!(target = "wizard.api", "no asset folders configured; uploads will be rejected");
    }
    info!(
        target = "wizard.api",
        folders = folders.len(),
        categories = catalog.categories.len(),
        "catalog loaded"
    );

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState {
        sessions: SessionStore::new(services, catalog, Arc::new(folders)),
        receipts: ReceiptCache::from_env(),
        prometheus_handle,
    };

    let addr: SocketAddr = ([0, 0, 0, 0], config::port()).into();
    info!(target = "wizard.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state).into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    sessions: SessionStore,
    receipts: ReceiptCache,
    prometheus_handle: PrometheusHandle,
}

impl AppState {
    async fn session(&self, raw_id: &str) -> Result<(Uuid, SharedSession), AppError> {
        let id = Uuid::parse_str(raw_id)
            .map_err(|_| AppError::BadRequest("invalid_session_id", raw_id.to_string()))?;
        let session = self
            .sessions
            .get(id)
            .await
            .ok_or_else(|| AppError::NotFound("session_not_found", raw_id.to_string()))?;
        Ok((id, session))
    }
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let session_routes = Router::new()
        .route("/", post(create_session))
        .route("/{id}", get(get_session).delete(delete_session))
        .route("/{id}/collect", post(collect))
        .route(
            "/{id}/datasource",
            post(match_datasource).delete(clear_datasource),
        )
        .route("/{id}/template", post(apply_template).delete(clear_template))
        .route("/{id}/category", post(select_category))
        .route("/{id}/fields/{group}/{name}", put(edit_field))
        .route("/{id}/fields/{group}/{name}/confirm", post(confirm_field))
        .route("/{id}/folder", post(select_folder))
        .route("/{id}/uploads", post(upload_all))
        .route("/{id}/uploads/{group}/{name}", post(upload_field))
        .route("/{id}/pricing/strategy", post(select_strategy))
        .route("/{id}/pricing/mode", post(set_price_mode))
        .route("/{id}/skus/{sku}", axum::routing::patch(update_sku))
        .route("/{id}/upload-mode", post(set_upload_mode))
        .route("/{id}/checks", get(checks))
        .route("/{id}/advance", post(advance))
        .route("/{id}/retreat", post(retreat))
        .route("/{id}/submit", post(submit));

    let catalog_routes = Router::new()
        .route("/strategies", get(catalog_strategies))
        .route("/folders", get(catalog_folders))
        .route("/categories", get(catalog_categories))
        .route("/datasources", get(catalog_datasources))
        .route("/templates", get(catalog_templates));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .nest("/sessions", session_routes)
        .nest("/catalog", catalog_routes)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(config::body_limit()))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "listing-wizard",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn snapshot(session: &WizardSession) -> Result<Json<Value>, AppError> {
    serde_json::to_value(session.view())
        .map(Json)
        .map_err(|err| AppError::Internal(err.to_string()))
}

/// Start a new listing run.
///
/// - Method: `POST`
/// - Path: `/sessions`
/// - Response: `201` with the session snapshot
async fn create_session(State(state): State<AppState>) -> Result<Response, AppError> {
    metrics::inc_requests("/sessions");
    let (_, session) = state.sessions.create().await;
    let body = snapshot(&*session.lock().await)?;
    Ok((StatusCode::CREATED, body).into_response())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}");
    let (_, session) = state.session(&id).await?;
    let guard = session.lock().await;
    snapshot(&guard)
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    metrics::inc_requests("/sessions/{id}");
    let (uuid, _) = state.session(&id).await?;
    state.sessions.remove(uuid).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CollectRequest {
    source_url: String,
}

/// Collect the source listing and seed the field groups.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/collect`
/// - Body: `{"source_url": "https://..."}`
async fn collect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CollectRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/collect");
    let (_, session) = state.session(&id).await?;
    sessions::collect(&session, &req.source_url).await?;
    let guard = session.lock().await;
    snapshot(&guard)
}

#[derive(Debug, Deserialize)]
struct DatasourceRequest {
    datasource_id: String,
}

async fn match_datasource(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DatasourceRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/datasource");
    let (_, session) = state.session(&id).await?;
    sessions::match_datasource(&session, &req.datasource_id).await?;
    let guard = session.lock().await;
    snapshot(&guard)
}

async fn clear_datasource(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/datasource");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.clear_datasource()?;
    snapshot(&guard)
}

#[derive(Debug, Deserialize)]
struct TemplateRequest {
    template_id: String,
}

async fn apply_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TemplateRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/template");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.apply_template(&req.template_id)?;
    snapshot(&guard)
}

async fn clear_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/template");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.clear_template()?;
    snapshot(&guard)
}

#[derive(Debug, Deserialize)]
struct CategoryRequest {
    path: Vec<String>,
}

async fn select_category(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CategoryRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/category");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.select_category(req.path)?;
    snapshot(&guard)
}

#[derive(Debug, Deserialize)]
struct EditFieldRequest {
    value: String,
}

async fn edit_field(
    State(state): State<AppState>,
    Path((id, group, name)): Path<(String, String, String)>,
    Json(req): Json<EditFieldRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/fields/{group}/{name}");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.edit_field(&group, &name, &req.value)?;
    snapshot(&guard)
}

async fn confirm_field(
    State(state): State<AppState>,
    Path((id, group, name)): Path<(String, String, String)>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/fields/{group}/{name}/confirm");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.confirm_field(&group, &name)?;
    snapshot(&guard)
}

#[derive(Debug, Deserialize)]
struct FolderRequest {
    folder_id: String,
}

async fn select_folder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FolderRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/folder");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.select_folder(&req.folder_id)?;
    snapshot(&guard)
}

#[derive(Debug, Serialize)]
struct UploadsStarted {
    started: Vec<assets::FieldKey>,
}

/// Start uploads for every eligible asset field. Progress is observed
/// through field statuses on `GET /sessions/{id}`.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/uploads`
/// - Response: `202` with the fields that started uploading
async fn upload_all(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/sessions/{id}/uploads");
    let (_, session) = state.session(&id).await?;
    let handles = session.lock().await.begin_upload_all()?;
    let started = sessions::track_uploads(&session, handles);
    Ok((StatusCode::ACCEPTED, Json(UploadsStarted { started })).into_response())
}

async fn upload_field(
    State(state): State<AppState>,
    Path((id, group, name)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/sessions/{id}/uploads/{group}/{name}");
    let (_, session) = state.session(&id).await?;
    let handle = session.lock().await.begin_upload(&group, &name)?;
    let started = sessions::track_uploads(&session, vec![handle]);
    Ok((StatusCode::ACCEPTED, Json(UploadsStarted { started })).into_response())
}

#[derive(Debug, Deserialize)]
struct StrategyRequest {
    strategy_id: String,
}

async fn select_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StrategyRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/pricing/strategy");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.select_strategy(&req.strategy_id)?;
    snapshot(&guard)
}

#[derive(Debug, Deserialize)]
struct PriceModeRequest {
    mode: PriceMode,
}

async fn set_price_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PriceModeRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/pricing/mode");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.set_price_mode(req.mode)?;
    snapshot(&guard)
}

async fn update_sku(
    State(state): State<AppState>,
    Path((id, sku)): Path<(String, String)>,
    Json(patch): Json<SkuPatch>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/skus/{sku}");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.update_sku(&sku, patch)?;
    snapshot(&guard)
}

#[derive(Debug, Deserialize)]
struct UploadModeRequest {
    mode: UploadMode,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
}

async fn set_upload_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UploadModeRequest>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/upload-mode");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.set_upload_mode(req.mode, req.scheduled_at)?;
    snapshot(&guard)
}

async fn checks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/checks");
    let (_, session) = state.session(&id).await?;
    let guard = session.lock().await;
    Ok(Json(json!({
        "checks": guard.checks(),
        "can_submit": guard.can_submit(),
    })))
}

async fn advance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/advance");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.advance()?;
    snapshot(&guard)
}

async fn retreat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    metrics::inc_requests("/sessions/{id}/retreat");
    let (_, session) = state.session(&id).await?;
    let mut guard = session.lock().await;
    guard.retreat()?;
    snapshot(&guard)
}

/// Submit the listing to the marketplace.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/submit`
/// - Headers: optional `Idempotency-Key`; a repeated key replays the receipt,
///   including for a request that raced the first one
/// - Response: `SubmissionReceipt`
async fn submit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SubmissionReceipt>, AppError> {
    metrics::inc_requests("/sessions/{id}/submit");
    let (uuid, session) = state.session(&id).await?;
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let gate = session.lock().await.submit_gate();
    let _turn = gate.lock().await;
    if let Some(key) = &key
        && let Some(existing) = state.receipts.get(uuid, key).await
    {
        info!(target = "wizard.api", session = %uuid, "submission replayed from idempotency cache");
        return Ok(Json(existing));
    }
    let receipt = sessions::submit(&session).await?;
    if let Some(key) = &key {
        state.receipts.put(uuid, key, &receipt).await;
    }
    Ok(Json(receipt))
}

async fn catalog_strategies() -> Json<Value> {
    Json(json!({ "strategies": pricing::STRATEGIES }))
}

async fn catalog_folders(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "folders": state.sessions.folders().to_specs() }))
}

async fn catalog_categories(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "categories": state.sessions.catalog().categories }))
}

async fn catalog_datasources(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "datasources": state.sessions.catalog().datasources }))
}

async fn catalog_templates(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "templates": state.sessions.catalog().templates }))
}

#[derive(Debug)]
enum AppError {
    Wizard(WizardError),
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Internal(String),
}

impl From<WizardError> for AppError {
    fn from(value: WizardError) -> Self {
        Self::Wizard(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Wizard(err) => {
                let status = match err.kind() {
                    WizardErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    WizardErrorKind::Conflict => StatusCode::CONFLICT,
                    WizardErrorKind::NotFound => StatusCode::NOT_FOUND,
                    WizardErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                };
                let payload = ApiError {
                    error: err.code().to_string(),
                    detail: Some(err.to_string()),
                };
                (status, payload)
            }
            AppError::BadRequest(code, detail) => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: code.to_string(),
                    detail: Some(detail),
                },
            ),
            AppError::NotFound(code, detail) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: code.to_string(),
                    detail: Some(detail),
                },
            ),
            AppError::Internal(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError {
                    error: "internal".to_string(),
                    detail: Some(detail),
                },
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
