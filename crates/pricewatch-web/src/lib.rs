//! Axum JSON API over the dashboard stores.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use pricewatch_core::{RowId, Session, TermDraft};
use pricewatch_stores::{Dashboard, FetchOutcome, StoreError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "pricewatch-web";

#[derive(Clone)]
pub struct AppState {
    pub dashboard: Dashboard,
}

impl AppState {
    pub fn new(dashboard: Dashboard) -> Self {
        Self { dashboard }
    }
}

type AppStateRef = Arc<AppState>;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TagsRequest {
    tags: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ListingsQuery {
    term: Option<RowId>,
}

#[derive(Debug, Deserialize, Default)]
struct TimelineQuery {
    terms: Option<String>,
    sources: Option<String>,
}

/// Error body `{"error": ..}` with the status it maps to.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotAuthenticated => StatusCode::UNAUTHORIZED,
            StoreError::Precondition(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Backend(_) => StatusCode::BAD_GATEWAY,
            StoreError::LocalState(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn loaded(outcome: FetchOutcome) -> ApiResult<()> {
    match outcome {
        FetchOutcome::Failed(message) => Err(ApiError::new(StatusCode::BAD_GATEWAY, message)),
        FetchOutcome::Loaded | FetchOutcome::Skipped => Ok(()),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/auth/login", post(login_handler))
        .route("/api/auth/logout", post(logout_handler))
        .route("/api/auth/session", get(session_handler))
        .route("/api/terms", get(terms_handler).post(add_term_handler))
        .route("/api/terms/{id}", delete(remove_term_handler))
        .route("/api/terms/{id}/tags", put(set_tags_handler))
        .route("/api/tags", get(tags_handler))
        .route("/api/listings", get(listings_handler))
        .route("/api/folders", get(folders_handler))
        .route("/api/timeline", get(timeline_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(dashboard: Dashboard, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "pricewatch web listening");
    axum::serve(listener, app(AppState::new(dashboard))).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn login_handler(
    State(state): State<AppStateRef>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = &state.dashboard.auth;
    if !auth.login(&request.email, &request.password).await {
        let message = auth.error().await.unwrap_or_else(|| "login failed".to_string());
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, message));
    }
    let session = state.dashboard.require_session().await?;
    Ok(Json(json!({ "user": session.user })))
}

async fn logout_handler(State(state): State<AppStateRef>) -> ApiResult<Json<serde_json::Value>> {
    let auth = &state.dashboard.auth;
    if !auth.logout().await {
        let message = auth.error().await.unwrap_or_else(|| "logout failed".to_string());
        warn!(error = %message, "logout reported an error");
        return Err(ApiError::new(StatusCode::BAD_GATEWAY, message));
    }
    Ok(Json(json!({ "signed_out": true })))
}

async fn session_handler(State(state): State<AppStateRef>) -> Json<serde_json::Value> {
    let session = state.dashboard.auth.session().await;
    Json(json!({
        "authenticated": session.is_some(),
        "user": session.map(|s| s.user),
    }))
}

async fn require(state: &AppState) -> ApiResult<Session> {
    Ok(state.dashboard.require_session().await?)
}

async fn terms_handler(State(state): State<AppStateRef>) -> ApiResult<Json<serde_json::Value>> {
    let session = require(&state).await?;
    let terms = &state.dashboard.terms;
    loaded(terms.fetch_all(&session).await)?;
    Ok(Json(json!({ "terms": terms.all().await })))
}

async fn add_term_handler(
    State(state): State<AppStateRef>,
    Json(draft): Json<TermDraft>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let session = require(&state).await?;
    let term = state.dashboard.terms.add_term(&session, draft).await?;
    Ok((StatusCode::CREATED, Json(json!({ "term": term }))))
}

async fn remove_term_handler(
    State(state): State<AppStateRef>,
    Path(id): Path<RowId>,
) -> ApiResult<StatusCode> {
    let session = require(&state).await?;
    state.dashboard.terms.remove_term(&session, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_tags_handler(
    State(state): State<AppStateRef>,
    Path(id): Path<RowId>,
    Json(request): Json<TagsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = require(&state).await?;
    let tags = state.dashboard.tags.set_tags(&session, id, &request.tags).await?;
    Ok(Json(json!({ "term_id": id, "tags": tags })))
}

async fn tags_handler(State(state): State<AppStateRef>) -> ApiResult<Json<serde_json::Value>> {
    let session = require(&state).await?;
    let tags = &state.dashboard.tags;
    loaded(tags.fetch_all(&session).await)?;
    Ok(Json(json!({ "tags": tags.all_tags().await })))
}

async fn listings_handler(
    State(state): State<AppStateRef>,
    Query(query): Query<ListingsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = require(&state).await?;
    let listings = &state.dashboard.listings;
    loaded(listings.fetch_all(&session).await)?;
    let rows = match query.term {
        Some(term_id) => listings.for_term(term_id).await,
        None => listings.all().await,
    };
    Ok(Json(json!({ "listings": rows })))
}

async fn folders_handler(State(state): State<AppStateRef>) -> ApiResult<Json<serde_json::Value>> {
    let session = require(&state).await?;
    let folders = &state.dashboard.folders;
    loaded(folders.fetch_folders(&session).await)?;
    Ok(Json(json!({
        "folders": folders.folders().await,
        "selection": folders.selection().await,
        "expanded": folders.expanded_keys().await,
    })))
}

async fn timeline_handler(
    State(state): State<AppStateRef>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = require(&state).await?;
    let timeline = &state.dashboard.timeline;
    loaded(timeline.fetch_timeline(&session).await)?;
    if let Some(terms) = query.terms.as_deref() {
        timeline.set_terms(split_list(terms)).await;
    }
    if let Some(sources) = query.sources.as_deref() {
        timeline.set_sources(split_list(sources)).await;
    }
    Ok(Json(json!({
        "terms": timeline.all_terms().await,
        "sources": timeline.all_sources().await,
        "selected_terms": timeline.selected_terms().await,
        "selected_sources": timeline.selected_sources().await,
        "chart": timeline.chart_data().await,
    })))
}
