// src/api.rs
use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::aggregator::Aggregator;
use crate::collapse::DisplayItem;
use crate::model::{EventQuery, EventRecord, SourceRecord, DEFAULT_EVENT_COUNT};
use crate::store::EventStore;

/// Upper bound on `count` accepted over HTTP.
const MAX_PAGE: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    /// Reads go straight to the store so they never wait on an update cycle.
    pub store: Arc<dyn EventStore>,
    pub aggregator: Arc<Mutex<Aggregator>>,
}

impl AppState {
    pub fn new(aggregator: Aggregator) -> Self {
        Self {
            store: aggregator.store().clone(),
            aggregator: Arc::new(Mutex::new(aggregator)),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/events", get(list_events))
        .route("/events/collapsed", get(list_collapsed))
        .route("/events/slug/{slug}", get(event_by_slug))
        .route("/sources", get(list_sources))
        .route("/sources/counts", get(source_counts))
        .route("/admin/update", post(admin_update))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Error body: `{"error": "..."}`.
pub struct ApiError(StatusCode, String);

impl From<crate::error::StoreError> for ApiError {
    fn from(e: crate::error::StoreError) -> Self {
        tracing::warn!(error = %e, "store read failed");
        Self(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventsParams {
    count: Option<usize>,
    before: Option<i64>,
    source: Option<String>,
    #[serde(default)]
    ascending: bool,
}

impl EventsParams {
    fn query(self) -> EventQuery {
        EventQuery {
            count: Some(self.count.unwrap_or(DEFAULT_EVENT_COUNT).min(MAX_PAGE)),
            before: self.before,
            source: self.source.filter(|s| !s.is_empty()),
            descending: !self.ascending,
        }
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    Ok(Json(state.store.events(&params.query()).await?))
}

async fn list_collapsed(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Result<Json<Vec<DisplayItem>>, ApiError> {
    Ok(Json(state.store.collapsed_events(&params.query()).await?))
}

async fn event_by_slug(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<EventRecord>, ApiError> {
    state
        .store
        .events_by_slug(&slug)
        .await?
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("no event with slug '{slug}'")))
}

async fn list_sources(State(state): State<AppState>) -> Result<Json<Vec<SourceRecord>>, ApiError> {
    Ok(Json(state.store.get_sources().await?.into_values().collect()))
}

async fn source_counts(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, usize>>, ApiError> {
    Ok(Json(state.store.events_by_source_count().await?))
}

#[derive(Debug, Default, Deserialize)]
struct UpdateParams {
    source: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateOut {
    total: usize,
    stored: BTreeMap<String, usize>,
    failed: BTreeMap<String, String>,
}

async fn admin_update(
    State(state): State<AppState>,
    Query(params): Query<UpdateParams>,
) -> Result<Json<UpdateOut>, ApiError> {
    let mut agg = state.aggregator.lock().await;
    let only = match params.source {
        Some(key) => Some(vec![agg
            .resolve(&key)
            .map_err(|e| ApiError(StatusCode::NOT_FOUND, e.to_string()))?]),
        None => None,
    };
    let report = agg.update(only.as_deref()).await;
    Ok(Json(UpdateOut {
        total: report.total(),
        stored: report.stored,
        failed: report.failed,
    }))
}
