//! REST API routes
//!
//! One generic handler set serves every entity: the path's resource
//! segment is resolved against the graph snapshot's alias table, so the
//! exposed surface follows the metadata without per-entity registration.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};

use crate::app::AppState;
use crate::auth::{Principal, principal_from_headers};
use crate::error::ApiError;
use crate::query::{QueryOrchestrator, QueryPage, QueryRequest, SortOrder};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/{resource}", get(list).post(create))
        .route(
            "/{resource}/{id}",
            get(get_one).put(update).delete(delete_one),
        )
}

async fn health() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    #[serde(default)]
    page: i64,
    page_size: Option<i64>,
    sort_property: Option<String>,
    #[serde(default)]
    sort_order: SortOrder,
    /// Filter tree in the comparer JSON grammar.
    filter: Option<String>,
}

fn principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    principal_from_headers(headers, &state.config.jwt_secret)
}

async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(resource): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<QueryPage>, ApiError> {
    let principal = principal(&state, &headers)?;

    let mut request = QueryRequest::new(resource);
    request.page = params.page;
    if let Some(page_size) = params.page_size {
        request.page_size = page_size;
    }
    request.sort_property = params.sort_property;
    request.sort_order = params.sort_order;
    if let Some(raw) = &params.filter {
        request.filter = Some(
            serde_json::from_str(raw)
                .map_err(|e| ApiError::BadRequest(format!("malformed filter: {e}")))?,
        );
    }

    let graph = state.graph.snapshot().await?;
    let orchestrator = QueryOrchestrator::new(&state.db, state.dialect.as_ref(), &graph);
    Ok(Json(orchestrator.fetch_page(&request, &principal).await?))
}

async fn get_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((resource, id)): Path<(String, String)>,
) -> Result<Json<JsonValue>, ApiError> {
    let principal = principal(&state, &headers)?;
    let graph = state.graph.snapshot().await?;
    let orchestrator = QueryOrchestrator::new(&state.db, state.dialect.as_ref(), &graph);
    Ok(Json(orchestrator.fetch_one(&resource, &id, &principal).await?))
}

async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(resource): Path<String>,
    Json(payload): Json<Map<String, JsonValue>>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let principal = principal(&state, &headers)?;
    let graph = state.graph.snapshot().await?;
    let orchestrator = QueryOrchestrator::new(&state.db, state.dialect.as_ref(), &graph);
    let created = orchestrator.insert(&resource, &payload, &principal).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((resource, id)): Path<(String, String)>,
    Json(payload): Json<Map<String, JsonValue>>,
) -> Result<Json<JsonValue>, ApiError> {
    let principal = principal(&state, &headers)?;
    let graph = state.graph.snapshot().await?;
    let orchestrator = QueryOrchestrator::new(&state.db, state.dialect.as_ref(), &graph);
    Ok(Json(
        orchestrator
            .update(&resource, &id, &payload, &principal)
            .await?,
    ))
}

async fn delete_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((resource, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let principal = principal(&state, &headers)?;
    let graph = state.graph.snapshot().await?;
    let orchestrator = QueryOrchestrator::new(&state.db, state.dialect.as_ref(), &graph);
    orchestrator.delete(&resource, &id, &principal).await?;
    Ok(StatusCode::NO_CONTENT)
}
