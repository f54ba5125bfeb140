//! GraphQL surface
//!
//! The schema is not statically generated: the adapter turns the parsed
//! document into a [QueryRequest](crate::query::QueryRequest) and execution
//! goes through the same orchestrator as the REST surface. GET serves the
//! GraphiQL playground.

pub mod adapter;

use async_graphql::http::GraphiQLSource;
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};

use crate::app::AppState;
use crate::auth::principal_from_headers;
use crate::error::ApiError;
use crate::query::QueryOrchestrator;

#[derive(Debug, Deserialize)]
pub struct GraphQLHttpRequest {
    pub query: String,
}

pub async fn graphiql() -> impl IntoResponse {
    Html(GraphiQLSource::build().endpoint("/graphql").finish())
}

pub async fn graphql_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GraphQLHttpRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let principal = principal_from_headers(&headers, &state.config.jwt_secret)?;
    let request = adapter::convert(&body.query)?;
    let resource = request.resource.clone();

    let graph = state.graph.snapshot().await?;
    let orchestrator = QueryOrchestrator::new(&state.db, state.dialect.as_ref(), &graph);
    let page = orchestrator.fetch_page(&request, &principal).await?;

    let mut data = Map::new();
    data.insert(resource, JsonValue::Array(page.items));
    Ok(Json(json!({
        "data": data,
        "meta": {
            "page": page.page,
            "pageSize": page.page_size,
            "total": page.total,
            "filtered": page.filtered,
        }
    })))
}
