//! Application state and HTTP router construction.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Database;
use crate::graph::GraphCache;
use crate::sql::SqlDialect;

/// Shared state for HTTP handlers (REST and GraphQL).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub graph: Arc<GraphCache>,
    pub dialect: Arc<dyn SqlDialect>,
}

/// The dialect matching the compiled-in database engine.
pub fn default_dialect() -> Arc<dyn SqlDialect> {
    #[cfg(feature = "postgres")]
    {
        Arc::new(crate::sql::PostgresDialect)
    }
    #[cfg(not(feature = "postgres"))]
    {
        Arc::new(crate::sql::SqliteDialect)
    }
}

/// Build the full Axum router: /api, /graphql, layers.
pub fn build_app(state: AppState) -> Router<()> {
    Router::new()
        .nest("/api", crate::api::router())
        .route(
            "/graphql",
            get(crate::graphql::graphiql).post(crate::graphql::graphql_handler),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
