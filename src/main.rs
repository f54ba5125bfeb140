//! Trellis - metadata-driven query service
//!
//! Exposes relational tables as filterable, nested-JSON resources. An
//! entity graph loaded from metadata is compiled, per request, into
//! parameterized SQL with joins, row-level security, sorting, paging and
//! JSON projection. Resources are served over REST at /api and over
//! GraphQL at /graphql.

mod api;
mod app;
mod auth;
mod config;
mod db;
mod error;
mod filter;
mod graph;
mod graphql;
mod permission;
mod plan;
mod query;
mod sql;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::app::{AppState, build_app, default_dialect};
use crate::config::Config;
use crate::graph::{GraphCache, JsonFileProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Trellis");

    let db = db::connect(&config.database_url).await?;
    tracing::info!("Database connected");

    let provider = Arc::new(JsonFileProvider::new(config.metadata_path.clone()));
    let graph = Arc::new(GraphCache::new(provider, config.graph_ttl));
    // Fail fast on malformed metadata instead of on the first request.
    let snapshot = graph
        .snapshot()
        .await
        .map_err(|e| anyhow::anyhow!("initial graph load: {e}"))?;
    tracing::info!(entities = snapshot.entities().count(), "Entity graph loaded");

    let state = AppState {
        config: config.clone(),
        db,
        graph,
        dialect: default_dialect(),
    };
    let app = build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
