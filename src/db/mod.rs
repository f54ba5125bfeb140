//! Database connection and statement execution
//!
//! The backend engine is a build-time choice (crate features), mirrored by
//! the dialect the rest of the pipeline renders against. Statements arrive
//! here with named `@Filter_Int{n}` placeholders and an ordered value
//! list; they are rewritten to the engine's positional form and bound in
//! counter order.

use anyhow::Result;
use serde_json::Value as Json;
use sqlx::Row;

use crate::error::ApiError;
use crate::sql::{SqlDialect, SqlValue, rewrite_placeholders};

#[cfg(not(feature = "postgres"))]
pub type Database = sqlx::SqlitePool;
#[cfg(feature = "postgres")]
pub type Database = sqlx::PgPool;

#[cfg(not(feature = "postgres"))]
pub type DatabaseKind = sqlx::Sqlite;
#[cfg(feature = "postgres")]
pub type DatabaseKind = sqlx::Postgres;

/// Open the pool for the configured engine.
#[cfg(not(feature = "postgres"))]
pub async fn connect(url: &str) -> Result<Database> {
    use std::str::FromStr;
    let options = sqlx::sqlite::SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Open the pool for the configured engine.
#[cfg(feature = "postgres")]
pub async fn connect(url: &str) -> Result<Database> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await?;
    Ok(pool)
}

/// Fetch every row of a `json_result`-convention query as parsed JSON.
pub async fn fetch_json_rows<'e, E>(
    executor: E,
    dialect: &dyn SqlDialect,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Json>, ApiError>
where
    E: sqlx::Executor<'e, Database = DatabaseKind>,
{
    let sql = rewrite_placeholders(sql, dialect);
    tracing::debug!(sql = %sql, "executing query");
    let mut query = sqlx::query(&sql);
    for value in params {
        query = value.bind_to_query(query);
    }
    let rows = query.fetch_all(executor).await?;
    rows.iter()
        .map(|row| {
            let raw: String = row.try_get(0)?;
            serde_json::from_str(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(ApiError::from)
}

/// Fetch a single COUNT(*)-style integer.
pub async fn fetch_count<'e, E>(
    executor: E,
    dialect: &dyn SqlDialect,
    sql: &str,
    params: &[SqlValue],
) -> Result<i64, ApiError>
where
    E: sqlx::Executor<'e, Database = DatabaseKind>,
{
    let sql = rewrite_placeholders(sql, dialect);
    tracing::debug!(sql = %sql, "executing count query");
    let mut query = sqlx::query(&sql);
    for value in params {
        query = value.bind_to_query(query);
    }
    let row = query.fetch_one(executor).await?;
    Ok(row.try_get::<i64, _>(0)?)
}

/// Fetch the first column of the first row as a JSON scalar (the key value
/// returned by an insert), or None when no row came back.
pub async fn fetch_scalar<'e, E>(
    executor: E,
    dialect: &dyn SqlDialect,
    sql: &str,
    params: &[SqlValue],
) -> Result<Option<Json>, ApiError>
where
    E: sqlx::Executor<'e, Database = DatabaseKind>,
{
    let sql = rewrite_placeholders(sql, dialect);
    tracing::debug!(sql = %sql, "executing scalar query");
    let mut query = sqlx::query(&sql);
    for value in params {
        query = value.bind_to_query(query);
    }
    let Some(row) = query.fetch_optional(executor).await? else {
        return Ok(None);
    };
    if let Ok(v) = row.try_get::<i64, _>(0) {
        return Ok(Some(Json::from(v)));
    }
    Ok(Some(Json::from(row.try_get::<String, _>(0)?)))
}

/// Fetch the first column of every row as JSON scalars (junction key
/// listings).
pub async fn fetch_scalar_rows<'e, E>(
    executor: E,
    dialect: &dyn SqlDialect,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Json>, ApiError>
where
    E: sqlx::Executor<'e, Database = DatabaseKind>,
{
    let sql = rewrite_placeholders(sql, dialect);
    tracing::debug!(sql = %sql, "executing scalar list query");
    let mut query = sqlx::query(&sql);
    for value in params {
        query = value.bind_to_query(query);
    }
    let rows = query.fetch_all(executor).await?;
    let mut values = Vec::with_capacity(rows.len());
    for row in &rows {
        if let Ok(v) = row.try_get::<i64, _>(0) {
            values.push(Json::from(v));
        } else {
            values.push(Json::from(row.try_get::<String, _>(0)?));
        }
    }
    Ok(values)
}

/// Execute a statement, returning the number of affected rows.
pub async fn execute<'e, E>(
    executor: E,
    dialect: &dyn SqlDialect,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, ApiError>
where
    E: sqlx::Executor<'e, Database = DatabaseKind>,
{
    let sql = rewrite_placeholders(sql, dialect);
    tracing::debug!(sql = %sql, "executing statement");
    let mut query = sqlx::query(&sql);
    for value in params {
        query = value.bind_to_query(query);
    }
    let result = query.execute(executor).await?;
    Ok(result.rows_affected())
}
