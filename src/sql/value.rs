//! Bindable SQL parameter values.

use serde_json::Value as Json;

use crate::error::ApiError;

/// Represents a SQL value that can be bound to a query.
///
/// Filter compilation and the write path collect these alongside the
/// generated statement; binding happens once, in parameter order.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl SqlValue {
    /// Convert a JSON literal from the wire into a bindable value.
    ///
    /// Arrays and objects are not valid comparison literals.
    pub fn from_json(value: &Json) -> Result<Self, ApiError> {
        match value {
            Json::Null => Ok(SqlValue::Null),
            Json::Bool(b) => Ok(SqlValue::Bool(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(SqlValue::Float(f))
                } else {
                    Err(ApiError::BadRequest(format!("unrepresentable number: {n}")))
                }
            }
            Json::String(s) => Ok(SqlValue::String(s.clone())),
            Json::Array(_) | Json::Object(_) => Err(ApiError::BadRequest(
                "filter literal must be a scalar".into(),
            )),
        }
    }

    /// Bind this value to a sqlx query builder.
    #[cfg(not(feature = "postgres"))]
    pub fn bind_to_query<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match self {
            SqlValue::String(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Bool(b) => query.bind(if *b { 1i32 } else { 0i32 }),
            SqlValue::Null => query.bind(None::<String>),
        }
    }

    /// Bind this value to a sqlx query builder.
    #[cfg(feature = "postgres")]
    pub fn bind_to_query<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        match self {
            SqlValue::String(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Null => query.bind(None::<String>),
        }
    }
}
