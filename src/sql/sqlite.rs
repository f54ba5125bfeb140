//! SQLite dialect.

use super::dialect::{JSON_RESULT, SqlDialect, render_flat, render_json_tree, select_entries};
use crate::error::ApiError;

/// SQL rendering rules for SQLite.
///
/// JSON objects via `json_object`, arrays via `json_group_array`; `?N`
/// positional parameters. The `auto` and `include_nulls` flags of
/// `wrap_into_json` have no SQLite rendering: wrapped queries always follow
/// the `json_result` column convention and `json_object` keeps null keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_open(&self) -> char {
        '"'
    }

    fn quote_close(&self) -> char {
        '"'
    }

    fn current_timestamp(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value { "1" } else { "0" }
    }

    fn positional_placeholder(&self, ordinal: usize) -> String {
        format!("?{ordinal}")
    }

    fn like_clause(&self, lhs: &str, rhs: &str) -> String {
        // SQLite LIKE is case-insensitive for ASCII by default.
        format!("{lhs} LIKE {rhs}")
    }

    fn add_paging(&self, query: &str, page: i64, page_size: i64) -> String {
        format!("{query} LIMIT {page_size} OFFSET {}", page * page_size)
    }

    fn json_property_navigation(&self, segments: &[&str]) -> String {
        format!("json_extract({JSON_RESULT}, '$.{}')", segments.join("."))
    }

    fn insert_returning_id(
        &self,
        table: &str,
        schema: Option<&str>,
        key_column: &str,
        columns: &[String],
        placeholders: &[String],
    ) -> Result<String, ApiError> {
        if columns.len() != placeholders.len() {
            return Err(ApiError::BadRequest(
                "insert column and placeholder lists have mismatched lengths".into(),
            ));
        }
        let table = match schema {
            Some(s) => format!("{}.{}", self.quote(s), self.quote(table)),
            None => self.quote(table),
        };
        let sql = if columns.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES RETURNING {}", self.quote(key_column))
        } else {
            let cols: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
            format!(
                "INSERT INTO {table} ({}) VALUES ({}) RETURNING {}",
                cols.join(", "),
                placeholders.join(", "),
                self.quote(key_column)
            )
        };
        Ok(sql)
    }

    fn insert_if_not_exists(
        &self,
        table: &str,
        col1: &str,
        ph1: &str,
        col2: &str,
        ph2: &str,
        valid_from_column: Option<&str>,
    ) -> String {
        let table = self.quote(table);
        let (c1, c2) = (self.quote(col1), self.quote(col2));
        let (mut cols, mut vals) = (format!("{c1}, {c2}"), format!("{ph1}, {ph2}"));
        if let Some(vf) = valid_from_column {
            cols.push_str(&format!(", {}", self.quote(vf)));
            vals.push_str(&format!(", {}", self.current_timestamp()));
        }
        format!(
            "INSERT INTO {table} ({cols}) SELECT {vals} \
             WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {c1} = {ph1} AND {c2} = {ph2})"
        )
    }

    fn basic_select(
        &self,
        names: &[String],
        expressions: &[String],
        column_paths: &[String],
        output_paths: &[String],
        wrap_as_json: bool,
    ) -> Result<String, ApiError> {
        let entries = select_entries(names, expressions, column_paths, output_paths)?;
        if wrap_as_json {
            Ok(format!(
                "SELECT {} AS {JSON_RESULT}",
                render_json_tree("json_object", &entries)
            ))
        } else {
            Ok(render_flat(self, &entries))
        }
    }

    fn wrap_into_json(
        &self,
        query: &str,
        _auto: bool,
        _include_nulls: bool,
        without_array_wrapper: bool,
    ) -> String {
        if without_array_wrapper {
            format!("SELECT sub.{JSON_RESULT} FROM ({query}) AS sub LIMIT 1")
        } else {
            // json_group_array yields [] over an empty row set.
            format!(
                "SELECT json_group_array(json(sub.{JSON_RESULT})) AS {JSON_RESULT} FROM ({query}) AS sub"
            )
        }
    }

    fn json_expr(&self, expr: &str) -> String {
        // Subquery results lose the JSON subtype; re-mark them.
        format!("json({expr})")
    }
}
