//! PostgreSQL dialect.

use super::dialect::{JSON_RESULT, SqlDialect, render_flat, render_json_tree, select_entries};
use crate::error::ApiError;

/// SQL rendering rules for PostgreSQL.
///
/// JSON objects via `json_build_object`, arrays via `json_agg`; `$N`
/// positional parameters; ILIKE for case-insensitive matching. With
/// `auto`, `wrap_into_json` derives the row shape via `row_to_json`
/// instead of expecting the `json_result` convention.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_open(&self) -> char {
        '"'
    }

    fn quote_close(&self) -> char {
        '"'
    }

    fn current_timestamp(&self) -> &'static str {
        "NOW()"
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value { "TRUE" } else { "FALSE" }
    }

    fn positional_placeholder(&self, ordinal: usize) -> String {
        format!("${ordinal}")
    }

    fn like_clause(&self, lhs: &str, rhs: &str) -> String {
        format!("{lhs} ILIKE {rhs}")
    }

    fn add_paging(&self, query: &str, page: i64, page_size: i64) -> String {
        format!("{query} LIMIT {page_size} OFFSET {}", page * page_size)
    }

    fn json_property_navigation(&self, segments: &[&str]) -> String {
        format!("{JSON_RESULT} #>> '{{{}}}'", segments.join(","))
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
                render_json_tree("json_build_object", &entries)
            ))
        } else {
            Ok(render_flat(self, &entries))
        }
    }

    fn wrap_into_json(
        &self,
        query: &str,
        auto: bool,
        include_nulls: bool,
        without_array_wrapper: bool,
    ) -> String {
        let row = if auto {
            "row_to_json(sub)".to_string()
        } else {
            format!("sub.{JSON_RESULT}")
        };
        if without_array_wrapper {
            let row = if include_nulls {
                row
            } else {
                format!("json_strip_nulls({row})")
            };
            format!("SELECT {row} AS {JSON_RESULT} FROM ({query}) AS sub LIMIT 1")
        } else {
            let aggregated = format!("COALESCE(json_agg({row}), '[]'::json)");
            let aggregated = if include_nulls {
                aggregated
            } else {
                format!("json_strip_nulls({aggregated})")
            };
            format!("SELECT {aggregated} AS {JSON_RESULT} FROM ({query}) AS sub")
        }
    }

    fn json_expr(&self, expr: &str) -> String {
        // json_build_object keeps json-typed values as JSON.
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_paging_matches_sqlite_semantics() {
        let d = PostgresDialect;
        assert_eq!(
            d.add_paging("SELECT 1", 2, 10),
            "SELECT 1 LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_placeholders_are_dollar_numbered() {
        let d = PostgresDialect;
        assert_eq!(d.positional_placeholder(1), "$1");
        assert_eq!(d.positional_placeholder(7), "$7");
    }

    #[test]
    fn test_like_is_ilike() {
        let d = PostgresDialect;
        assert_eq!(d.like_clause("t.\"Name\"", "$1"), "t.\"Name\" ILIKE $1");
    }

    #[test]
    fn test_basic_select_uses_json_build_object() {
        let d = PostgresDialect;
        let sql = d
            .basic_select(
                &strings(&["id", "name"]),
                &strings(&["t.\"Id\"", "t.\"Name\""]),
                &strings(&["", ""]),
                &[],
                true,
            )
            .unwrap();
        assert_eq!(
            sql,
            "SELECT json_build_object('id', t.\"Id\", 'name', t.\"Name\") AS json_result"
        );
    }

    #[test]
    fn test_wrap_into_json_aggregates_with_empty_fallback() {
        let d = PostgresDialect;
        assert_eq!(
            d.wrap_into_json("SELECT x AS json_result", false, true, false),
            "SELECT COALESCE(json_agg(sub.json_result), '[]'::json) AS json_result \
             FROM (SELECT x AS json_result) AS sub"
        );
    }

    #[test]
    fn test_wrap_into_json_auto_uses_row_to_json() {
        let d = PostgresDialect;
        assert_eq!(
            d.wrap_into_json("SELECT 1 AS n", true, true, true),
            "SELECT row_to_json(sub) AS json_result FROM (SELECT 1 AS n) AS sub LIMIT 1"
        );
    }

    #[test]
    fn test_json_property_navigation() {
        let d = PostgresDialect;
        assert_eq!(
            d.json_property_navigation(&["customer", "name"]),
            "json_result #>> '{customer,name}'"
        );
    }

    #[test]
    fn test_insert_returning_id_with_schema() {
        let d = PostgresDialect;
        let sql = d
            .insert_returning_id(
                "Orders",
                Some("public"),
                "Id",
                &strings(&["Status"]),
                &strings(&["@Filter_Int0"]),
            )
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"Orders\" (\"Status\") \
             VALUES (@Filter_Int0) RETURNING \"Id\""
        );
    }
}
