//! SQL dialect abstraction
//!
//! A [SqlDialect] is a pure, stateless provider of engine-specific SQL
//! text: quoting, paging, JSON aggregation, insert shapes. The planner and
//! compiler are written against this trait only; one implementation exists
//! per supported engine.

use crate::error::ApiError;

/// Name of the single JSON column every wrapped query projects.
///
/// `wrap_into_json` and `json_property_navigation` consume queries that
/// follow this convention.
pub const JSON_RESULT: &str = "json_result";

pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_open(&self) -> char;
    fn quote_close(&self) -> char;

    /// Quote an identifier.
    fn quote(&self, ident: &str) -> String {
        format!("{}{}{}", self.quote_open(), ident, self.quote_close())
    }

    /// Engine literal for "now".
    fn current_timestamp(&self) -> &'static str;

    /// Engine literal for a boolean constant.
    fn bool_literal(&self, value: bool) -> &'static str;

    /// Positional parameter placeholder for a 1-based ordinal.
    fn positional_placeholder(&self, ordinal: usize) -> String;

    /// Case-insensitive pattern-match clause (`lhs` against the bound
    /// pattern at `rhs`).
    fn like_clause(&self, lhs: &str, rhs: &str) -> String;

    /// Append paging: zero-based page index times page size is the offset,
    /// page size is the limit.
    fn add_paging(&self, query: &str, page: i64, page_size: i64) -> String;

    /// Expression navigating into the wrapped JSON column, for sorting by a
    /// nested field. Valid wherever `json_result` is in scope.
    fn json_property_navigation(&self, segments: &[&str]) -> String;

    /// INSERT returning the generated key value as the single result column.
    fn insert_returning_id(
        &self,
        table: &str,
        schema: Option<&str>,
        key_column: &str,
        columns: &[String],
        placeholders: &[String],
    ) -> Result<String, ApiError>;

    /// Conditional two-column insert for junction rows; the placeholders
    /// appear both in the VALUES position and the existence probe, so each
    /// bound value is referenced twice by name.
    fn insert_if_not_exists(
        &self,
        table: &str,
        col1: &str,
        ph1: &str,
        col2: &str,
        ph2: &str,
        valid_from_column: Option<&str>,
    ) -> String;

    /// Render the SELECT clause from parallel projection lists.
    ///
    /// `column_paths[i]` is the dotted output path prefix of column `i`
    /// (empty at the root); `output_paths`, when non-empty, prunes the
    /// projection to the named full paths. With `wrap_as_json` the result
    /// is one JSON object per row, nested by grouping the dotted paths, in
    /// a column named [JSON_RESULT]; otherwise a flat aliased list.
    /// Mismatched list lengths are a caller bug reported as BadRequest.
    fn basic_select(
        &self,
        names: &[String],
        expressions: &[String],
        column_paths: &[String],
        output_paths: &[String],
        wrap_as_json: bool,
    ) -> Result<String, ApiError>;

    /// Wrap a [JSON_RESULT]-convention query into a JSON value: an array of
    /// row objects, or a single object when `without_array_wrapper`.
    /// `auto` lets an engine derive the row shape itself where supported;
    /// `include_nulls` keeps null-valued keys where the engine can strip them.
    fn wrap_into_json(
        &self,
        query: &str,
        auto: bool,
        include_nulls: bool,
        without_array_wrapper: bool,
    ) -> String;

    /// Mark an embedded expression as JSON (not text) when it appears as a
    /// value inside a JSON object construction.
    fn json_expr(&self, expr: &str) -> String;
}

/// One projected column: output name, SQL expression, dotted path prefix.
pub(crate) type SelectEntry = (String, String, String);

/// Validate list lengths and apply output-path pruning.
pub(crate) fn select_entries(
    names: &[String],
    expressions: &[String],
    column_paths: &[String],
    output_paths: &[String],
) -> Result<Vec<SelectEntry>, ApiError> {
    if names.len() != expressions.len() || names.len() != column_paths.len() {
        return Err(ApiError::BadRequest(
            "projection lists have mismatched lengths".into(),
        ));
    }
    let keep: Vec<String> = output_paths.iter().map(|p| p.to_ascii_lowercase()).collect();
    let entries: Vec<SelectEntry> = names
        .iter()
        .zip(expressions)
        .zip(column_paths)
        .filter(|((name, _), path)| {
            keep.is_empty() || keep.contains(&full_path(path, name).to_ascii_lowercase())
        })
        .map(|((name, expr), path)| (name.clone(), expr.clone(), path.clone()))
        .collect();
    if entries.is_empty() {
        return Err(ApiError::BadRequest("projection resolved to no columns".into()));
    }
    Ok(entries)
}

pub(crate) fn full_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

#[derive(Default)]
struct PathNode {
    pairs: Vec<(String, String)>,
    children: Vec<(String, PathNode)>,
}

impl PathNode {
    fn child(&mut self, segment: &str) -> &mut PathNode {
        if let Some(i) = self.children.iter().position(|(s, _)| s == segment) {
            &mut self.children[i].1
        } else {
            self.children.push((segment.to_string(), PathNode::default()));
            &mut self.children.last_mut().expect("just pushed").1
        }
    }

    /// First projected expression in this subtree; used as the NULL guard
    /// for nested objects produced by outer joins.
    fn first_expr(&self) -> Option<&str> {
        self.pairs
            .first()
            .map(|(_, e)| e.as_str())
            .or_else(|| self.children.iter().find_map(|(_, c)| c.first_expr()))
    }
}

fn escape_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Build the nested JSON-object expression for a set of projected columns,
/// grouping by dotted output path. `object_fn` is the engine's
/// object-construction function.
pub(crate) fn render_json_tree(object_fn: &str, entries: &[SelectEntry]) -> String {
    let mut root = PathNode::default();
    for (name, expr, path) in entries {
        let mut node = &mut root;
        if !path.is_empty() {
            for segment in path.split('.') {
                node = node.child(segment);
            }
        }
        node.pairs.push((name.clone(), expr.clone()));
    }
    render_node(object_fn, &root, true)
}

fn render_node(object_fn: &str, node: &PathNode, is_root: bool) -> String {
    let mut args = Vec::with_capacity(node.pairs.len() + node.children.len());
    for (name, expr) in &node.pairs {
        args.push(format!("'{}', {}", escape_string(name), expr));
    }
    for (segment, child) in &node.children {
        args.push(format!(
            "'{}', {}",
            escape_string(segment),
            render_node(object_fn, child, false)
        ));
    }
    let object = format!("{}({})", object_fn, args.join(", "));
    if is_root {
        object
    } else {
        // A LEFT-JOINed row that matched nothing must project as NULL, not
        // as an object full of NULLs. The group's leading expression is the
        // joined entity's key column.
        match node.first_expr() {
            Some(guard) => format!("CASE WHEN {guard} IS NULL THEN NULL ELSE {object} END"),
            None => object,
        }
    }
}

/// Flat (non-JSON) SELECT list: dotted full path as the output alias.
pub(crate) fn render_flat(dialect: &dyn SqlDialect, entries: &[SelectEntry]) -> String {
    let list: Vec<String> = entries
        .iter()
        .map(|(name, expr, path)| format!("{} AS {}", expr, dialect.quote(&full_path(path, name))))
        .collect();
    format!("SELECT {}", list.join(", "))
}
