//! GraphQL document conversion
//!
//! Translates a parsed GraphQL query into the same [QueryRequest] the REST
//! surface produces: resource name, paging, sorting, a comparer tree built
//! from the `where` argument, and dotted projection paths from the
//! selection set. Execution then follows the exact same pipeline, so both
//! surfaces share one security and compilation path.

use std::collections::HashSet;

use async_graphql::parser::parse_query;
use async_graphql::parser::types::{ExecutableDocument, Field, Selection};
use async_graphql::{Name, Value as GqlValue};
use once_cell::sync::Lazy;
use serde_json::Value as Json;

use crate::error::ApiError;
use crate::filter::{Comparer, Conjunction};
use crate::query::{QueryRequest, SortOrder};

/// Wire operator names accepted in operator-object position
/// (`{status: {eq: "active"}}`).
static OPERATORS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("eq", "eq"),
        ("neq", "neq"),
        ("gte", "gte"),
        ("lte", "lte"),
        ("gt", "gt"),
        ("lt", "lt"),
        ("contains", "contains"),
        ("startswith", "startswith"),
        ("endswith", "endswith"),
        ("null", "null"),
        ("notnull", "not null"),
        ("containsany", "contains-any"),
    ]
});

/// Field-name suffixes (`status_eq: "active"`), longest first so `_neq`
/// never matches as `_eq`.
static SUFFIXES: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("_containsany", "contains-any"),
        ("_startswith", "startswith"),
        ("_endswith", "endswith"),
        ("_contains", "contains"),
        ("_notnull", "not null"),
        ("_null", "null"),
        ("_neq", "neq"),
        ("_gte", "gte"),
        ("_lte", "lte"),
        ("_eq", "eq"),
        ("_gt", "gt"),
        ("_lt", "lt"),
    ]
});

/// Convert a GraphQL query document into a [QueryRequest].
pub fn convert(document: &str) -> Result<QueryRequest, ApiError> {
    let doc: ExecutableDocument = parse_query(document)
        .map_err(|e| ApiError::BadRequest(format!("malformed GraphQL document: {e}")))?;

    let (_, operation) = doc
        .operations
        .iter()
        .next()
        .ok_or_else(|| ApiError::BadRequest("document has no operation".into()))?;

    let root = operation
        .node
        .selection_set
        .node
        .items
        .iter()
        .find_map(|sel| match &sel.node {
            Selection::Field(field) => Some(&field.node),
            _ => None,
        })
        .ok_or_else(|| ApiError::BadRequest("operation selects no field".into()))?;

    let mut request = QueryRequest::new(root.name.node.as_str());

    if let Some(page) = argument(root, "page")? {
        request.page = int_argument("page", &page)?;
    }
    if let Some(size) = argument(root, "pageSize")? {
        request.page_size = int_argument("pageSize", &size)?;
    }
    if let Some(sort) = argument(root, "sortProperty")? {
        request.sort_property = Some(text_argument(&sort));
    }
    if let Some(order) = argument(root, "sortOrder")? {
        request.sort_order = match text_argument(&order).to_ascii_lowercase().as_str() {
            "desc" => SortOrder::Desc,
            _ => SortOrder::Asc,
        };
    }

    let where_arg = match argument(root, "where")? {
        Some(v) => Some(v),
        None => argument(root, "filter")?,
    };
    if let Some(value) = where_arg {
        let GqlValue::Object(map) = value else {
            return Err(ApiError::BadRequest("where must be an object".into()));
        };
        request.filter = convert_filter_object("", &map)?;
    }

    let mut projection = HashSet::new();
    collect_paths(root, "", &mut projection)?;
    if !projection.is_empty() {
        request.projection = Some(projection);
    }

    Ok(request)
}

fn argument(field: &Field, name: &str) -> Result<Option<GqlValue>, ApiError> {
    let Some(value) = field.get_argument(name) else {
        return Ok(None);
    };
    value
        .node
        .clone()
        .into_const()
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest(format!("argument {name} must not use variables")))
}

fn int_argument(name: &str, value: &GqlValue) -> Result<i64, ApiError> {
    match value {
        GqlValue::Number(n) => n
            .as_i64()
            .ok_or_else(|| ApiError::BadRequest(format!("argument {name} must be an integer"))),
        _ => Err(ApiError::BadRequest(format!(
            "argument {name} must be an integer"
        ))),
    }
}

fn text_argument(value: &GqlValue) -> String {
    match value {
        GqlValue::String(s) => s.clone(),
        GqlValue::Enum(name) => name.to_string(),
        other => other.to_string(),
    }
}

/// One conversion rule per field of a `where` object; multiple fields AND
/// together.
fn convert_filter_object(
    prefix: &str,
    map: &async_graphql::indexmap::IndexMap<Name, GqlValue>,
) -> Result<Option<Comparer>, ApiError> {
    let mut nodes = Vec::new();
    for (name, value) in map {
        nodes.extend(convert_filter_field(prefix, name.as_str(), value)?);
    }
    Ok(match nodes.len() {
        0 => None,
        1 => nodes.into_iter().next(),
        _ => Some(Comparer::group(Conjunction::And, nodes)),
    })
}

fn convert_filter_field(
    prefix: &str,
    name: &str,
    value: &GqlValue,
) -> Result<Vec<Comparer>, ApiError> {
    // and/or/not with a list of sub-objects form a group node.
    let conjunction = match name.to_ascii_lowercase().as_str() {
        "and" => Some(Conjunction::And),
        "or" => Some(Conjunction::Or),
        "not" => Some(Conjunction::Not),
        _ => None,
    };
    if let (Some(conjunction), GqlValue::List(items)) = (conjunction, value) {
        let mut children = Vec::new();
        for item in items {
            let GqlValue::Object(map) = item else {
                return Err(ApiError::BadRequest(format!(
                    "{name} expects a list of filter objects"
                )));
            };
            if let Some(node) = convert_filter_object(prefix, map)? {
                children.push(node);
            }
        }
        return Ok(vec![Comparer::group(conjunction, children)]);
    }

    let path = if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    };

    if let GqlValue::Object(map) = value {
        let all_operators = !map.is_empty()
            && map.keys().all(|k| {
                let k = k.to_ascii_lowercase();
                OPERATORS.iter().any(|(op, _)| *op == k)
            });
        if all_operators {
            // {status: {eq: "active", neq: null}} -> one leaf per operator
            let mut leaves = Vec::new();
            for (op_name, op_value) in map {
                let op = OPERATORS
                    .iter()
                    .find(|(op, _)| *op == op_name.to_ascii_lowercase())
                    .map(|(_, wire)| *wire)
                    .expect("checked all_operators above");
                leaves.push(Comparer::leaf(path.clone(), op, to_json(op_value)?));
            }
            return Ok(leaves);
        }
        // Nested-entity filter: recurse with the field on the path prefix.
        return Ok(convert_filter_object(&path, map)?.into_iter().collect());
    }

    // Operator spelled as a field-name suffix.
    for (suffix, op) in SUFFIXES.iter() {
        if let Some(stem) = name.strip_suffix(suffix) {
            if !stem.is_empty() {
                let path = if prefix.is_empty() {
                    stem.to_string()
                } else {
                    format!("{prefix}.{stem}")
                };
                return Ok(vec![Comparer::leaf(path, *op, to_json(value)?)]);
            }
        }
    }

    // Shorthand equality.
    Ok(vec![Comparer::leaf(path, "eq", to_json(value)?)])
}

fn to_json(value: &GqlValue) -> Result<Json, ApiError> {
    value
        .clone()
        .into_json()
        .map_err(|e| ApiError::BadRequest(format!("unsupported filter literal: {e}")))
}

/// Flatten the selection set into dotted, lowercased projection paths.
fn collect_paths(field: &Field, prefix: &str, out: &mut HashSet<String>) -> Result<(), ApiError> {
    for selection in &field.selection_set.node.items {
        match &selection.node {
            Selection::Field(f) => {
                let name = f.node.name.node.to_ascii_lowercase();
                let path = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}.{name}")
                };
                if f.node.selection_set.node.items.is_empty() {
                    out.insert(path);
                } else {
                    collect_paths(&f.node, &path, out)?;
                }
            }
            _ => {
                return Err(ApiError::BadRequest(
                    "fragments are not supported".into(),
                ));
            }
        }
    }
    Ok(())
}
