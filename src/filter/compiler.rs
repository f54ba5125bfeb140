//! Comparer-tree to SQL compilation
//!
//! Turns a [Comparer] tree into a boolean SQL fragment plus the ordered
//! parameter list. The parameter counter is threaded through every
//! recursive call so names never collide when fragments are merged into
//! one statement; compiling the same tree with the same starting counter
//! is deterministic down to the byte.

use serde_json::Value as Json;

use super::{CONTAINS_ANY, Comparer, Conjunction, USER_TOKEN};
use crate::auth::Principal;
use crate::error::ApiError;
use crate::graph::model::Entity;
use crate::graph::registry::EntityGraph;
use crate::sql::{SqlDialect, SqlValue, param_name};

/// Result of compiling one comparer tree.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub sql: String,
    /// Counter value after the last parameter, for merging fragments.
    pub next_param: usize,
    pub params: Vec<SqlValue>,
}

/// Compile `node` against `entity`, qualifying columns with `table_alias`
/// (bare column names when the alias is empty).
pub fn compile(
    node: &Comparer,
    entity: &Entity,
    graph: &EntityGraph,
    dialect: &dyn SqlDialect,
    principal: &Principal,
    param_start: usize,
    table_alias: &str,
) -> Result<CompiledFilter, ApiError> {
    let mut compiler = Compiler {
        graph,
        dialect,
        principal,
        counter: param_start,
        params: Vec::new(),
    };
    let sql = compiler.compile_node(node, entity, table_alias)?;
    Ok(CompiledFilter {
        sql,
        next_param: compiler.counter,
        params: compiler.params,
    })
}

struct Compiler<'a> {
    graph: &'a EntityGraph,
    dialect: &'a dyn SqlDialect,
    principal: &'a Principal,
    counter: usize,
    params: Vec<SqlValue>,
}

/// Predicate that matches every row; also the fallback for operators the
/// grammar does not recognize.
const TAUTOLOGY: &str = "1 = 1";

impl<'a> Compiler<'a> {
    fn push_param(&mut self, value: SqlValue) -> String {
        let name = param_name(self.counter);
        self.counter += 1;
        self.params.push(value);
        name
    }

    /// The comparison literal as a bindable value, with the `$user` token
    /// replaced by the principal id (NULL when unauthenticated).
    fn literal(&self, filter: &Json) -> Result<SqlValue, ApiError> {
        if filter.as_str() == Some(USER_TOKEN) {
            return Ok(match &self.principal.user_id {
                Some(id) => SqlValue::String(id.clone()),
                None => SqlValue::Null,
            });
        }
        SqlValue::from_json(filter)
    }

    fn compile_node(
        &mut self,
        node: &Comparer,
        entity: &Entity,
        alias: &str,
    ) -> Result<String, ApiError> {
        match node {
            Comparer::Leaf {
                property,
                operator,
                filter,
            } => {
                if operator.eq_ignore_ascii_case(CONTAINS_ANY) {
                    // A lone word-search leaf behaves as a group of one.
                    self.compile_contains_any(std::slice::from_ref(node), entity, alias)
                } else {
                    self.compile_leaf(property, operator, filter, entity, alias)
                }
            }
            Comparer::Group {
                conjunction,
                comparisons,
            } => self.compile_group(*conjunction, comparisons, entity, alias),
        }
    }

    fn compile_group(
        &mut self,
        conjunction: Conjunction,
        comparisons: &[Comparer],
        entity: &Entity,
        alias: &str,
    ) -> Result<String, ApiError> {
        let (word_search, ordinary): (Vec<&Comparer>, Vec<&Comparer>) =
            comparisons.iter().partition(|c| {
                matches!(c, Comparer::Leaf { operator, .. }
                    if operator.eq_ignore_ascii_case(CONTAINS_ANY))
            });

        let mut clauses = Vec::with_capacity(ordinary.len() + 1);
        for child in ordinary {
            clauses.push(self.compile_node(child, entity, alias)?);
        }
        if !word_search.is_empty() {
            clauses.push(self.compile_contains_any(&word_search, entity, alias)?);
        }
        if clauses.is_empty() {
            return Ok(TAUTOLOGY.to_string());
        }

        let joined = match conjunction {
            Conjunction::And | Conjunction::Not => clauses.join(" AND "),
            Conjunction::Or => clauses.join(" OR "),
        };
        Ok(match conjunction {
            Conjunction::Not => format!("NOT ({joined})"),
            _ => format!("({joined})"),
        })
    }

    /// Word search across several properties: the filter text of the first
    /// member is split into words; a row matches when every word appears in
    /// at least one of the member properties.
    fn compile_contains_any(
        &mut self,
        members: &[impl std::borrow::Borrow<Comparer>],
        entity: &Entity,
        alias: &str,
    ) -> Result<String, ApiError> {
        let mut columns = Vec::with_capacity(members.len());
        let mut search_text: Option<String> = None;
        for member in members {
            let Comparer::Leaf {
                property, filter, ..
            } = member.borrow()
            else {
                return Err(ApiError::BadRequest(
                    "word search accepts only leaf comparisons".into(),
                ));
            };
            if search_text.is_none() {
                search_text = Some(match filter {
                    Json::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
            columns.push(self.resolve_direct_column(property, entity, alias)?);
        }

        let text = search_text.unwrap_or_default();
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() || columns.is_empty() {
            return Ok(TAUTOLOGY.to_string());
        }

        let mut word_clauses = Vec::with_capacity(words.len());
        for word in words {
            let mut alternatives = Vec::with_capacity(columns.len());
            for column in &columns {
                let placeholder = self.push_param(SqlValue::String(format!("%{word}%")));
                alternatives.push(self.dialect.like_clause(column, &placeholder));
            }
            word_clauses.push(format!("({})", alternatives.join(" OR ")));
        }
        Ok(format!("({})", word_clauses.join(" AND ")))
    }

    fn compile_leaf(
        &mut self,
        property: &str,
        operator: &str,
        filter: &Json,
        entity: &Entity,
        alias: &str,
    ) -> Result<String, ApiError> {
        let segments: Vec<&str> = property.split('.').collect();
        if segments.len() == 1 {
            let lhs = self.resolve_direct_column(property, entity, alias)?;
            self.compile_predicate(&lhs, operator, filter)
        } else {
            self.compile_path_leaf(&segments, operator, filter, entity, alias)
        }
    }

    /// Single-segment resolution: a column on the entity itself.
    fn resolve_direct_column(
        &self,
        name: &str,
        entity: &Entity,
        alias: &str,
    ) -> Result<String, ApiError> {
        let prop = entity
            .property(name)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid filter property: {name}")))?;
        if prop.is_inverse() {
            return Err(ApiError::BadRequest(format!(
                "cannot compare collection property: {name}"
            )));
        }
        Ok(if alias.is_empty() {
            prop.column.clone()
        } else {
            format!("{alias}.{}", self.dialect.quote(&prop.column))
        })
    }

    /// Multi-hop path: correlated EXISTS walking foreign keys, referencing
    /// properties and relations, terminating in a column predicate.
    fn compile_path_leaf(
        &mut self,
        segments: &[&str],
        operator: &str,
        filter: &Json,
        entity: &Entity,
        outer_alias: &str,
    ) -> Result<String, ApiError> {
        struct Hop {
            table: String,
            alias: String,
            predicate: String,
        }

        let outer_column = |column: &str| {
            if outer_alias.is_empty() {
                column.to_string()
            } else {
                format!("{outer_alias}.{}", self.dialect.quote(column))
            }
        };

        let mut hops: Vec<Hop> = Vec::new();
        let mut extra_filters: Vec<String> = Vec::new();
        let mut current = entity;
        let mut prev_alias: Option<String> = None;

        for (i, segment) in segments[..segments.len() - 1].iter().enumerate() {
            let n = i + 1;
            let hop_alias = format!("fil_tab{n}");
            let link = |column: &str| match &prev_alias {
                Some(prev) => format!("{prev}.{}", self.dialect.quote(column)),
                None => outer_column(column),
            };

            let target_key = if let Some(prop) = current.property(segment) {
                if let Some(target) = &prop.references_entity {
                    let target_entity = self.entity(target)?;
                    hops.push(Hop {
                        table: target_entity.table.clone(),
                        alias: hop_alias.clone(),
                        predicate: format!(
                            "{hop_alias}.{} = {}",
                            self.dialect.quote(&target_entity.key_property().column),
                            link(&prop.column)
                        ),
                    });
                    target.clone()
                } else if let (Some(target), Some(inverse)) =
                    (&prop.related_entity, &prop.related_property)
                {
                    let target_entity = self.entity(target)?;
                    let fk = target_entity.property(inverse).ok_or_else(|| {
                        ApiError::BadRequest(format!(
                            "invalid filter property: {segment} (no {inverse} on {target})"
                        ))
                    })?;
                    hops.push(Hop {
                        table: target_entity.table.clone(),
                        alias: hop_alias.clone(),
                        predicate: format!(
                            "{hop_alias}.{} = {}",
                            self.dialect.quote(&fk.column),
                            link(&current.key_property().column)
                        ),
                    });
                    target.clone()
                } else {
                    return Err(ApiError::BadRequest(format!(
                        "filter property {segment} is not a navigation"
                    )));
                }
            } else if let Some(referencing) = current.referencing_property(segment) {
                hops.push(Hop {
                    table: self.entity(&referencing.entity)?.table.clone(),
                    alias: hop_alias.clone(),
                    predicate: format!(
                        "{hop_alias}.{} = {}",
                        self.dialect.quote(&referencing.column),
                        link(&current.key_property().column)
                    ),
                });
                referencing.entity.clone()
            } else if let Some((rel, side)) = current.relation(segment) {
                let cross_alias = format!("fil_cross_tab{n}");
                let far_entity = self.entity(side.far_entity)?;
                hops.push(Hop {
                    table: rel.cross_table.clone(),
                    alias: cross_alias.clone(),
                    predicate: format!(
                        "{cross_alias}.{} = {}",
                        self.dialect.quote(side.near_column),
                        link(&current.key_property().column)
                    ),
                });
                hops.push(Hop {
                    table: far_entity.table.clone(),
                    alias: hop_alias.clone(),
                    predicate: format!(
                        "{hop_alias}.{} = {cross_alias}.{}",
                        self.dialect.quote(&far_entity.key_property().column),
                        self.dialect.quote(side.far_column)
                    ),
                });
                if let Some(window) = rel.window_predicate(&cross_alias, self.dialect) {
                    extra_filters.push(window);
                }
                side.far_entity.to_string()
            } else {
                return Err(ApiError::BadRequest(format!(
                    "invalid filter property: {segment}"
                )));
            };

            current = self.entity(&target_key)?;
            // Rows soft-deleted along the path never satisfy a filter.
            if let Some(soft) = &current.soft_delete_column {
                extra_filters.push(format!("{hop_alias}.{} IS NULL", self.dialect.quote(soft)));
            }
            prev_alias = Some(hop_alias);
        }

        let terminal_alias = prev_alias.unwrap_or_default();
        let lhs = self.resolve_direct_column(
            segments.last().expect("at least two segments"),
            current,
            &terminal_alias,
        )?;
        let terminal = self.compile_predicate(&lhs, operator, filter)?;

        let first = hops.first().ok_or_else(|| {
            ApiError::BadRequest("empty filter property path".into())
        })?;
        let mut sql = format!(
            "EXISTS (SELECT 1 FROM {} {}",
            self.dialect.quote(&first.table),
            first.alias
        );
        for hop in &hops[1..] {
            sql.push_str(&format!(
                " INNER JOIN {} {} ON {}",
                self.dialect.quote(&hop.table),
                hop.alias,
                hop.predicate
            ));
        }
        sql.push_str(&format!(" WHERE {}", first.predicate));
        for clause in &extra_filters {
            sql.push_str(&format!(" AND {clause}"));
        }
        sql.push_str(&format!(" AND {terminal})"));
        Ok(sql)
    }

    fn entity(&self, key: &str) -> Result<&'a Entity, ApiError> {
        self.graph
            .entity(key)
            .map(|e| e.as_ref())
            .ok_or_else(|| ApiError::Internal(format!("unknown entity in graph: {key}")))
    }

    /// Terminal predicate for one resolved column.
    ///
    /// `gte` compiles to `<=` and `lte` to `>=`: existing clients depend on
    /// this mapping, so it is kept as wire-format behavior.
    fn compile_predicate(
        &mut self,
        lhs: &str,
        operator: &str,
        filter: &Json,
    ) -> Result<String, ApiError> {
        let op = operator.to_ascii_lowercase();
        Ok(match op.as_str() {
            "eq" => {
                let p = self.push_param(self.literal(filter)?);
                format!("{lhs} = {p}")
            }
            "neq" => {
                let p = self.push_param(self.literal(filter)?);
                format!("{lhs} != {p}")
            }
            "gte" => {
                let p = self.push_param(self.literal(filter)?);
                format!("{lhs} <= {p}")
            }
            "lte" => {
                let p = self.push_param(self.literal(filter)?);
                format!("{lhs} >= {p}")
            }
            "gt" => {
                let p = self.push_param(self.literal(filter)?);
                format!("{lhs} > {p}")
            }
            "lt" => {
                let p = self.push_param(self.literal(filter)?);
                format!("{lhs} < {p}")
            }
            "null" => format!("{lhs} IS NULL"),
            "not null" => format!("{lhs} IS NOT NULL"),
            "contains" | "startswith" | "endswith" => {
                let text = match filter {
                    Json::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let pattern = match op.as_str() {
                    "contains" => format!("%{text}%"),
                    "startswith" => format!("{text}%"),
                    _ => format!("%{text}"),
                };
                let p = self.push_param(SqlValue::String(pattern));
                self.dialect.like_clause(lhs, &p)
            }
            _ => TAUTOLOGY.to_string(),
        })
    }
}
