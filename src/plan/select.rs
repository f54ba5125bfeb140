//! Recursive select planning and rendering.

use std::collections::HashSet;
use std::sync::Arc;

use super::{JoinNode, Link};
use crate::auth::Principal;
use crate::error::ApiError;
use crate::filter;
use crate::graph::model::Entity;
use crate::graph::registry::EntityGraph;
use crate::permission::{Access, PermissionResolver};
use crate::sql::{SqlDialect, SqlValue};

/// Alias of the root table in every planned statement.
pub const ROOT_ALIAS: &str = "t";

/// A rendered select, ready for the orchestrator to append row filters,
/// sorting and paging.
#[derive(Debug)]
pub struct PlannedQuery {
    /// `SELECT ... AS json_result` (or a flat list when not wrapping).
    pub select: String,
    /// `FROM <root table> t LEFT JOIN ...`
    pub from: String,
    /// Root-scoped predicates (the entity's own soft-delete check).
    pub base_filters: Vec<String>,
    pub params: Vec<SqlValue>,
    pub next_param: usize,
}

impl PlannedQuery {
    /// Assemble the full statement with extra root predicates ANDed in.
    pub fn to_sql(&self, extra_filters: &[String]) -> String {
        let mut sql = format!("{} {}", self.select, self.from);
        let filters: Vec<&String> = self.base_filters.iter().chain(extra_filters).collect();
        if !filters.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(
                &filters
                    .iter()
                    .map(|f| f.as_str())
                    .collect::<Vec<_>>()
                    .join(" AND "),
            );
        }
        sql
    }
}

/// Plans and renders one entity read over the immutable graph.
///
/// Pure over its inputs; the parameter counter is threaded through nested
/// permission-filter compilation so merged fragments never collide.
pub struct SelectPlanner<'a> {
    pub graph: &'a EntityGraph,
    pub dialect: &'a dyn SqlDialect,
    pub resolver: &'a PermissionResolver,
    pub principal: &'a Principal,
}

struct PlanCtx {
    counter: usize,
    params: Vec<SqlValue>,
    alias_seq: usize,
}

impl<'a> SelectPlanner<'a> {
    /// Plan a read of `entity`, projecting `requested` dotted paths
    /// (lowercase; None means the full default projection).
    pub fn plan(
        &self,
        entity: &Arc<Entity>,
        requested: Option<&HashSet<String>>,
        param_start: usize,
        wrap_as_json: bool,
    ) -> Result<PlannedQuery, ApiError> {
        let mut ctx = PlanCtx {
            counter: param_start,
            params: Vec::new(),
            alias_seq: 0,
        };
        let mut visited = HashSet::new();
        visited.insert(entity.key.clone());

        let root = self.build_node(
            &mut ctx,
            entity,
            ROOT_ALIAS.to_string(),
            Link::Root,
            String::new(),
            String::new(),
            &visited,
            requested,
        )?;

        let mut entries = Vec::new();
        let mut joins = String::new();
        self.collect(&root, &mut entries, &mut joins)?;
        if entries.is_empty() {
            return Err(ApiError::BadRequest(
                "projection resolved to no columns".into(),
            ));
        }

        let (names, exprs, paths) = split_entries(&entries);
        let select = self
            .dialect
            .basic_select(&names, &exprs, &paths, &[], wrap_as_json)?;
        let from = format!(
            "FROM {} {}{}",
            self.dialect.quote(&root.table),
            root.alias,
            joins
        );

        Ok(PlannedQuery {
            select,
            from,
            base_filters: root.filters.clone(),
            params: ctx.params,
            next_param: ctx.counter,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_node(
        &self,
        ctx: &mut PlanCtx,
        entity: &Arc<Entity>,
        alias: String,
        link: Link,
        out_name: String,
        path: String,
        visited: &HashSet<String>,
        requested: Option<&HashSet<String>>,
    ) -> Result<JoinNode, ApiError> {
        let is_root = matches!(link, Link::Root);
        let mut node = JoinNode {
            alias,
            table: entity.table.clone(),
            link,
            out_name,
            path,
            columns: Vec::new(),
            singles: Vec::new(),
            arrays: Vec::new(),
            filters: Vec::new(),
        };

        if let Some(soft) = &entity.soft_delete_column {
            node.filters
                .push(format!("{}.{} IS NULL", node.alias, self.dialect.quote(soft)));
        }
        // Nested entities get their role view filter compiled into the join
        // scope; the root permission filter is the orchestrator's business.
        if !is_root {
            match self.resolver.subentity_access(self.principal, entity) {
                Access::Public => {}
                Access::Filtered(tree) => {
                    let compiled = filter::compile(
                        &tree,
                        entity,
                        self.graph,
                        self.dialect,
                        self.principal,
                        ctx.counter,
                        &node.alias,
                    )?;
                    ctx.counter = compiled.next_param;
                    ctx.params.extend(compiled.params);
                    node.filters.push(compiled.sql);
                }
                Access::Denied => {
                    return Err(ApiError::Internal(
                        "planned into an entity the principal cannot read".into(),
                    ));
                }
            }
        }

        let key = entity.key_property();
        let key_requested = self.wants_column(requested, &node.path, &key.name);
        if key_requested || matches!(node.link, Link::Single { .. }) {
            node.columns.push((
                key.name.clone(),
                format!("{}.{}", node.alias, self.dialect.quote(&key.column)),
                node.path.clone(),
            ));
        }

        for prop in &entity.properties {
            if prop.is_key || prop.is_hidden {
                continue;
            }
            let full = full_path(&node.path, &prop.name);

            if let Some(target_key) = &prop.references_entity {
                let target = self.entity(target_key)?;
                if self.wants_expansion(requested, &full)
                    && !visited.contains(target_key)
                    && self.readable(&target)
                {
                    let child_alias = next_alias(ctx);
                    let predicate = format!(
                        "{child_alias}.{} = {}.{}",
                        self.dialect.quote(&target.key_property().column),
                        node.alias,
                        self.dialect.quote(&prop.column)
                    );
                    let mut child_visited = visited.clone();
                    child_visited.insert(target_key.clone());
                    node.singles.push(self.build_node(
                        ctx,
                        &target,
                        child_alias,
                        Link::Single { predicate },
                        prop.name.clone(),
                        full.clone(),
                        &child_visited,
                        self.child_requested(requested, &full),
                    )?);
                } else if self.wants_column(requested, &node.path, &prop.name) {
                    // Cycle or no read access: fall back to the raw key value.
                    node.columns.push((
                        prop.name.clone(),
                        format!("{}.{}", node.alias, self.dialect.quote(&prop.column)),
                        node.path.clone(),
                    ));
                }
            } else if let (Some(target_key), Some(inverse)) =
                (&prop.related_entity, &prop.related_property)
            {
                let target = self.entity(target_key)?;
                if !self.wants_expansion(requested, &full)
                    || visited.contains(target_key)
                    || !self.readable(&target)
                {
                    continue;
                }
                let fk = target.property(inverse).ok_or_else(|| {
                    ApiError::Internal(format!(
                        "entity {target_key} has no property {inverse} for inverse {}",
                        prop.name
                    ))
                })?;
                let child_alias = next_alias(ctx);
                let predicate = format!(
                    "{child_alias}.{} = {}.{}",
                    self.dialect.quote(&fk.column),
                    node.alias,
                    self.dialect.quote(&entity.key_property().column)
                );
                let link = if prop.is_collection {
                    Link::Array { predicate }
                } else {
                    Link::Single { predicate }
                };
                let mut child_visited = visited.clone();
                child_visited.insert(target_key.clone());
                let child = self.build_node(
                    ctx,
                    &target,
                    child_alias,
                    link,
                    prop.name.clone(),
                    full.clone(),
                    &child_visited,
                    self.child_requested(requested, &full),
                )?;
                if prop.is_collection {
                    node.arrays.push(child);
                } else {
                    node.singles.push(child);
                }
            } else if self.wants_column(requested, &node.path, &prop.name) {
                node.columns.push((
                    prop.name.clone(),
                    format!("{}.{}", node.alias, self.dialect.quote(&prop.column)),
                    node.path.clone(),
                ));
            }
        }

        for (rel, side) in entity.visible_relations() {
            let full = full_path(&node.path, side.property);
            if !self.wants_expansion(requested, &full)
                || visited.contains(side.far_entity)
                || !self.readable(&self.entity(side.far_entity)?)
            {
                continue;
            }
            let far = self.entity(side.far_entity)?;
            let child_alias = next_alias(ctx);
            let mut in_subquery = format!(
                "SELECT {} FROM {} WHERE {} = {}.{}",
                self.dialect.quote(side.far_column),
                self.dialect.quote(&rel.cross_table),
                self.dialect.quote(side.near_column),
                node.alias,
                self.dialect.quote(&entity.key_property().column)
            );
            if let Some(window) = rel.window_predicate(&self.dialect.quote(&rel.cross_table), self.dialect) {
                in_subquery.push_str(&format!(" AND {window}"));
            }
            let predicate = format!(
                "{child_alias}.{} IN ({in_subquery})",
                self.dialect.quote(&far.key_property().column)
            );
            let mut child_visited = visited.clone();
            child_visited.insert(side.far_entity.to_string());
            node.arrays.push(self.build_node(
                ctx,
                &far,
                child_alias,
                Link::Array { predicate },
                side.property.to_string(),
                full.clone(),
                &child_visited,
                self.child_requested(requested, &full),
            )?);
        }

        Ok(node)
    }

    /// Flatten a node into projection entries and LEFT JOIN clauses,
    /// rendering each collection child as a correlated JSON subquery.
    fn collect(
        &self,
        node: &JoinNode,
        entries: &mut Vec<(String, String, String)>,
        joins: &mut String,
    ) -> Result<(), ApiError> {
        entries.extend(node.columns.iter().cloned());

        for child in &node.singles {
            let Link::Single { predicate } = &child.link else {
                return Err(ApiError::Internal("single child without join predicate".into()));
            };
            let mut on_clause = predicate.clone();
            for extra in &child.filters {
                on_clause.push_str(&format!(" AND {extra}"));
            }
            joins.push_str(&format!(
                " LEFT JOIN {} {} ON {on_clause}",
                self.dialect.quote(&child.table),
                child.alias
            ));
            self.collect(child, entries, joins)?;
        }

        for child in &node.arrays {
            let wrapped = self.render_collection(child)?;
            entries.push((
                child.out_name.clone(),
                self.dialect.json_expr(&format!("({wrapped})")),
                node.path.clone(),
            ));
        }
        Ok(())
    }

    /// Render a collection child as a self-contained, correlated select
    /// aggregated into a JSON array.
    fn render_collection(&self, node: &JoinNode) -> Result<String, ApiError> {
        let Link::Array { predicate } = &node.link else {
            return Err(ApiError::Internal("collection child without predicate".into()));
        };

        let mut entries = Vec::new();
        let mut joins = String::new();

        // Columns inside the subquery nest relative to the collection, so
        // strip the node's own path prefix from a cloned subtree.
        let mut scoped = reroot(node, &node.path);
        scoped.link = Link::Root;
        self.collect(&scoped, &mut entries, &mut joins)?;
        if entries.is_empty() {
            return Err(ApiError::BadRequest(
                "projection resolved to no columns".into(),
            ));
        }

        let (names, exprs, paths) = split_entries(&entries);
        let select = self.dialect.basic_select(&names, &exprs, &paths, &[], true)?;

        let mut where_parts = vec![predicate.clone()];
        where_parts.extend(node.filters.iter().cloned());
        let inner = format!(
            "{select} FROM {} {}{joins} WHERE {}",
            self.dialect.quote(&node.table),
            node.alias,
            where_parts.join(" AND ")
        );
        Ok(self.dialect.wrap_into_json(&inner, false, true, false))
    }

    fn entity(&self, key: &str) -> Result<Arc<Entity>, ApiError> {
        self.graph
            .entity(key)
            .cloned()
            .ok_or_else(|| ApiError::Internal(format!("unknown entity in graph: {key}")))
    }

    fn readable(&self, entity: &Arc<Entity>) -> bool {
        !matches!(
            self.resolver.subentity_access(self.principal, entity),
            Access::Denied
        )
    }

    fn wants_column(&self, requested: Option<&HashSet<String>>, path: &str, name: &str) -> bool {
        match requested {
            None => true,
            Some(set) => set.contains(&full_path(path, name).to_ascii_lowercase()),
        }
    }

    /// A navigation expands when it is requested directly or as a prefix of
    /// a deeper requested path.
    fn wants_expansion(&self, requested: Option<&HashSet<String>>, full: &str) -> bool {
        match requested {
            None => true,
            Some(set) => {
                let full = full.to_ascii_lowercase();
                let prefix = format!("{full}.");
                set.iter().any(|p| *p == full || p.starts_with(&prefix))
            }
        }
    }

    /// Requested set for a child node: unchanged while deeper paths exist;
    /// a bare navigation name means "the whole nested object".
    fn child_requested<'r>(
        &self,
        requested: Option<&'r HashSet<String>>,
        full: &str,
    ) -> Option<&'r HashSet<String>> {
        let set = requested?;
        let prefix = format!("{}.", full.to_ascii_lowercase());
        set.iter().any(|p| p.starts_with(&prefix)).then_some(set)
    }
}

fn full_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn strip_path(path: &str, base: &str) -> String {
    if path == base {
        String::new()
    } else {
        path.strip_prefix(&format!("{base}."))
            .unwrap_or(path)
            .to_string()
    }
}

/// Clone a subtree with output paths re-rooted at `base`.
fn reroot(node: &JoinNode, base: &str) -> JoinNode {
    JoinNode {
        alias: node.alias.clone(),
        table: node.table.clone(),
        link: node.link.clone(),
        out_name: node.out_name.clone(),
        path: strip_path(&node.path, base),
        columns: node
            .columns
            .iter()
            .map(|(n, e, p)| (n.clone(), e.clone(), strip_path(p, base)))
            .collect(),
        singles: node.singles.iter().map(|c| reroot(c, base)).collect(),
        arrays: node.arrays.iter().map(|c| reroot(c, base)).collect(),
        filters: node.filters.clone(),
    }
}

fn next_alias(ctx: &mut PlanCtx) -> String {
    ctx.alias_seq += 1;
    format!("j{}", ctx.alias_seq)
}

fn split_entries(entries: &[(String, String, String)]) -> (Vec<String>, Vec<String>, Vec<String>) {
    let names = entries.iter().map(|(n, _, _)| n.clone()).collect();
    let exprs = entries.iter().map(|(_, e, _)| e.clone()).collect();
    let paths = entries.iter().map(|(_, _, p)| p.clone()).collect();
    (names, exprs, paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::sample_graph;
    use crate::sql::SqliteDialect;

    fn plan_for(
        entity_key: &str,
        requested: Option<&HashSet<String>>,
        principal: &Principal,
    ) -> PlannedQuery {
        let graph = sample_graph();
        let resolver = PermissionResolver;
        let planner = SelectPlanner {
            graph: &graph,
            dialect: &SqliteDialect,
            resolver: &resolver,
            principal,
        };
        let entity = graph.entity(entity_key).unwrap().clone();
        planner.plan(&entity, requested, 0, true).unwrap()
    }

    fn paths(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    // =========================================================================
    // Default projection
    // =========================================================================

    #[test]
    fn test_default_projection_expands_single_join() {
        let planned = plan_for("Order", None, &Principal::anonymous());
        assert!(planned.from.contains("FROM \"Orders\" t"));
        assert!(planned
            .from
            .contains("LEFT JOIN \"Customers\" j1 ON j1.\"Id\" = t.\"CustomerId\""));
        // The customer join carries its soft-delete predicate.
        assert!(planned.from.contains("j1.\"DeletedAt\" IS NULL"));
    }

    #[test]
    fn test_default_projection_embeds_collection_subquery() {
        let planned = plan_for("Order", None, &Principal::anonymous());
        assert!(planned.select.contains("'products'"));
        assert!(planned.select.contains("json_group_array"));
        assert!(planned
            .select
            .contains("IN (SELECT \"ProductId\" FROM \"OrderProducts\" WHERE \"OrderId\" = t.\"Id\""));
        assert!(planned.select.contains("\"Active\" = 1"));
    }

    #[test]
    fn test_hidden_properties_are_not_projected() {
        let planned = plan_for("Order", None, &Principal::anonymous());
        assert!(!planned.select.contains("SecretNote"));
        assert!(!planned.select.contains("secretNote"));
    }

    // =========================================================================
    // Cycle safety
    // =========================================================================

    #[test]
    fn test_cycle_is_not_expanded_twice() {
        // Customer -> orders -> customer would recurse forever without the
        // visited guard; the second visit projects the raw key instead.
        let planned = plan_for("Customer", None, &Principal::anonymous());
        assert!(planned.select.contains("'orders'"));
        // Inside the orders subquery the customer foreign key stays scalar.
        assert!(planned.select.contains("'customer', j1.\"CustomerId\""));
        assert_eq!(planned.from.matches("LEFT JOIN \"Customers\"").count(), 0);
    }

    #[test]
    fn test_self_referencing_plan_terminates() {
        let planned = plan_for("Order", None, &Principal::anonymous());
        // Order joins Customer; Customer's inverse "orders" is suppressed.
        assert_eq!(planned.from.matches("LEFT JOIN \"Customers\"").count(), 1);
        assert_eq!(planned.from.matches("\"Orders\"").count(), 1);
    }

    // =========================================================================
    // Projection pruning
    // =========================================================================

    #[test]
    fn test_pruned_projection_drops_joins() {
        let requested = paths(&["id", "total"]);
        let planned = plan_for("Order", Some(&requested), &Principal::anonymous());
        assert!(!planned.from.contains("LEFT JOIN"));
        assert!(!planned.select.contains("products"));
        assert!(planned.select.contains("'id', t.\"Id\""));
        assert!(planned.select.contains("'total', t.\"Total\""));
    }

    #[test]
    fn test_nested_request_keeps_join_structure() {
        let requested = paths(&["id", "customer.name"]);
        let planned = plan_for("Order", Some(&requested), &Principal::anonymous());
        assert!(planned
            .from
            .contains("LEFT JOIN \"Customers\" j1 ON j1.\"Id\" = t.\"CustomerId\""));
        assert!(planned.select.contains("'name', j1.\"Name\""));
        // The joined entity's key column stays as the NULL guard.
        assert!(planned.select.contains("CASE WHEN j1.\"Id\" IS NULL"));
    }

    #[test]
    fn test_bare_navigation_name_projects_whole_object() {
        let requested = paths(&["id", "customer"]);
        let planned = plan_for("Order", Some(&requested), &Principal::anonymous());
        assert!(planned.select.contains("'country', j1.\"Country\""));
    }

    // =========================================================================
    // Nested permissions
    // =========================================================================

    #[test]
    fn test_restricted_nested_entity_stays_scalar_for_anonymous() {
        let planned = plan_for("Order", None, &Principal::anonymous());
        // Documents require a role; anonymous sees only the raw key value.
        assert!(!planned.from.contains("\"Documents\""));
        assert!(planned.select.contains("'document', t.\"DocumentId\""));
    }

    #[test]
    fn test_restricted_nested_entity_joins_with_view_filter() {
        let principal = Principal::authenticated("u7", "user");
        let planned = plan_for("Order", None, &principal);
        assert!(planned.from.contains("LEFT JOIN \"Documents\""));
        assert!(planned.from.contains("\"OwnerId\" = @Filter_Int0"));
        assert_eq!(planned.params, vec![SqlValue::String("u7".into())]);
        assert_eq!(planned.next_param, 1);
    }

    // =========================================================================
    // Statement assembly
    // =========================================================================

    #[test]
    fn test_to_sql_appends_filters_after_base() {
        let graph = sample_graph();
        let resolver = PermissionResolver;
        let principal = Principal::anonymous();
        let planner = SelectPlanner {
            graph: &graph,
            dialect: &SqliteDialect,
            resolver: &resolver,
            principal: &principal,
        };
        let entity = graph.entity("Customer").unwrap().clone();
        let requested = paths(&["id", "name"]);
        let planned = planner.plan(&entity, Some(&requested), 0, true).unwrap();

        let sql = planned.to_sql(&["t.\"Name\" = @Filter_Int0".to_string()]);
        assert!(sql.contains("WHERE t.\"DeletedAt\" IS NULL AND t.\"Name\" = @Filter_Int0"));
    }

    #[test]
    fn test_param_counter_starts_where_told() {
        let graph = sample_graph();
        let resolver = PermissionResolver;
        let principal = Principal::authenticated("u7", "user");
        let planner = SelectPlanner {
            graph: &graph,
            dialect: &SqliteDialect,
            resolver: &resolver,
            principal: &principal,
        };
        let entity = graph.entity("Order").unwrap().clone();
        let planned = planner.plan(&entity, None, 5, true).unwrap();
        assert!(planned.from.contains("@Filter_Int5"));
        assert_eq!(planned.next_param, 6);
    }
}
