//! Query orchestration
//!
//! The thin coordinator over the compiler components: resolves the
//! entity and permission filter, merges it with the caller filter, plans
//! and executes the statement, and produces pagination metadata. Writes
//! (insert / update / delete, including junction-row synchronization) run
//! inside one transaction: either every statement lands or none does.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::auth::Principal;
use crate::db::{self, Database};
use crate::error::ApiError;
use crate::filter::{self, Comparer};
use crate::graph::model::{DefaultValue, Entity};
use crate::graph::registry::EntityGraph;
use crate::permission::{Capability, PermissionResolver};
use crate::plan::SelectPlanner;
use crate::plan::select::ROOT_ALIAS;
use crate::sql::{SqlDialect, SqlValue, param_name};

/// Upper bound on the page size a caller may request.
pub const MAX_PAGE_SIZE: i64 = 100;
pub const DEFAULT_PAGE_SIZE: i64 = 25;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn to_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// One read request, as produced by the REST surface or the GraphQL
/// adapter.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub resource: String,
    /// Zero-based page index.
    pub page: i64,
    pub page_size: i64,
    pub sort_property: Option<String>,
    pub sort_order: SortOrder,
    pub filter: Option<Comparer>,
    /// Lowercased dotted output paths; None = full default projection.
    pub projection: Option<HashSet<String>>,
}

impl QueryRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
            sort_property: None,
            sort_order: SortOrder::Asc,
            filter: None,
            projection: None,
        }
    }
}

/// A page of rows plus pagination metadata.
///
/// `total` counts rows visible under the permission filter alone;
/// `filtered` additionally applies the caller filter.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    pub items: Vec<Json>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
    pub filtered: i64,
}

pub struct QueryOrchestrator<'a> {
    pub db: &'a Database,
    pub dialect: &'a dyn SqlDialect,
    pub graph: &'a EntityGraph,
    pub resolver: PermissionResolver,
}

impl<'a> QueryOrchestrator<'a> {
    pub fn new(db: &'a Database, dialect: &'a dyn SqlDialect, graph: &'a EntityGraph) -> Self {
        Self {
            db,
            dialect,
            graph,
            resolver: PermissionResolver,
        }
    }

    fn planner<'p>(&'p self, principal: &'p Principal) -> SelectPlanner<'p> {
        SelectPlanner {
            graph: self.graph,
            dialect: self.dialect,
            resolver: &self.resolver,
            principal,
        }
    }

    fn authorize(
        &self,
        resource: &str,
        principal: &Principal,
        capability: Capability,
    ) -> Result<(Arc<Entity>, Option<Comparer>), ApiError> {
        let candidates = self.graph.resource_candidates(resource);
        self.resolver.authorize(principal, &candidates, capability)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn fetch_page(
        &self,
        request: &QueryRequest,
        principal: &Principal,
    ) -> Result<QueryPage, ApiError> {
        let (entity, permission) =
            self.authorize(&request.resource, principal, Capability::ReadAll)?;
        let page = request.page.max(0);
        let page_size = request.page_size.clamp(1, MAX_PAGE_SIZE);

        let planned =
            self.planner(principal)
                .plan(&entity, request.projection.as_ref(), 0, true)?;

        let merged = Comparer::merge_and(permission.clone(), request.filter.clone());

        let mut filters = Vec::new();
        let mut params = planned.params.clone();
        if let Some(tree) = &merged {
            let compiled = filter::compile(
                tree,
                entity.as_ref(),
                self.graph,
                self.dialect,
                principal,
                planned.next_param,
                ROOT_ALIAS,
            )?;
            filters.push(compiled.sql);
            params.extend(compiled.params);
        }

        let mut sql = planned.to_sql(&filters);
        sql = self.apply_sort(
            sql,
            &entity,
            request.sort_property.as_deref(),
            request.sort_order,
        )?;
        let sql = self.dialect.add_paging(&sql, page, page_size);

        let items = db::fetch_json_rows(self.db, self.dialect, &sql, &params).await?;

        let total = self.count_rows(&entity, permission.as_ref(), principal).await?;
        let filtered = if request.filter.is_some() {
            self.count_rows(&entity, merged.as_ref(), principal).await?
        } else {
            total
        };

        Ok(QueryPage {
            items,
            page,
            page_size,
            total,
            filtered,
        })
    }

    pub async fn fetch_one(
        &self,
        resource: &str,
        id: &str,
        principal: &Principal,
    ) -> Result<Json, ApiError> {
        let (entity, permission) = self.authorize(resource, principal, Capability::ReadOne)?;

        let planned = self.planner(principal).plan(&entity, None, 0, true)?;
        let key_leaf = Comparer::leaf(entity.key_property().name.clone(), "eq", id_literal(id));
        let merged = Comparer::merge_and(permission, Some(key_leaf))
            .expect("key filter is always present");

        let compiled = filter::compile(
            &merged,
            entity.as_ref(),
            self.graph,
            self.dialect,
            principal,
            planned.next_param,
            ROOT_ALIAS,
        )?;
        let mut params = planned.params.clone();
        params.extend(compiled.params);

        let sql = self
            .dialect
            .add_paging(&planned.to_sql(&[compiled.sql]), 0, 1);
        let items = db::fetch_json_rows(self.db, self.dialect, &sql, &params).await?;
        items
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::NotFound(format!("no {resource} row with key {id}")))
    }

    fn apply_sort(
        &self,
        sql: String,
        entity: &Entity,
        sort_property: Option<&str>,
        order: SortOrder,
    ) -> Result<String, ApiError> {
        match sort_property {
            // Deterministic paging needs a stable default order.
            None => Ok(format!(
                "{sql} ORDER BY {ROOT_ALIAS}.{} {}",
                self.dialect.quote(&entity.key_property().column),
                order.to_sql()
            )),
            Some(p) if !p.contains('.') => {
                let prop = entity
                    .property(p)
                    .filter(|prop| !prop.is_inverse())
                    .ok_or_else(|| ApiError::BadRequest(format!("invalid sort property: {p}")))?;
                Ok(format!(
                    "{sql} ORDER BY {ROOT_ALIAS}.{} {}",
                    self.dialect.quote(&prop.column),
                    order.to_sql()
                ))
            }
            // Nested sort keys navigate into the wrapped JSON.
            Some(p) => {
                let segments: Vec<&str> = p.split('.').collect();
                let nav = self.dialect.json_property_navigation(&segments);
                Ok(format!(
                    "SELECT * FROM ({sql}) AS sub ORDER BY {nav} {}",
                    order.to_sql()
                ))
            }
        }
    }

    async fn count_rows(
        &self,
        entity: &Arc<Entity>,
        tree: Option<&Comparer>,
        principal: &Principal,
    ) -> Result<i64, ApiError> {
        let mut filters = Vec::new();
        if let Some(soft) = &entity.soft_delete_column {
            filters.push(format!("{ROOT_ALIAS}.{} IS NULL", self.dialect.quote(soft)));
        }
        let mut params = Vec::new();
        if let Some(tree) = tree {
            let compiled = filter::compile(
                tree,
                entity.as_ref(),
                self.graph,
                self.dialect,
                principal,
                0,
                ROOT_ALIAS,
            )?;
            filters.push(compiled.sql);
            params = compiled.params;
        }
        let mut sql = format!(
            "SELECT COUNT(*) FROM {} {ROOT_ALIAS}",
            self.dialect.quote(&entity.table)
        );
        if !filters.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&filters.join(" AND "));
        }
        db::fetch_count(self.db, self.dialect, &sql, &params).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn insert(
        &self,
        resource: &str,
        payload: &Map<String, Json>,
        principal: &Principal,
    ) -> Result<Json, ApiError> {
        let (entity, _) = self.authorize(resource, principal, Capability::Create)?;

        let mut columns = Vec::new();
        let mut placeholders = Vec::new();
        let mut params = Vec::new();
        for prop in &entity.properties {
            if prop.is_inverse() || prop.is_read_only {
                continue;
            }
            let value = match payload_get(payload, &prop.name) {
                Some(v) => Some(SqlValue::from_json(v)?),
                None => match prop.default_value {
                    Some(DefaultValue::CurrentUserId) => {
                        principal.user_id.clone().map(SqlValue::String)
                    }
                    None => None,
                },
            };
            // An omitted key is generated by the database.
            let Some(value) = value else { continue };
            columns.push(prop.column.clone());
            placeholders.push(param_name(params.len()));
            params.push(value);
        }

        let sql = self.dialect.insert_returning_id(
            &entity.table,
            None,
            &entity.key_property().column,
            &columns,
            &placeholders,
        )?;

        let mut tx = self.db.begin().await?;
        let id = db::fetch_scalar(&mut *tx, self.dialect, &sql, &params)
            .await?
            .ok_or_else(|| ApiError::Internal("insert returned no key".into()))?;
        self.sync_relations(&mut tx, &entity, &id, payload).await?;
        tx.commit().await?;
        tracing::info!(entity = %entity.key, "row created");

        self.echo_row(resource, &entity, &id, principal).await
    }

    pub async fn update(
        &self,
        resource: &str,
        id: &str,
        payload: &Map<String, Json>,
        principal: &Principal,
    ) -> Result<Json, ApiError> {
        let (entity, permission) = self.authorize(resource, principal, Capability::Update)?;

        // The row must exist and pass the edit filter before anything runs.
        let key_leaf = Comparer::leaf(entity.key_property().name.clone(), "eq", id_literal(id));
        let merged = Comparer::merge_and(permission, Some(key_leaf))
            .expect("key filter is always present");
        if self.count_rows(&entity, Some(&merged), principal).await? == 0 {
            return Err(ApiError::NotFound(format!("no {resource} row with key {id}")));
        }

        let mut sets = Vec::new();
        let mut params = Vec::new();
        for prop in &entity.properties {
            if prop.is_key || prop.is_inverse() || prop.is_read_only {
                continue;
            }
            if let Some(value) = payload_get(payload, &prop.name) {
                sets.push(format!(
                    "{} = {}",
                    self.dialect.quote(&prop.column),
                    param_name(params.len())
                ));
                params.push(SqlValue::from_json(value)?);
            }
        }

        let id_value = SqlValue::from_json(&id_literal(id))?;
        let mut tx = self.db.begin().await?;
        if !sets.is_empty() {
            let mut sql = format!(
                "UPDATE {} SET {} WHERE {} = {}",
                self.dialect.quote(&entity.table),
                sets.join(", "),
                self.dialect.quote(&entity.key_property().column),
                param_name(params.len())
            );
            params.push(id_value.clone());
            if let Some(soft) = &entity.soft_delete_column {
                sql.push_str(&format!(" AND {} IS NULL", self.dialect.quote(soft)));
            }
            db::execute(&mut *tx, self.dialect, &sql, &params).await?;
        }
        self.sync_relations(&mut tx, &entity, &id_literal(id), payload)
            .await?;
        tx.commit().await?;
        tracing::info!(entity = %entity.key, "row updated");

        self.echo_row(resource, &entity, &id_literal(id), principal).await
    }

    pub async fn delete(
        &self,
        resource: &str,
        id: &str,
        principal: &Principal,
    ) -> Result<(), ApiError> {
        let (entity, permission) = self.authorize(resource, principal, Capability::Delete)?;

        let key_leaf = Comparer::leaf(entity.key_property().name.clone(), "eq", id_literal(id));
        let merged = Comparer::merge_and(permission, Some(key_leaf))
            .expect("key filter is always present");
        if self.count_rows(&entity, Some(&merged), principal).await? == 0 {
            return Err(ApiError::NotFound(format!("no {resource} row with key {id}")));
        }

        let id_param = SqlValue::from_json(&id_literal(id))?;
        let key_column = self.dialect.quote(&entity.key_property().column);
        let mut tx = self.db.begin().await?;

        if let Some(soft) = &entity.soft_delete_column {
            let sql = format!(
                "UPDATE {} SET {} = {} WHERE {key_column} = {} AND {} IS NULL",
                self.dialect.quote(&entity.table),
                self.dialect.quote(soft),
                self.dialect.current_timestamp(),
                param_name(0),
                self.dialect.quote(soft),
            );
            db::execute(&mut *tx, self.dialect, &sql, &[id_param.clone()]).await?;
        } else {
            // A hard delete is refused while foreign keys still point here.
            for referencing in &entity.referencing {
                let other = self.entity(&referencing.entity)?;
                let mut sql = format!(
                    "SELECT COUNT(*) FROM {} WHERE {} = {}",
                    self.dialect.quote(&other.table),
                    self.dialect.quote(&referencing.column),
                    param_name(0)
                );
                if let Some(soft) = &other.soft_delete_column {
                    sql.push_str(&format!(" AND {} IS NULL", self.dialect.quote(soft)));
                }
                let still_referenced =
                    db::fetch_count(&mut *tx, self.dialect, &sql, &[id_param.clone()]).await?;
                if still_referenced > 0 {
                    return Err(ApiError::Conflict(format!(
                        "{resource} row {id} is still referenced by {}",
                        other.object_name
                    )));
                }
            }
            for rel in &entity.relations {
                if let Some(side) = rel.side_for(&entity.key) {
                    let sql = format!(
                        "DELETE FROM {} WHERE {} = {}",
                        self.dialect.quote(&rel.cross_table),
                        self.dialect.quote(side.near_column),
                        param_name(0)
                    );
                    db::execute(&mut *tx, self.dialect, &sql, &[id_param.clone()]).await?;
                }
            }
            let sql = format!(
                "DELETE FROM {} WHERE {key_column} = {}",
                self.dialect.quote(&entity.table),
                param_name(0)
            );
            db::execute(&mut *tx, self.dialect, &sql, &[id_param]).await?;
        }

        tx.commit().await?;
        tracing::info!(entity = %entity.key, "row deleted");
        Ok(())
    }

    /// Bring junction rows in line with the collection values present in
    /// the payload: missing links are inserted (or re-activated), links no
    /// longer listed are soft-unlinked or removed.
    async fn sync_relations(
        &self,
        tx: &mut sqlx::Transaction<'_, crate::db::DatabaseKind>,
        entity: &Arc<Entity>,
        id: &Json,
        payload: &Map<String, Json>,
    ) -> Result<(), ApiError> {
        let id_param = SqlValue::from_json(id)?;
        for (rel, side) in entity.visible_relations() {
            let Some(value) = payload_get(payload, side.property) else {
                continue;
            };
            let Json::Array(desired) = value else {
                return Err(ApiError::BadRequest(format!(
                    "{} expects an array of keys",
                    side.property
                )));
            };

            let cross = self.dialect.quote(&rel.cross_table);
            let near = self.dialect.quote(side.near_column);
            let far = self.dialect.quote(side.far_column);

            let mut current_sql =
                format!("SELECT {far} FROM {cross} WHERE {near} = {}", param_name(0));
            if let Some(window) = rel.window_predicate(&cross, self.dialect) {
                current_sql.push_str(&format!(" AND {window}"));
            }
            let current =
                db::fetch_scalar_rows(&mut **tx, self.dialect, &current_sql, &[id_param.clone()])
                    .await?;
            let current_keys: HashSet<String> = current.iter().map(key_repr).collect();
            let desired_keys: HashSet<String> = desired.iter().map(key_repr).collect();

            for far_id in desired {
                if current_keys.contains(&key_repr(far_id)) {
                    continue;
                }
                let far_param = SqlValue::from_json(far_id)?;
                // A soft-unlinked row may already exist; reopen it first so
                // the conditional insert can skip it.
                if rel.active_column.is_some() || rel.valid_to_column.is_some() {
                    let mut reopen = Vec::new();
                    if let Some(ac) = &rel.active_column {
                        reopen.push(format!(
                            "{} = {}",
                            self.dialect.quote(ac),
                            self.dialect.bool_literal(true)
                        ));
                    }
                    if let Some(vt) = &rel.valid_to_column {
                        reopen.push(format!("{} = NULL", self.dialect.quote(vt)));
                    }
                    let sql = format!(
                        "UPDATE {cross} SET {} WHERE {near} = {} AND {far} = {}",
                        reopen.join(", "),
                        param_name(0),
                        param_name(1)
                    );
                    db::execute(
                        &mut **tx,
                        self.dialect,
                        &sql,
                        &[id_param.clone(), far_param.clone()],
                    )
                    .await?;
                }
                let sql = self.dialect.insert_if_not_exists(
                    &rel.cross_table,
                    side.near_column,
                    &param_name(0),
                    side.far_column,
                    &param_name(1),
                    rel.valid_from_column.as_deref(),
                );
                db::execute(
                    &mut **tx,
                    self.dialect,
                    &sql,
                    &[id_param.clone(), far_param],
                )
                .await?;
            }

            for far_id in &current {
                if desired_keys.contains(&key_repr(far_id)) {
                    continue;
                }
                let far_param = SqlValue::from_json(far_id)?;
                let sql = if rel.has_window() {
                    let mut close = Vec::new();
                    if let Some(ac) = &rel.active_column {
                        close.push(format!(
                            "{} = {}",
                            self.dialect.quote(ac),
                            self.dialect.bool_literal(false)
                        ));
                    }
                    if let Some(vt) = &rel.valid_to_column {
                        close.push(format!(
                            "{} = {}",
                            self.dialect.quote(vt),
                            self.dialect.current_timestamp()
                        ));
                    }
                    format!(
                        "UPDATE {cross} SET {} WHERE {near} = {} AND {far} = {}",
                        close.join(", "),
                        param_name(0),
                        param_name(1)
                    )
                } else {
                    format!(
                        "DELETE FROM {cross} WHERE {near} = {} AND {far} = {}",
                        param_name(0),
                        param_name(1)
                    )
                };
                db::execute(
                    &mut **tx,
                    self.dialect,
                    &sql,
                    &[id_param.clone(), far_param],
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Read the written row back; principals whose view filter hides their
    /// own write still get the key back.
    async fn echo_row(
        &self,
        resource: &str,
        entity: &Arc<Entity>,
        id: &Json,
        principal: &Principal,
    ) -> Result<Json, ApiError> {
        match self
            .fetch_one(resource, &key_repr(id), principal)
            .await
        {
            Ok(item) => Ok(item),
            Err(ApiError::NotFound(_) | ApiError::Forbidden(_)) => {
                let mut key_only = Map::new();
                key_only.insert(entity.key_property().name.clone(), id.clone());
                Ok(Json::Object(key_only))
            }
            Err(e) => Err(e),
        }
    }

    fn entity(&self, key: &str) -> Result<Arc<Entity>, ApiError> {
        self.graph
            .entity(key)
            .cloned()
            .ok_or_else(|| ApiError::Internal(format!("unknown entity in graph: {key}")))
    }
}

/// Case-insensitive payload lookup by external property name.
fn payload_get<'p>(payload: &'p Map<String, Json>, name: &str) -> Option<&'p Json> {
    payload
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

/// Key values arrive as path strings; integers compare as integers.
fn id_literal(id: &str) -> Json {
    id.parse::<i64>().map(Json::from).unwrap_or_else(|_| Json::from(id))
}

/// Canonical text form of a key value, for set comparisons.
fn key_repr(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::sample_graph;
    use crate::sql::SqliteDialect;
    use assert_matches::assert_matches;
    use serde_json::json;

    const DDL: &[&str] = &[
        "CREATE TABLE Customers (Id INTEGER PRIMARY KEY AUTOINCREMENT, \
         Name TEXT NOT NULL, Country TEXT, DeletedAt TEXT)",
        "CREATE TABLE Orders (Id INTEGER PRIMARY KEY AUTOINCREMENT, Status TEXT, \
         Total REAL, CustomerId INTEGER, OwnerId TEXT, DocumentId INTEGER, SecretNote TEXT)",
        "CREATE TABLE Products (Id INTEGER PRIMARY KEY AUTOINCREMENT, Title TEXT, Body TEXT)",
        "CREATE TABLE OrderProducts (OrderId INTEGER NOT NULL, ProductId INTEGER NOT NULL, \
         Active INTEGER NOT NULL DEFAULT 1)",
        "CREATE TABLE Documents (Id INTEGER PRIMARY KEY AUTOINCREMENT, Title TEXT, OwnerId TEXT)",
    ];

    const SEED: &[&str] = &[
        "INSERT INTO Customers (Name, Country) VALUES ('Acme', 'US'), ('Globex', 'DE')",
        "INSERT INTO Orders (Status, Total, CustomerId, OwnerId) VALUES \
         ('open', 10.0, 1, 'u1'), ('done', 99.5, 2, 'u2')",
        "INSERT INTO Products (Title, Body) VALUES \
         ('Red Chair', 'a red chair'), ('Blue Table', 'a blue table')",
        "INSERT INTO OrderProducts (OrderId, ProductId) VALUES (1, 1), (1, 2), (2, 2)",
        "INSERT INTO Documents (Title, OwnerId) VALUES ('Spec', 'u1'), ('Notes', 'u2')",
    ];

    async fn setup() -> Database {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        for sql in DDL.iter().chain(SEED) {
            sqlx::query(sql).execute(&pool).await.expect(sql);
        }
        pool
    }

    fn anon() -> Principal {
        Principal::anonymous()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    #[tokio::test]
    async fn test_fetch_page_returns_nested_json() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        let page = orchestrator
            .fetch_page(&QueryRequest::new("orders"), &anon())
            .await
            .unwrap();

        assert_eq!(page.total, 2);
        assert_eq!(page.filtered, 2);
        assert_eq!(page.items.len(), 2);

        let first = &page.items[0];
        assert_eq!(first["id"], 1);
        assert_eq!(first["status"], "open");
        assert_eq!(first["customer"]["name"], "Acme");
        assert_eq!(first["products"].as_array().unwrap().len(), 2);
        // Hidden column never reaches the projection.
        assert!(first.get("secretNote").is_none());
    }

    #[tokio::test]
    async fn test_fetch_page_applies_caller_filter() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        let mut request = QueryRequest::new("orders");
        request.filter = Some(Comparer::leaf("status", "eq", json!("open")));
        let page = orchestrator.fetch_page(&request, &anon()).await.unwrap();

        assert_eq!(page.total, 2);
        assert_eq!(page.filtered, 1);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["status"], "open");
    }

    #[tokio::test]
    async fn test_fetch_page_pages_and_sorts() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        let mut request = QueryRequest::new("orders");
        request.page = 1;
        request.page_size = 1;
        let page = orchestrator.fetch_page(&request, &anon()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["id"], 2);

        let mut request = QueryRequest::new("orders");
        request.sort_property = Some("total".into());
        request.sort_order = SortOrder::Desc;
        let page = orchestrator.fetch_page(&request, &anon()).await.unwrap();
        assert_eq!(page.items[0]["id"], 2);

        // Nested sort key navigates the wrapped JSON.
        let mut request = QueryRequest::new("orders");
        request.sort_property = Some("customer.name".into());
        let page = orchestrator.fetch_page(&request, &anon()).await.unwrap();
        assert_eq!(page.items[0]["customer"]["name"], "Acme");
    }

    #[tokio::test]
    async fn test_fetch_one_and_not_found() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        let item = orchestrator.fetch_one("orders", "2", &anon()).await.unwrap();
        assert_eq!(item["status"], "done");

        assert_matches!(
            orchestrator.fetch_one("orders", "99", &anon()).await,
            Err(ApiError::NotFound(_))
        );
        assert_matches!(
            orchestrator.fetch_one("nothing", "1", &anon()).await,
            Err(ApiError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_permission_filter_restricts_reads() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        let user = Principal::authenticated("u1", "user");
        let page = orchestrator
            .fetch_page(&QueryRequest::new("documents"), &user)
            .await
            .unwrap();
        // The view filter limits both the rows and the total count.
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0]["title"], "Spec");

        assert_matches!(
            orchestrator.fetch_one("documents", "2", &user).await,
            Err(ApiError::NotFound(_))
        );
        assert_matches!(
            orchestrator
                .fetch_page(&QueryRequest::new("documents"), &anon())
                .await,
            Err(ApiError::Unauthorized(_))
        );
    }

    // =========================================================================
    // Writes
    // =========================================================================

    #[tokio::test]
    async fn test_insert_applies_defaults_and_links_relations() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        let payload: Map<String, Json> = serde_json::from_value(json!({
            "status": "new",
            "total": 5.5,
            "customer": 1,
            "products": [1]
        }))
        .unwrap();
        let created = orchestrator
            .insert("orders", &payload, &Principal::authenticated("u5", "user"))
            .await
            .unwrap();

        assert_eq!(created["status"], "new");
        assert_eq!(created["ownerId"], "u5");
        assert_eq!(created["customer"]["id"], 1);
        let products = created["products"].as_array().unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_update_syncs_junction_rows() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        // Order 1 starts linked to products 1 and 2; keep only product 2.
        let payload: Map<String, Json> =
            serde_json::from_value(json!({ "status": "packed", "products": [2] })).unwrap();
        let updated = orchestrator
            .update("orders", "1", &payload, &anon())
            .await
            .unwrap();
        assert_eq!(updated["status"], "packed");
        let products = updated["products"].as_array().unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0]["id"], 2);

        // The unlinked row is closed, not deleted.
        let (active,): (i64,) = sqlx::query_as(
            "SELECT Active FROM OrderProducts WHERE OrderId = 1 AND ProductId = 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(active, 0);

        // Relinking reopens the same row.
        let payload: Map<String, Json> =
            serde_json::from_value(json!({ "products": [1, 2] })).unwrap();
        let updated = orchestrator
            .update("orders", "1", &payload, &anon())
            .await
            .unwrap();
        assert_eq!(updated["products"].as_array().unwrap().len(), 2);
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM OrderProducts WHERE OrderId = 1 AND ProductId = 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_update_honors_the_edit_filter() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        let payload: Map<String, Json> =
            serde_json::from_value(json!({ "title": "Stolen" })).unwrap();
        // Document 2 belongs to u2; u1 must not see or touch it.
        assert_matches!(
            orchestrator
                .update(
                    "documents",
                    "2",
                    &payload,
                    &Principal::authenticated("u1", "user")
                )
                .await,
            Err(ApiError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_soft_delete_hides_rows_from_reads() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        orchestrator.delete("customers", "2", &anon()).await.unwrap();

        let page = orchestrator
            .fetch_page(&QueryRequest::new("customers"), &anon())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_matches!(
            orchestrator.fetch_one("customers", "2", &anon()).await,
            Err(ApiError::NotFound(_))
        );

        // The soft-deleted customer disappears from nested joins too.
        let order = orchestrator.fetch_one("orders", "2", &anon()).await.unwrap();
        assert!(order["customer"].is_null());
    }

    #[tokio::test]
    async fn test_hard_delete_requires_capability_and_no_references() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        let user = Principal::authenticated("u2", "user");
        let admin = Principal::authenticated("a1", "admin");

        assert_matches!(
            orchestrator.delete("documents", "2", &user).await,
            Err(ApiError::Forbidden(_))
        );

        // Reference the document from an order, then try to delete it.
        sqlx::query("UPDATE Orders SET DocumentId = 1 WHERE Id = 1")
            .execute(&pool)
            .await
            .unwrap();
        assert_matches!(
            orchestrator.delete("documents", "1", &admin).await,
            Err(ApiError::Conflict(_))
        );

        orchestrator.delete("documents", "2", &admin).await.unwrap();
        assert_matches!(
            orchestrator.fetch_one("documents", "2", &admin).await,
            Err(ApiError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_hard_delete_cleans_junction_rows() {
        let pool = setup().await;
        let graph = sample_graph();
        let orchestrator = QueryOrchestrator::new(&pool, &SqliteDialect, &graph);

        orchestrator.delete("products", "1", &anon()).await.unwrap();

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM OrderProducts WHERE ProductId = 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 0);
    }
}
