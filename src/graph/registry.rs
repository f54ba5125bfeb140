//! Entity graph construction and caching
//!
//! A [MetadataProvider] supplies raw definitions; [EntityGraph::build]
//! validates cross-references and computes the reverse links; [GraphCache]
//! holds the built graph as a shared immutable snapshot with a TTL and a
//! single-writer lazy rebuild. In-flight requests keep the `Arc` they
//! resolved, so a rebuild never invalidates a running query.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::RwLock;

use super::model::{Entity, EntityRelation, GraphDefinition, ReferencingProperty};
use crate::error::ApiError;

/// Source of the raw entity definitions (database, file, remote service).
///
/// Implementations deliver an already-validated object graph; the core
/// never parses metadata storage formats itself.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn load(&self) -> Result<GraphDefinition>;
}

/// Metadata provider backed by a JSON definition file.
pub struct JsonFileProvider {
    path: PathBuf,
}

impl JsonFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MetadataProvider for JsonFileProvider {
    async fn load(&self) -> Result<GraphDefinition> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading metadata from {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing metadata from {}", self.path.display()))
    }
}

/// The immutable, fully linked entity graph.
#[derive(Debug)]
pub struct EntityGraph {
    entities: HashMap<String, Arc<Entity>>,
    /// Lowercased object name -> entity keys sharing it, in definition order.
    aliases: HashMap<String, Vec<String>>,
}

impl EntityGraph {
    /// Build and validate the graph from raw definitions.
    ///
    /// Fails on duplicate entity keys, missing or ambiguous key properties,
    /// and dangling entity references in properties or relations.
    pub fn build(def: GraphDefinition) -> Result<Self> {
        let relations: Vec<Arc<EntityRelation>> =
            def.relations.into_iter().map(Arc::new).collect();

        let mut defs = Vec::with_capacity(def.entities.len());
        for mut e in def.entities {
            if e.object_name.is_empty() {
                e.object_name = e.key.clone();
            }
            defs.push(e);
        }

        let known: HashMap<&str, usize> = defs
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.as_str(), i))
            .collect();
        if known.len() != defs.len() {
            bail!("duplicate entity key in metadata");
        }

        // Validate references and find each entity's key property.
        let mut key_indexes = Vec::with_capacity(defs.len());
        for e in &defs {
            let mut keys = e.properties.iter().enumerate().filter(|(_, p)| p.is_key);
            let key_index = match (keys.next(), keys.next()) {
                (Some((i, _)), None) => i,
                (None, None) => e
                    .properties
                    .iter()
                    .position(|p| p.column.eq_ignore_ascii_case("Id"))
                    .with_context(|| format!("entity {} has no key property", e.key))?,
                _ => bail!("entity {} has more than one key property", e.key),
            };
            key_indexes.push(key_index);

            for p in &e.properties {
                for target in [&p.references_entity, &p.related_entity].into_iter().flatten() {
                    if !known.contains_key(target.as_str()) {
                        bail!("entity {}: property {} references unknown entity {}", e.key, p.name, target);
                    }
                }
            }
        }
        for rel in &relations {
            for side in [&rel.entity_a, &rel.entity_b] {
                if !known.contains_key(side.as_str()) {
                    bail!("relation {} references unknown entity {}", rel.cross_table, side);
                }
            }
        }

        // Reverse links: foreign keys on other entities pointing at each entity.
        let mut referencing: HashMap<String, Vec<ReferencingProperty>> = HashMap::new();
        for e in &defs {
            for p in &e.properties {
                if let Some(target) = &p.references_entity {
                    referencing
                        .entry(target.clone())
                        .or_default()
                        .push(ReferencingProperty {
                            entity: e.key.clone(),
                            column: p.column.clone(),
                            name: e.object_name.clone(),
                        });
                }
            }
        }

        let mut entities = HashMap::new();
        let mut aliases: HashMap<String, Vec<String>> = HashMap::new();
        for (e, key_index) in defs.into_iter().zip(key_indexes) {
            let entity_relations: Vec<Arc<EntityRelation>> = relations
                .iter()
                .filter(|r| r.side_for(&e.key).is_some())
                .cloned()
                .collect();
            aliases
                .entry(e.object_name.to_ascii_lowercase())
                .or_default()
                .push(e.key.clone());
            entities.insert(
                e.key.clone(),
                Arc::new(Entity {
                    referencing: referencing.remove(&e.key).unwrap_or_default(),
                    relations: entity_relations,
                    key: e.key,
                    table: e.table,
                    object_name: e.object_name,
                    soft_delete_column: e.soft_delete_column,
                    properties: e.properties,
                    roles: e.roles,
                    key_index,
                }),
            );
        }

        Ok(Self { entities, aliases })
    }

    pub fn entity(&self, key: &str) -> Option<&Arc<Entity>> {
        self.entities.get(key)
    }

    /// Entities answering to a resource name, in definition order.
    pub fn resource_candidates(&self, name: &str) -> Vec<Arc<Entity>> {
        self.aliases
            .get(&name.to_ascii_lowercase())
            .map(|keys| keys.iter().filter_map(|k| self.entities.get(k)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.entities.values()
    }
}

struct CachedGraph {
    graph: Arc<EntityGraph>,
    built_at: Instant,
}

/// TTL'd snapshot cell around the entity graph.
///
/// Readers take the current snapshot without blocking on I/O; an expired
/// snapshot triggers a rebuild behind a single async mutex so concurrent
/// requests never race to rebuild or observe a half-built graph.
pub struct GraphCache {
    provider: Arc<dyn MetadataProvider>,
    ttl: Duration,
    snapshot: RwLock<Option<CachedGraph>>,
    rebuild: tokio::sync::Mutex<()>,
}

impl GraphCache {
    pub fn new(provider: Arc<dyn MetadataProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            snapshot: RwLock::new(None),
            rebuild: tokio::sync::Mutex::new(()),
        }
    }

    fn fresh(&self) -> Option<Arc<EntityGraph>> {
        let guard = self.snapshot.read();
        guard
            .as_ref()
            .filter(|c| c.built_at.elapsed() < self.ttl)
            .map(|c| c.graph.clone())
    }

    fn stale(&self) -> Option<Arc<EntityGraph>> {
        self.snapshot.read().as_ref().map(|c| c.graph.clone())
    }

    /// Current graph snapshot, rebuilding lazily when expired.
    pub async fn snapshot(&self) -> Result<Arc<EntityGraph>, ApiError> {
        if let Some(graph) = self.fresh() {
            return Ok(graph);
        }

        let _rebuild = self.rebuild.lock().await;
        // Another request may have rebuilt while we waited for the lock.
        if let Some(graph) = self.fresh() {
            return Ok(graph);
        }

        let loaded = self.provider.load().await.and_then(EntityGraph::build);
        match loaded {
            Ok(graph) => {
                let graph = Arc::new(graph);
                tracing::info!(at = %chrono::Utc::now().to_rfc3339(), "entity graph rebuilt");
                *self.snapshot.write() = Some(CachedGraph {
                    graph: graph.clone(),
                    built_at: Instant::now(),
                });
                Ok(graph)
            }
            // Keep serving the stale graph rather than failing every request
            // while the metadata source is unavailable.
            Err(e) if self.stale().is_some() => {
                tracing::warn!(error = %e, "graph rebuild failed, serving stale snapshot");
                Ok(self.stale().expect("stale snapshot checked above"))
            }
            Err(e) => {
                tracing::error!(error = %e, "graph rebuild failed with no snapshot to fall back on");
                Err(ApiError::Internal(format!("metadata load failed: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::sample_definition;
    use std::io::Write;

    #[test]
    fn test_build_links_referencing_properties() {
        let graph = EntityGraph::build(sample_definition()).unwrap();
        let customer = graph.entity("Customer").unwrap();
        // Order.CustomerId points at Customer and resolves under "orders".
        assert_eq!(customer.referencing.len(), 1);
        assert_eq!(customer.referencing[0].entity, "Order");
        assert_eq!(customer.referencing[0].column, "CustomerId");
        assert_eq!(customer.referencing[0].name, "orders");
    }

    #[test]
    fn test_build_attaches_relations_to_both_sides() {
        let graph = EntityGraph::build(sample_definition()).unwrap();
        assert!(graph.entity("Order").unwrap().relation("products").is_some());
        assert!(graph.entity("Product").unwrap().relation("orders").is_some());
    }

    #[test]
    fn test_default_key_property_is_id_column() {
        let graph = EntityGraph::build(sample_definition()).unwrap();
        // Product declares no is_key flag; the Id column is promoted.
        assert_eq!(graph.entity("Product").unwrap().key_property().column, "Id");
    }

    #[test]
    fn test_resource_lookup_is_case_insensitive() {
        let graph = EntityGraph::build(sample_definition()).unwrap();
        assert_eq!(graph.resource_candidates("Orders").len(), 1);
        assert_eq!(graph.resource_candidates("ORDERS").len(), 1);
        assert!(graph.resource_candidates("nope").is_empty());
    }

    #[test]
    fn test_duplicate_entity_key_rejected() {
        let mut def = sample_definition();
        let dup = def.entities[0].clone();
        def.entities.push(dup);
        assert!(EntityGraph::build(def).is_err());
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let mut def = sample_definition();
        def.entities[0].properties[3].references_entity = Some("Ghost".into());
        assert!(EntityGraph::build(def).is_err());
    }

    #[test]
    fn test_json_provider_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = r#"{
            "entities": [
                {
                    "key": "Note",
                    "table": "Notes",
                    "objectName": "notes",
                    "properties": [
                        { "column": "Id", "name": "id", "isKey": true },
                        { "column": "Body", "name": "body" }
                    ]
                }
            ]
        }"#;
        file.write_all(json.as_bytes()).unwrap();

        let provider = JsonFileProvider::new(file.path());
        let def = tokio_test::block_on(provider.load()).unwrap();
        let graph = EntityGraph::build(def).unwrap();
        assert_eq!(graph.resource_candidates("notes").len(), 1);
    }

    #[test]
    fn test_cache_serves_same_snapshot_until_expiry() {
        struct CountingProvider(std::sync::atomic::AtomicUsize);
        #[async_trait]
        impl MetadataProvider for CountingProvider {
            async fn load(&self) -> Result<GraphDefinition> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(sample_definition())
            }
        }

        let provider = Arc::new(CountingProvider(std::sync::atomic::AtomicUsize::new(0)));
        let cache = GraphCache::new(provider.clone(), Duration::from_secs(60));

        let a = tokio_test::block_on(cache.snapshot()).unwrap();
        let b = tokio_test::block_on(cache.snapshot()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
