//! Entity graph model
//!
//! The immutable, in-memory description of what the service exposes:
//! entities (tables), properties (columns and navigations), many-to-many
//! relations and per-role access rules. Built once by the registry from a
//! [GraphDefinition] and shared read-only across requests.

use std::sync::Arc;

use serde::Deserialize;

/// Raw definitions as supplied by a metadata provider.
///
/// Already validated structurally by serde; cross-references between
/// entities are checked when the graph is built.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDefinition {
    pub entities: Vec<EntityDef>,
    #[serde(default)]
    pub relations: Vec<EntityRelation>,
}

/// One entity as defined by the metadata provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDef {
    /// Stable identity, also the cycle-detection token during planning.
    pub key: String,
    /// Backing table name.
    pub table: String,
    /// Externally visible resource name; defaults to the key.
    #[serde(default)]
    pub object_name: String,
    /// Nullable timestamp column; non-NULL marks the row as deleted.
    #[serde(default)]
    pub soft_delete_column: Option<String>,
    pub properties: Vec<Property>,
    #[serde(default)]
    pub roles: Vec<EntityRole>,
}

/// One column or navigation on an entity.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    /// Physical column name.
    pub column: String,
    /// External (camelCase) name.
    pub name: String,
    #[serde(default)]
    pub is_key: bool,
    #[serde(default)]
    pub is_read_only: bool,
    /// Hidden properties are excluded from every projection but stay filterable.
    #[serde(default)]
    pub is_hidden: bool,
    /// Foreign key: the entity this column points at. Projects as a nested
    /// single object under this property's name.
    #[serde(default)]
    pub references_entity: Option<String>,
    /// Inverse side of a foreign key declared on `related_entity`:
    /// `related_property` names the foreign-key property over there.
    #[serde(default)]
    pub related_entity: Option<String>,
    #[serde(default)]
    pub related_property: Option<String>,
    /// Inverse side only: array of rows rather than a single object.
    #[serde(default)]
    pub is_collection: bool,
    #[serde(default)]
    pub default_value: Option<DefaultValue>,
}

impl Property {
    /// Inverse side of a foreign key declared on another entity.
    pub fn is_inverse(&self) -> bool {
        self.related_entity.is_some()
    }
}

/// Directive applied when an insert payload omits the property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DefaultValue {
    /// The authenticated principal's user id.
    #[serde(rename = "$user")]
    CurrentUserId,
}

/// A many-to-many association via a junction table.
///
/// Each side may expose the association under its own collection property
/// name; an empty name hides the relation from that side. The optional
/// validity window (from/to timestamps) or active flag implements
/// soft-unlink: rows outside the window are treated as absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRelation {
    pub cross_table: String,
    pub entity_a: String,
    pub column_a: String,
    #[serde(default)]
    pub property_a: String,
    pub entity_b: String,
    pub column_b: String,
    #[serde(default)]
    pub property_b: String,
    #[serde(default)]
    pub valid_from_column: Option<String>,
    #[serde(default)]
    pub valid_to_column: Option<String>,
    #[serde(default)]
    pub active_column: Option<String>,
}

/// The relation as seen from one participating entity.
#[derive(Debug, Clone, Copy)]
pub struct RelationSide<'a> {
    /// Junction column referencing the near (current) entity.
    pub near_column: &'a str,
    /// Junction column referencing the far entity.
    pub far_column: &'a str,
    pub far_entity: &'a str,
    /// Collection property name visible on the near side.
    pub property: &'a str,
}

impl EntityRelation {
    /// View from `entity_key`, or None when the entity does not participate.
    pub fn side_for(&self, entity_key: &str) -> Option<RelationSide<'_>> {
        if self.entity_a == entity_key {
            Some(RelationSide {
                near_column: &self.column_a,
                far_column: &self.column_b,
                far_entity: &self.entity_b,
                property: &self.property_a,
            })
        } else if self.entity_b == entity_key {
            Some(RelationSide {
                near_column: &self.column_b,
                far_column: &self.column_a,
                far_entity: &self.entity_a,
                property: &self.property_b,
            })
        } else {
            None
        }
    }

    pub fn has_window(&self) -> bool {
        self.valid_from_column.is_some()
            || self.valid_to_column.is_some()
            || self.active_column.is_some()
    }

    /// Predicate keeping only junction rows whose validity window is open,
    /// against `alias`; None when the relation declares no window.
    pub fn window_predicate(
        &self,
        alias: &str,
        dialect: &dyn crate::sql::SqlDialect,
    ) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(vf) = &self.valid_from_column {
            parts.push(format!(
                "{alias}.{} <= {}",
                dialect.quote(vf),
                dialect.current_timestamp()
            ));
        }
        if let Some(vt) = &self.valid_to_column {
            // NULL means the link is open-ended.
            let col = format!("{alias}.{}", dialect.quote(vt));
            parts.push(format!(
                "({col} IS NULL OR {col} >= {})",
                dialect.current_timestamp()
            ));
        }
        if let Some(ac) = &self.active_column {
            parts.push(format!(
                "{alias}.{} = {}",
                dialect.quote(ac),
                dialect.bool_literal(true)
            ));
        }
        (!parts.is_empty()).then(|| parts.join(" AND "))
    }
}

/// Per-(entity, role) capability flags and filter templates.
///
/// Filter templates are comparer-grammar JSON carrying `$user` / `$role`
/// tokens; the empty string means unrestricted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRole {
    pub role: String,
    #[serde(default)]
    pub read_one: bool,
    #[serde(default)]
    pub read_all: bool,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub view_filter: String,
    #[serde(default)]
    pub edit_filter: String,
}

/// A foreign-key property on *another* entity that points at this one.
#[derive(Debug, Clone)]
pub struct ReferencingProperty {
    /// Key of the entity holding the foreign key.
    pub entity: String,
    /// Foreign-key column over there.
    pub column: String,
    /// Name this hop resolves under (the referencing entity's object name).
    pub name: String,
}

/// A fully built entity: definition plus the links computed at build time.
#[derive(Debug)]
pub struct Entity {
    pub key: String,
    pub table: String,
    pub object_name: String,
    pub soft_delete_column: Option<String>,
    pub properties: Vec<Property>,
    pub roles: Vec<EntityRole>,
    /// Foreign keys on other entities pointing here.
    pub referencing: Vec<ReferencingProperty>,
    /// Relations where this entity participates on either side.
    pub relations: Vec<Arc<EntityRelation>>,
    pub(crate) key_index: usize,
}

impl Entity {
    pub fn key_property(&self) -> &Property {
        &self.properties[self.key_index]
    }

    /// Case-insensitive lookup by external property name.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive lookup among foreign keys referencing this entity.
    pub fn referencing_property(&self, name: &str) -> Option<&ReferencingProperty> {
        self.referencing
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// Relation exposed on this entity's side under `name`.
    pub fn relation(&self, name: &str) -> Option<(&Arc<EntityRelation>, RelationSide<'_>)> {
        self.relations.iter().find_map(|rel| {
            let side = rel.side_for(&self.key)?;
            (!side.property.is_empty() && side.property.eq_ignore_ascii_case(name))
                .then_some((rel, side))
        })
    }

    /// Relations visible from this entity (a non-empty collection name).
    pub fn visible_relations(&self) -> impl Iterator<Item = (&Arc<EntityRelation>, RelationSide<'_>)> {
        self.relations.iter().filter_map(|rel| {
            let side = rel.side_for(&self.key)?;
            (!side.property.is_empty()).then_some((rel, side))
        })
    }

    /// Whether the entity is public, i.e. carries no role rules at all.
    pub fn is_unrestricted(&self) -> bool {
        self.roles.is_empty()
    }
}
