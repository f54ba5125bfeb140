//! Entity metadata graph: model, construction and caching.

pub mod model;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use model::{
    DefaultValue, Entity, EntityDef, EntityRelation, EntityRole, GraphDefinition, Property,
    ReferencingProperty, RelationSide,
};
pub use registry::{EntityGraph, GraphCache, JsonFileProvider, MetadataProvider};
