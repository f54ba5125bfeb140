//! Shared graph fixture for unit tests.

use super::model::*;
use super::registry::EntityGraph;

fn prop(column: &str, name: &str) -> Property {
    Property {
        column: column.into(),
        name: name.into(),
        is_key: false,
        is_read_only: false,
        is_hidden: false,
        references_entity: None,
        related_entity: None,
        related_property: None,
        is_collection: false,
        default_value: None,
    }
}

fn key_prop(column: &str, name: &str) -> Property {
    Property {
        is_key: true,
        ..prop(column, name)
    }
}

/// Orders / Customers / Products / Documents, wired with a foreign key, an
/// inverse collection (forming a cycle Order -> Customer -> Order), one
/// many-to-many relation with an active flag, and role rules on Documents.
pub(crate) fn sample_definition() -> GraphDefinition {
    GraphDefinition {
        entities: vec![
            EntityDef {
                key: "Order".into(),
                table: "Orders".into(),
                object_name: "orders".into(),
                soft_delete_column: None,
                properties: vec![
                    key_prop("Id", "id"),
                    prop("Status", "status"),
                    prop("Total", "total"),
                    Property {
                        references_entity: Some("Customer".into()),
                        ..prop("CustomerId", "customer")
                    },
                    Property {
                        default_value: Some(DefaultValue::CurrentUserId),
                        ..prop("OwnerId", "ownerId")
                    },
                    Property {
                        references_entity: Some("Document".into()),
                        ..prop("DocumentId", "document")
                    },
                    Property {
                        is_hidden: true,
                        ..prop("SecretNote", "secretNote")
                    },
                ],
                roles: vec![],
            },
            EntityDef {
                key: "Customer".into(),
                table: "Customers".into(),
                object_name: "customers".into(),
                soft_delete_column: Some("DeletedAt".into()),
                properties: vec![
                    key_prop("Id", "id"),
                    prop("Name", "name"),
                    prop("Country", "country"),
                    Property {
                        related_entity: Some("Order".into()),
                        related_property: Some("customer".into()),
                        is_collection: true,
                        ..prop("Id", "orders")
                    },
                ],
                roles: vec![],
            },
            EntityDef {
                key: "Product".into(),
                table: "Products".into(),
                object_name: "products".into(),
                soft_delete_column: None,
                properties: vec![
                    prop("Id", "id"),
                    prop("Title", "title"),
                    prop("Body", "body"),
                ],
                roles: vec![],
            },
            EntityDef {
                key: "Document".into(),
                table: "Documents".into(),
                object_name: "documents".into(),
                soft_delete_column: None,
                properties: vec![
                    key_prop("Id", "id"),
                    prop("Title", "title"),
                    prop("OwnerId", "ownerId"),
                ],
                roles: vec![
                    EntityRole {
                        role: "admin".into(),
                        read_one: true,
                        read_all: true,
                        create: true,
                        update: true,
                        delete: true,
                        view_filter: String::new(),
                        edit_filter: String::new(),
                    },
                    EntityRole {
                        role: "user".into(),
                        read_one: true,
                        read_all: true,
                        create: true,
                        update: true,
                        delete: false,
                        view_filter:
                            r#"{"property":"ownerId","operator":"eq","filter":"$user"}"#.into(),
                        edit_filter:
                            r#"{"property":"ownerId","operator":"eq","filter":"$user"}"#.into(),
                    },
                ],
            },
        ],
        relations: vec![EntityRelation {
            cross_table: "OrderProducts".into(),
            entity_a: "Order".into(),
            column_a: "OrderId".into(),
            property_a: "products".into(),
            entity_b: "Product".into(),
            column_b: "ProductId".into(),
            property_b: "orders".into(),
            valid_from_column: None,
            valid_to_column: None,
            active_column: Some("Active".into()),
        }],
    }
}

pub(crate) fn sample_graph() -> EntityGraph {
    EntityGraph::build(sample_definition()).expect("sample definition builds")
}
