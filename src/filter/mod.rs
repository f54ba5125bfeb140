//! Boolean filter grammar
//!
//! The comparer tree is the filter AST shared by the REST surface, the
//! GraphQL adapter and the permission templates: a node is either a leaf
//! comparison (property path, operator, literal) or an and/or/not group.
//! Trees are built per request and immutable once compiled.

pub mod compiler;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use compiler::{CompiledFilter, compile};

/// Literal token replaced by the authenticated principal's id.
pub const USER_TOKEN: &str = "$user";

/// Operator compiled as a group-wide word search rather than per leaf.
pub const CONTAINS_ANY: &str = "contains-any";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conjunction {
    And,
    Or,
    Not,
}

/// One node of the filter AST.
///
/// Wire format: groups are `{"conjunction": ..., "comparisons": [...]}`,
/// leaves are `{"property": "a.b.c", "operator": ..., "filter": literal}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Comparer {
    Group {
        conjunction: Conjunction,
        #[serde(default)]
        comparisons: Vec<Comparer>,
    },
    Leaf {
        property: String,
        /// Operator name from the wire; unrecognized names compile to a
        /// constant-true predicate.
        operator: String,
        #[serde(default)]
        filter: Json,
    },
}

impl Comparer {
    pub fn leaf(property: impl Into<String>, operator: impl Into<String>, filter: Json) -> Self {
        Comparer::Leaf {
            property: property.into(),
            operator: operator.into(),
            filter,
        }
    }

    pub fn group(conjunction: Conjunction, comparisons: Vec<Comparer>) -> Self {
        Comparer::Group {
            conjunction,
            comparisons,
        }
    }

    /// AND two optional filters, keeping whichever side is present.
    pub fn merge_and(a: Option<Comparer>, b: Option<Comparer>) -> Option<Comparer> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Comparer::group(Conjunction::And, vec![a, b])),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_leaf_round_trip() {
        let parsed: Comparer =
            serde_json::from_value(json!({"property": "status", "operator": "eq", "filter": "active"}))
                .unwrap();
        match parsed {
            Comparer::Leaf { property, operator, filter } => {
                assert_eq!(property, "status");
                assert_eq!(operator, "eq");
                assert_eq!(filter, json!("active"));
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_group_parses_nested_nodes() {
        let parsed: Comparer = serde_json::from_value(json!({
            "conjunction": "or",
            "comparisons": [
                {"property": "age", "operator": "gt", "filter": 18},
                {"conjunction": "and", "comparisons": [
                    {"property": "name", "operator": "contains", "filter": "a"}
                ]}
            ]
        }))
        .unwrap();
        match parsed {
            Comparer::Group { conjunction, comparisons } => {
                assert_eq!(conjunction, Conjunction::Or);
                assert_eq!(comparisons.len(), 2);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn test_leaf_filter_defaults_to_null() {
        let parsed: Comparer =
            serde_json::from_value(json!({"property": "deleted", "operator": "null"})).unwrap();
        match parsed {
            Comparer::Leaf { filter, .. } => assert_eq!(filter, Json::Null),
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_and() {
        let a = Comparer::leaf("a", "eq", json!(1));
        let b = Comparer::leaf("b", "eq", json!(2));
        assert!(Comparer::merge_and(None, None).is_none());
        assert!(matches!(
            Comparer::merge_and(Some(a.clone()), None),
            Some(Comparer::Leaf { .. })
        ));
        match Comparer::merge_and(Some(a), Some(b)) {
            Some(Comparer::Group { conjunction: Conjunction::And, comparisons }) => {
                assert_eq!(comparisons.len(), 2)
            }
            other => panic!("expected and-group, got {other:?}"),
        }
    }
}
