//! Join/projection planning.
//!
//! The planner turns an entity plus a set of requested property paths into
//! a tree of table aliases ([JoinNode]) and renders it as one SELECT:
//! single-object joins become LEFT JOINs whose columns nest by dotted
//! output path, collection joins become correlated JSON-aggregated
//! subqueries.

pub mod select;

pub use select::{PlannedQuery, SelectPlanner};

/// How a planned node attaches to its parent.
#[derive(Debug, Clone)]
pub enum Link {
    /// The query root; correlation and filtering are the caller's business.
    Root,
    /// Single-object join (foreign key or inverse single reference).
    Single { predicate: String },
    /// Collection join (relation or inverse array reference).
    Array { predicate: String },
}

/// One table alias in the join plan.
#[derive(Debug)]
pub struct JoinNode {
    pub alias: String,
    pub table: String,
    pub link: Link,
    /// Output name under the parent (empty for the root).
    pub out_name: String,
    /// Dotted output path of this node's own columns.
    pub path: String,
    /// (output name, SQL expression, dotted output path) triples.
    pub columns: Vec<(String, String, String)>,
    /// Flat-joined single-object children.
    pub singles: Vec<JoinNode>,
    /// Correlated collection children, each its own subquery scope.
    pub arrays: Vec<JoinNode>,
    /// Predicates scoped to this alias: soft delete, nested permissions.
    pub filters: Vec<String>,
}
