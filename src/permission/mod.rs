//! Role-based access resolution
//!
//! Selects the applicable role rule for a principal and turns its filter
//! template into a comparer tree with `$user` / `$role` substituted. The
//! resulting filter is ANDed into every statement touching the entity, so
//! a crafted request can never reach rows the rule excludes.

use std::sync::Arc;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::filter::Comparer;
use crate::graph::model::{Entity, EntityRole};

/// Requested operation, mapped onto the role capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadOne,
    ReadAll,
    Create,
    Update,
    Delete,
}

impl Capability {
    fn allowed(self, role: &EntityRole) -> bool {
        match self {
            Capability::ReadOne => role.read_one,
            Capability::ReadAll => role.read_all,
            Capability::Create => role.create,
            Capability::Update => role.update,
            Capability::Delete => role.delete,
        }
    }

    /// Read capabilities resolve the view filter, write capabilities the
    /// edit filter.
    fn is_read(self) -> bool {
        matches!(self, Capability::ReadOne | Capability::ReadAll)
    }
}

/// Access decision for a nested entity reached during planning.
#[derive(Debug, Clone)]
pub enum Access {
    /// No role rules on the entity; anyone may read it.
    Public,
    /// Readable through the role's view filter.
    Filtered(Comparer),
    /// Not readable by this principal; the planner skips the expansion.
    Denied,
}

/// Stateless resolver over the immutable graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissionResolver;

impl PermissionResolver {
    /// Pick the entity and permission filter for the requested capability.
    ///
    /// Candidates are every entity answering to the requested resource
    /// name. Matching role rules carrying a non-empty filter template are
    /// preferred over unrestricted ones; declaration order breaks ties.
    pub fn authorize(
        &self,
        principal: &Principal,
        candidates: &[Arc<Entity>],
        capability: Capability,
    ) -> Result<(Arc<Entity>, Option<Comparer>), ApiError> {
        if candidates.is_empty() {
            return Err(ApiError::NotFound("unknown resource".into()));
        }

        if !principal.is_authenticated() {
            return candidates
                .iter()
                .find(|e| e.is_unrestricted())
                .map(|e| (e.clone(), None))
                .ok_or_else(|| ApiError::Unauthorized("authentication required".into()));
        }

        // (entity, substituted template); empty template = unrestricted.
        let mut matches: Vec<(Arc<Entity>, String)> = Vec::new();
        for entity in candidates {
            if entity.is_unrestricted() {
                matches.push((entity.clone(), String::new()));
                continue;
            }
            for role in &entity.roles {
                if role.role == principal.role_name() && capability.allowed(role) {
                    let template = if capability.is_read() {
                        &role.view_filter
                    } else {
                        &role.edit_filter
                    };
                    matches.push((entity.clone(), substitute(template, principal)));
                }
            }
        }
        matches.sort_by_key(|(_, template)| template.is_empty());

        let (entity, template) = matches.into_iter().next().ok_or_else(|| {
            ApiError::Forbidden(format!(
                "role {} may not {:?} this resource",
                principal.role_name(),
                capability
            ))
        })?;
        Ok((entity, parse_template(&template)?))
    }

    /// Read access for an entity pulled in as a nested join.
    ///
    /// Only the view filter applies; writes never cascade into nested
    /// entities through the planner.
    pub fn subentity_access(&self, principal: &Principal, entity: &Entity) -> Access {
        if entity.is_unrestricted() {
            return Access::Public;
        }
        if !principal.is_authenticated() {
            return Access::Denied;
        }
        let mut templates: Vec<&str> = entity
            .roles
            .iter()
            .filter(|r| r.role == principal.role_name() && (r.read_all || r.read_one))
            .map(|r| r.view_filter.as_str())
            .collect();
        templates.sort_by_key(|t| t.is_empty());

        match templates.first() {
            None => Access::Denied,
            Some(template) if template.is_empty() => Access::Public,
            Some(template) => match parse_template(&substitute(template, principal)) {
                Ok(Some(filter)) => Access::Filtered(filter),
                // An unparsable trusted template must not widen access.
                Ok(None) | Err(_) => Access::Denied,
            },
        }
    }
}

/// Replace `$user` / `$role` tokens inside the raw template text.
///
/// The substituted values are JSON-string-escaped so a principal id cannot
/// alter the parsed tree structure.
fn substitute(template: &str, principal: &Principal) -> String {
    if template.is_empty() {
        return String::new();
    }
    template
        .replace("$user", &escape_json(principal.user_id.as_deref().unwrap_or_default()))
        .replace("$role", &escape_json(principal.role_name()))
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Parse a substituted template with the same grammar client filters use.
fn parse_template(template: &str) -> Result<Option<Comparer>, ApiError> {
    if template.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(template)
        .map(Some)
        .map_err(|e| ApiError::Internal(format!("malformed permission filter template: {e}")))
}
