//! Principals and permissions
//!
//! A principal is whoever asks the kernel to do something: an agent, a
//! human operator, or another service. Permissions are (action, resource)
//! pairs; `*` is a wildcard on either side. Permission checks never
//! consult anything outside the principal itself, so they are cheap and
//! deterministic.

use serde::{Deserialize, Serialize};

/// What kind of actor a principal is.
///
/// Only `Human` principals may resolve PENDING_HUMAN approvals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Agent,
    Human,
    Service,
}

/// A single (action, resource) grant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    /// Action verb, e.g. `state:write`, `rollback`, `execute`
    pub action: String,
    /// Resource the action applies to; `*` grants all resources
    pub resource: String,
}

impl Permission {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
        }
    }

    /// Whether this grant covers the requested action on the resource.
    pub fn grants(&self, action: &str, resource: &str) -> bool {
        let action_ok = self.action == "*" || self.action == action;
        let resource_ok = self.resource == "*" || self.resource == resource;
        action_ok && resource_ok
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.action, self.resource)
    }
}

/// An actor known to the kernel, with its granted permissions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identifier, e.g. `agent:planner` or `alice`
    pub id: String,
    pub kind: PrincipalKind,
    /// Grants held by this principal
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl Principal {
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Agent,
            permissions: Vec::new(),
        }
    }

    pub fn human(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Human,
            permissions: Vec::new(),
        }
    }

    pub fn service(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: PrincipalKind::Service,
            permissions: Vec::new(),
        }
    }

    pub fn with_permission(mut self, action: impl Into<String>, resource: impl Into<String>) -> Self {
        self.permissions.push(Permission::new(action, resource));
        self
    }

    /// Whether any held grant covers `action` on `resource`.
    pub fn can(&self, action: &str, resource: &str) -> bool {
        self.permissions.iter().any(|p| p.grants(action, resource))
    }

    pub fn is_human(&self) -> bool {
        self.kind == PrincipalKind::Human
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}
