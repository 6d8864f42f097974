//! Role-gated operations.

use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Approve or reject an artifact from inside a review gate.
    SetArtifactStatus,
    /// Reopen a Blocked phase.
    ResetPhase,
    /// Decide between conflicting agent proposals.
    ResolveConflict,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Permission::SetArtifactStatus => write!(f, "set_artifact_status"),
            Permission::ResetPhase => write!(f, "reset_phase"),
            Permission::ResolveConflict => write!(f, "resolve_conflict"),
        }
    }
}

/// Roles granted `permission`.
pub fn roles_for(permission: Permission) -> &'static [AgentRole] {
    use AgentRole::*;
    match permission {
        Permission::SetArtifactStatus => &[
            ProductManager,
            Architect,
            Developer,
            QaEngineer,
            Reviewer,
            TeamLead,
            ProjectManager,
        ],
        Permission::ResetPhase => &[TeamLead, ProjectManager],
        Permission::ResolveConflict => &[TeamLead, ProjectManager, Architect],
    }
}

pub fn is_allowed(role: AgentRole, permission: Permission) -> bool {
    roles_for(permission).contains(&role)
}

/// `PermissionDenied` unless `role` holds `permission`.
pub fn check(role: AgentRole, permission: Permission, project: &str) -> Result<()> {
    if is_allowed(role, permission) {
        return Ok(());
    }
    tracing::warn!(%role, %permission, project, "permission denied");
    Err(Error::PermissionDenied {
        project: project.to_string(),
        role: role.to_string(),
        permission: permission.to_string(),
    })
}
