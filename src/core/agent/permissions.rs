use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::Agent;
use crate::core::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Admin,
    Manager,
    Member,
    Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Run tasks at all.
    Execute,
    /// Call tools from the allow list.
    UseTools,
    /// Receive decrypted provider credentials in the execution environment.
    UseCredentials,
    /// Hand tasks to subordinates.
    Delegate,
    /// Route failed tasks to the manager.
    Escalate,
    /// Change own instructions override and tool config.
    SelfConfigure,
}

impl PermissionLevel {
    pub fn default_permissions(self) -> BTreeSet<Permission> {
        use Permission::*;
        let granted: &[Permission] = match self {
            PermissionLevel::Admin => &[
                Execute,
                UseTools,
                UseCredentials,
                Delegate,
                Escalate,
                SelfConfigure,
            ],
            PermissionLevel::Manager => &[
                Execute,
                UseTools,
                UseCredentials,
                Delegate,
                Escalate,
                SelfConfigure,
            ],
            PermissionLevel::Member => &[Execute, UseTools, UseCredentials, Escalate],
            PermissionLevel::Restricted => &[Execute],
        };
        granted.iter().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectivePermissions {
    pub level: PermissionLevel,
    pub granted: BTreeSet<Permission>,
    pub tool_allow: Vec<String>,
    pub tool_deny: Vec<String>,
}

impl EffectivePermissions {
    pub fn allows(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }

    pub fn require(&self, permission: Permission, agent_id: &str) -> CoreResult<()> {
        if self.allows(permission) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied(format!(
                "agent '{}' lacks the {:?} permission",
                agent_id, permission
            )))
        }
    }

    /// Deny list wins; an empty allow list means every tool not denied.
    pub fn tool_allowed(&self, tool: &str) -> bool {
        if !self.allows(Permission::UseTools) {
            return false;
        }
        if self.tool_deny.iter().any(|t| t == tool) {
            return false;
        }
        self.tool_allow.is_empty() || self.tool_allow.iter().any(|t| t == tool)
    }
}

/// Role defaults for the agent's level, then per-agent overrides on top.
pub fn resolve_permissions(agent: &Agent) -> EffectivePermissions {
    let mut granted = agent.permission_level.default_permissions();
    for (permission, allowed) in &agent.permission_overrides {
        if *allowed {
            granted.insert(*permission);
        } else {
            granted.remove(permission);
        }
    }
    EffectivePermissions {
        level: agent.permission_level,
        granted,
        tool_allow: agent.tool_allow.clone(),
        tool_deny: agent.tool_deny.clone(),
    }
}
