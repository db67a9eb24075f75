//! Organizational agents, their permissions and the management hierarchy.

mod permissions;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::core::error::{CoreError, CoreResult};

pub use permissions::{EffectivePermissions, Permission, PermissionLevel, resolve_permissions};

/// A configured role inside an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub manager_id: Option<String>,
    #[serde(default = "default_level")]
    pub permission_level: PermissionLevel,
    #[serde(default)]
    pub base_instructions: String,
    #[serde(default)]
    pub instructions_override: Option<String>,
    #[serde(default)]
    pub tool_allow: Vec<String>,
    #[serde(default)]
    pub tool_deny: Vec<String>,
    #[serde(default)]
    pub permission_overrides: BTreeMap<Permission, bool>,
    /// Providers whose credentials are injected into executions.
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default = "default_tool_config")]
    pub tool_config: serde_json::Value,
    #[serde(default)]
    pub account_affinity: Option<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub archived: bool,
}

fn default_level() -> PermissionLevel {
    PermissionLevel::Member
}

fn default_tool_config() -> serde_json::Value {
    serde_json::json!({})
}

fn default_max_concurrency() -> usize {
    1
}

impl Agent {
    pub fn new(id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            manager_id: None,
            permission_level: default_level(),
            base_instructions: String::new(),
            instructions_override: None,
            tool_allow: Vec::new(),
            tool_deny: Vec::new(),
            permission_overrides: BTreeMap::new(),
            providers: Vec::new(),
            tool_config: default_tool_config(),
            account_affinity: None,
            max_concurrency: default_max_concurrency(),
            archived: false,
        }
    }

    /// Base instructions followed by the agent-specific override, if any.
    pub fn merged_instructions(&self) -> String {
        match self.instructions_override.as_deref().map(str::trim) {
            Some(extra) if !extra.is_empty() => {
                format!("{}\n\n{}", self.base_instructions.trim_end(), extra)
            }
            _ => self.base_instructions.clone(),
        }
    }
}

/// Fields an agent may change on itself when it holds `self_configure`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelfConfigUpdate {
    pub instructions_override: Option<String>,
    pub tool_config: Option<serde_json::Value>,
}

/// Arena of agents keyed by id, persisted write-through to SQLite.
///
/// The write lock is held across validation and persistence so two
/// concurrent reassignments cannot jointly introduce a cycle.
pub struct AgentDirectory {
    db: Arc<Mutex<Connection>>,
    agents: RwLock<HashMap<String, Agent>>,
}

impl AgentDirectory {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self {
            db,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub async fn initialize(&self) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                agent_json TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let mut stmt = db.prepare("SELECT agent_json FROM agents")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut loaded = HashMap::new();
        for row in rows {
            let agent: Agent = serde_json::from_str(&row?)?;
            loaded.insert(agent.id.clone(), agent);
        }
        drop(stmt);
        drop(db);

        let count = loaded.len();
        *self.agents.write().await = loaded;
        if count > 0 {
            info!("Loaded {} agents from storage", count);
        }
        Ok(())
    }

    /// Create or replace an agent. The manager must already exist in the
    /// same organization and must not be a descendant of the agent.
    pub async fn upsert(&self, agent: Agent) -> CoreResult<Agent> {
        if agent.max_concurrency == 0 {
            return Err(CoreError::Config(format!(
                "agent '{}' must allow at least one concurrent execution",
                agent.id
            )));
        }
        let mut agents = self.agents.write().await;
        if let Some(manager_id) = agent.manager_id.as_deref() {
            validate_manager(&agents, &agent.id, &agent.organization_id, manager_id)?;
        }
        self.persist(&agent).await?;
        agents.insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    pub async fn get(&self, agent_id: &str) -> CoreResult<Agent> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))
    }

    pub async fn list(&self, organization_id: &str) -> Vec<Agent> {
        let mut out: Vec<Agent> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.organization_id == organization_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Move `agent_id` under `manager_id` (or make it a root with `None`).
    pub async fn reassign_manager(
        &self,
        agent_id: &str,
        manager_id: Option<&str>,
    ) -> CoreResult<Agent> {
        let mut agents = self.agents.write().await;
        let mut agent = agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))?;
        if let Some(manager_id) = manager_id {
            validate_manager(&agents, agent_id, &agent.organization_id, manager_id)?;
        }
        agent.manager_id = manager_id.map(str::to_string);
        self.persist(&agent).await?;
        agents.insert(agent.id.clone(), agent.clone());
        info!(
            "Agent [{}] now reports to {:?}",
            agent_id,
            agent.manager_id.as_deref()
        );
        Ok(agent)
    }

    /// Soft delete. The row stays so past executions keep a valid reference.
    pub async fn archive(&self, agent_id: &str) -> CoreResult<()> {
        let mut agents = self.agents.write().await;
        let mut agent = agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))?;
        agent.archived = true;
        self.persist(&agent).await?;
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    pub async fn update_self_config(
        &self,
        agent_id: &str,
        update: SelfConfigUpdate,
    ) -> CoreResult<Agent> {
        let mut agents = self.agents.write().await;
        let mut agent = agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))?;
        resolve_permissions(&agent).require(Permission::SelfConfigure, agent_id)?;

        if let Some(text) = update.instructions_override {
            agent.instructions_override = Some(text).filter(|t| !t.trim().is_empty());
        }
        if let Some(cfg) = update.tool_config {
            agent.tool_config = cfg;
        }
        self.persist(&agent).await?;
        agents.insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }

    pub async fn manager_of(&self, agent_id: &str) -> CoreResult<Option<Agent>> {
        let agents = self.agents.read().await;
        let agent = agents
            .get(agent_id)
            .ok_or_else(|| CoreError::AgentNotFound(agent_id.to_string()))?;
        Ok(agent
            .manager_id
            .as_deref()
            .and_then(|m| agents.get(m))
            .cloned())
    }

    /// True when `candidate` is `ancestor` itself or sits anywhere below it.
    pub async fn is_self_or_descendant(&self, ancestor: &str, candidate: &str) -> bool {
        let agents = self.agents.read().await;
        ancestors_of(&agents, candidate).any(|id| id == ancestor)
    }

    async fn persist(&self, agent: &Agent) -> CoreResult<()> {
        let json = serde_json::to_string(agent)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agents (id, organization_id, agent_json, archived, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                organization_id = excluded.organization_id,
                agent_json = excluded.agent_json,
                archived = excluded.archived,
                updated_at = CURRENT_TIMESTAMP",
            params![agent.id, agent.organization_id, json, agent.archived],
        )?;
        Ok(())
    }
}

/// Walk from `start` up to the root, yielding `start` first. Bounded by the
/// arena size so a corrupted table cannot loop forever.
fn ancestors_of<'a>(
    agents: &'a HashMap<String, Agent>,
    start: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    let limit = agents.len() + 1;
    std::iter::successors(Some(start), move |id| {
        agents.get(*id).and_then(|a| a.manager_id.as_deref())
    })
    .take(limit)
}

fn validate_manager(
    agents: &HashMap<String, Agent>,
    agent_id: &str,
    organization_id: &str,
    manager_id: &str,
) -> CoreResult<()> {
    let manager = agents
        .get(manager_id)
        .ok_or_else(|| CoreError::AgentNotFound(manager_id.to_string()))?;
    if manager.organization_id != organization_id {
        return Err(CoreError::PermissionDenied(format!(
            "manager '{}' belongs to another organization",
            manager_id
        )));
    }
    if manager.archived {
        return Err(CoreError::PermissionDenied(format!(
            "manager '{}' is archived",
            manager_id
        )));
    }
    if ancestors_of(agents, manager_id).any(|id| id == agent_id) {
        return Err(CoreError::HierarchyCycle {
            agent_id: agent_id.to_string(),
            manager_id: manager_id.to_string(),
        });
    }
    Ok(())
}
