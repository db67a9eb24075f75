//! Builds the execution core from a data directory and its config file.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::agent::{Agent, AgentDirectory};
use crate::core::config::{CoreConfig, executions_dir};
use crate::core::ephemeral::ConfigGenerator;
use crate::core::error::{CoreError, CoreResult};
use crate::core::executor::ProcessExecutor;
use crate::core::lifecycle::{LifecycleManager, register_maintenance};
use crate::core::oauth::{HttpTokenExchanger, OAuthFlow, TokenExchanger};
use crate::core::pool::AccountPool;
use crate::core::supervisor::Supervisor;
use crate::core::tracker::ExecutionTracker;
use crate::core::vault::{CredentialVault, KeyRing};
use crate::platform::{NativePlatform, Platform};

pub const DATABASE_FILE: &str = "conductor.db";

/// Every long-lived component, sharing one SQLite connection.
#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<CoreConfig>,
    pub data_dir: PathBuf,
    pub agents: Arc<AgentDirectory>,
    pub vault: Arc<CredentialVault>,
    pub oauth: Arc<OAuthFlow>,
    pub generator: Arc<ConfigGenerator>,
    pub pool: AccountPool,
    pub tracker: Arc<ExecutionTracker>,
    pub supervisor: Supervisor,
}

impl Runtime {
    /// Open `<data_dir>/conductor.db`, key the vault from the environment
    /// and bring every component up.
    pub async fn open(data_dir: &Path, config: CoreConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;
        NativePlatform::restrict_dir_permissions(data_dir);

        let db_path = data_dir.join(DATABASE_FILE);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("cannot open {}", db_path.display()))?;
        NativePlatform::restrict_file_permissions(&db_path);

        let keys = KeyRing::from_env(&config.vault)?;
        let runtime = Self::assemble(
            config,
            data_dir.to_path_buf(),
            Arc::new(Mutex::new(conn)),
            keys,
            Arc::new(HttpTokenExchanger::new()),
        )
        .await?;
        info!("Conductor runtime ready in {}", data_dir.display());
        Ok(runtime)
    }

    pub async fn assemble(
        config: CoreConfig,
        data_dir: PathBuf,
        db: Arc<Mutex<Connection>>,
        keys: KeyRing,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> CoreResult<Self> {
        let vault = Arc::new(CredentialVault::new(db.clone(), keys));
        vault.initialize().await?;

        let agents = Arc::new(AgentDirectory::new(db.clone()));
        agents.initialize().await?;
        seed_agents(&agents, &config.agents).await?;

        let tracker = Arc::new(ExecutionTracker::new(db.clone()));
        tracker.initialize().await?;

        let oauth = Arc::new(OAuthFlow::new(
            db,
            vault.clone(),
            config.oauth.clone(),
            exchanger,
        ));
        oauth.initialize().await?;

        let exec_dir = executions_dir(&data_dir);
        std::fs::create_dir_all(&exec_dir)?;
        NativePlatform::restrict_dir_permissions(&exec_dir);
        let generator = Arc::new(ConfigGenerator::new(
            exec_dir,
            vault.clone(),
            config.ephemeral.base_template.clone(),
        ));

        let pool = AccountPool::new(config.pool.clone());
        for spec in &config.accounts {
            pool.provision(spec.clone())?;
        }

        let executor = Arc::new(ProcessExecutor::new(
            config.execution.clone(),
            tracker.clone(),
            pool.clone(),
        )?);
        let supervisor = Supervisor::new(
            agents.clone(),
            tracker.clone(),
            generator.clone(),
            pool.clone(),
            executor,
            config.supervisor.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            data_dir,
            agents,
            vault,
            oauth,
            generator,
            pool,
            tracker,
            supervisor,
        })
    }

    /// Scheduler with the maintenance jobs registered and started.
    pub async fn start_lifecycle(&self) -> Result<LifecycleManager> {
        let mut lifecycle = LifecycleManager::new().await?;
        register_maintenance(
            &lifecycle,
            &self.config,
            self.generator.clone(),
            self.oauth.clone(),
            self.vault.clone(),
        )
        .await?;
        lifecycle.start().await?;
        Ok(lifecycle)
    }
}

/// Upsert configured agents, managers before their reports regardless of
/// the order they appear in the file.
async fn seed_agents(directory: &AgentDirectory, seeds: &[Agent]) -> CoreResult<()> {
    let mut pending: Vec<&Agent> = seeds.iter().collect();
    while !pending.is_empty() {
        let mut deferred = Vec::new();
        for agent in pending.iter().copied() {
            let manager_ready = match agent.manager_id.as_deref() {
                None => true,
                Some(m) => directory.get(m).await.is_ok() && !pending.iter().any(|a| a.id == m),
            };
            if manager_ready {
                directory.upsert(agent.clone()).await?;
            } else {
                deferred.push(agent);
            }
        }
        if deferred.len() == pending.len() {
            let stuck: Vec<&str> = deferred.iter().map(|a| a.id.as_str()).collect();
            warn!("Agents with unresolved managers: {:?}", stuck);
            return Err(CoreError::Config(format!(
                "agents {:?} reference managers that are missing or form a cycle",
                stuck
            )));
        }
        pending = deferred;
    }
    if !seeds.is_empty() {
        info!("Seeded {} agents from config", seeds.len());
    }
    Ok(())
}
