use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::core::config::CoreConfig;
use crate::core::ephemeral::ConfigGenerator;
use crate::core::oauth::OAuthFlow;
use crate::core::vault::CredentialVault;

const OAUTH_PURGE_CRON: &str = "0 */5 * * * *";
const REENCRYPT_CRON: &str = "0 15 * * * *";

#[derive(Debug, PartialEq)]
pub enum LifecycleState {
    Init,
    Ready,
    Shutdown,
}

/// Owns the cron scheduler for background maintenance.
pub struct LifecycleManager {
    state: LifecycleState,
    scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            scheduler,
        })
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Register `run` on a six-field cron expression.
    pub async fn add_job<F, Fut>(&self, name: &'static str, cron: &str, run: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job = Job::new_async(cron, move |_uuid, mut _l| {
            let run = run.clone();
            Box::pin(async move {
                run().await;
            })
        })
        .with_context(|| format!("invalid cron '{}' for job {}", cron, name))?;
        self.scheduler.add(job).await?;
        info!("Scheduled {} ({})", name, cron);
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;
        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }
        Ok(())
    }
}

/// Orphan sweep, expired OAuth state purge and batch re-encryption.
pub async fn register_maintenance(
    lifecycle: &LifecycleManager,
    config: &CoreConfig,
    generator: Arc<ConfigGenerator>,
    oauth: Arc<OAuthFlow>,
    vault: Arc<CredentialVault>,
) -> Result<()> {
    let max_age = std::time::Duration::from_secs(config.ephemeral.orphan_max_age_secs);
    lifecycle
        .add_job("orphan sweep", &config.ephemeral.sweep_cron, move || {
            let generator = generator.clone();
            async move {
                if let Err(e) = generator.sweep_orphans(max_age) {
                    error!("Orphan sweep failed: {}", e);
                }
            }
        })
        .await?;

    lifecycle
        .add_job("oauth state purge", OAUTH_PURGE_CRON, move || {
            let oauth = oauth.clone();
            async move {
                match oauth.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!("Purged {} expired OAuth states", n),
                    Err(e) => error!("OAuth state purge failed: {}", e),
                }
            }
        })
        .await?;

    lifecycle
        .add_job("vault re-encryption", REENCRYPT_CRON, move || {
            let vault = vault.clone();
            async move {
                if let Err(e) = vault.reencrypt_all().await {
                    error!("Vault re-encryption failed: {}", e);
                }
            }
        })
        .await?;

    Ok(())
}
