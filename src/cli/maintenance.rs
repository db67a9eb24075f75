use anyhow::{Context, Result, bail};
use std::path::Path;
use std::time::Duration;

use crate::core::config::CoreConfig;
use crate::core::runtime::Runtime;
use crate::core::terminal;
use crate::core::vault::{MasterSecret, overlap};

pub const NEW_MASTER_KEY_ENV: &str = "CONDUCTOR_NEW_MASTER_KEY";

pub async fn run_sweep(data_dir: &Path, config: CoreConfig, max_age_secs: u64) -> Result<()> {
    let runtime = Runtime::open(data_dir, config).await?;
    let removed = runtime
        .generator
        .sweep_orphans(Duration::from_secs(max_age_secs))
        .context("orphan sweep failed")?;
    terminal::print_success(&format!(
        "Swept {} orphaned execution directories (older than {}s)",
        removed, max_age_secs
    ));
    Ok(())
}

/// Re-encrypt every credential under the new key. The old key must still be
/// the current `CONDUCTOR_MASTER_KEY` when this runs.
pub async fn run_rotate_keys(data_dir: &Path, config: CoreConfig) -> Result<()> {
    let next = match std::env::var(NEW_MASTER_KEY_ENV) {
        Ok(v) if !v.trim().is_empty() => MasterSecret::new(v.into_bytes()),
        _ => bail!("{} must be set to the new master key", NEW_MASTER_KEY_ENV),
    };
    let overlap_secs = config.vault.rotation_overlap_secs;

    let runtime = Runtime::open(data_dir, config).await?;
    runtime
        .vault
        .rotate_master_key(next, overlap(overlap_secs))
        .await
        .context("master key rotation failed")?;
    let count = runtime
        .vault
        .reencrypt_all()
        .await
        .context("re-encryption failed")?;

    terminal::print_success(&format!("Re-encrypted {} credentials", count));
    terminal::print_info(&format!(
        "Set CONDUCTOR_MASTER_KEY to the value of {} and keep the old key in CONDUCTOR_PREVIOUS_MASTER_KEY for {}s.",
        NEW_MASTER_KEY_ENV, overlap_secs
    ));
    Ok(())
}
