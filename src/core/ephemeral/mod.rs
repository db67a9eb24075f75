//! Per-execution configuration directories.
//!
//! Every execution gets its own directory under `<data_dir>/executions`
//! holding the merged instructions and tool configuration. Decrypted
//! credentials only ever travel as process environment entries; the files
//! name the variables but never contain their values.

use rand::RngCore;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

use crate::core::agent::{Agent, Permission, resolve_permissions};
use crate::core::error::{CoreError, CoreResult};
use crate::core::vault::CredentialVault;
use crate::platform::{NativePlatform, Platform};

pub const INSTRUCTIONS_FILE: &str = "INSTRUCTIONS.md";
pub const TOOLS_FILE: &str = "tools.json";
const DIR_PREFIX: &str = "exec-";
const REDACTED: &str = "[REDACTED]";

/// What the executor needs to launch the process.
pub struct EnvironmentHandle {
    execution_id: String,
    dir: PathBuf,
    env: BTreeMap<String, String>,
    secrets: Vec<String>,
}

impl EnvironmentHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Replace every injected secret value in `text`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

impl std::fmt::Debug for EnvironmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentHandle")
            .field("execution_id", &self.execution_id)
            .field("dir", &self.dir)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Removes the execution directory exactly once: through `cleanup()`, or on
/// drop if `cleanup()` was never reached.
pub struct CleanupGuard {
    dir: Option<PathBuf>,
    runs: Arc<AtomicUsize>,
}

impl CleanupGuard {
    pub fn cleanup(mut self) -> CoreResult<()> {
        self.run()
    }

    fn run(&mut self) -> CoreResult<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        self.runs.fetch_add(1, Ordering::SeqCst);
        secure_remove_dir(&dir)
    }
}

impl std::fmt::Debug for CleanupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupGuard").field("dir", &self.dir).finish()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(dir) = &self.dir {
            warn!(
                "Execution directory {} cleaned up on drop",
                dir.display()
            );
        }
        if let Err(e) = self.run() {
            error!("{}", e);
        }
    }
}

#[derive(Debug)]
pub struct PreparedEnvironment {
    pub handle: EnvironmentHandle,
    pub guard: CleanupGuard,
}

pub struct ConfigGenerator {
    base_dir: PathBuf,
    vault: Arc<CredentialVault>,
    base_template: String,
    cleanups: Arc<AtomicUsize>,
}

impl ConfigGenerator {
    pub fn new(base_dir: PathBuf, vault: Arc<CredentialVault>, base_template: String) -> Self {
        Self {
            base_dir,
            vault,
            base_template,
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Total cleanup runs across all guards issued by this generator.
    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub async fn prepare(&self, agent: &Agent, execution_id: &str) -> CoreResult<PreparedEnvironment> {
        let permissions = resolve_permissions(agent);

        // provider -> env entries
        let mut injected: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        if permissions.allows(Permission::UseCredentials) {
            for credential in self
                .vault
                .active_for_agent(&agent.id, &agent.providers)
                .await?
            {
                injected
                    .entry(credential.meta.provider.clone())
                    .or_default()
                    .extend(credential.payload.env_entries(&credential.meta.provider));
            }
        }

        std::fs::create_dir_all(&self.base_dir).map_err(|e| {
            CoreError::ConfigGenerationFailed(format!(
                "cannot create {}: {}",
                self.base_dir.display(),
                e
            ))
        })?;
        NativePlatform::restrict_dir_permissions(&self.base_dir);

        let dir = self
            .base_dir
            .join(format!("{}{}", DIR_PREFIX, sanitize_id(execution_id)));
        std::fs::create_dir(&dir).map_err(|e| {
            CoreError::ConfigGenerationFailed(format!("cannot create {}: {}", dir.display(), e))
        })?;
        NativePlatform::restrict_dir_permissions(&dir);

        let guard = CleanupGuard {
            dir: Some(dir.clone()),
            runs: self.cleanups.clone(),
        };

        if let Err(e) = self.populate(agent, &dir, &injected) {
            if let Err(cleanup) = guard.cleanup() {
                error!("{}", cleanup);
            }
            return Err(CoreError::ConfigGenerationFailed(e.to_string()));
        }

        let config_home = dir.join(".config");
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), dir.display().to_string());
        env.insert(
            "XDG_CONFIG_HOME".to_string(),
            config_home.display().to_string(),
        );
        env.insert("CONDUCTOR_CONFIG_DIR".to_string(), dir.display().to_string());
        env.insert("CONDUCTOR_EXECUTION_ID".to_string(), execution_id.to_string());
        env.insert("PATH".to_string(), NativePlatform::sandboxed_path());

        let mut secrets = Vec::new();
        for (name, value) in injected.into_values().flatten() {
            if !value.is_empty() {
                secrets.push(value.clone());
            }
            env.insert(name, value);
        }
        // Longest first so a secret containing another is fully replaced.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();

        info!(
            "Prepared environment for execution [{}] agent [{}]",
            execution_id, agent.id
        );

        Ok(PreparedEnvironment {
            handle: EnvironmentHandle {
                execution_id: execution_id.to_string(),
                dir,
                env,
                secrets,
            },
            guard,
        })
    }

    fn populate(
        &self,
        agent: &Agent,
        dir: &Path,
        injected: &BTreeMap<String, Vec<(String, String)>>,
    ) -> std::io::Result<()> {
        let config_home = dir.join(".config");
        std::fs::create_dir(&config_home)?;
        NativePlatform::restrict_dir_permissions(&config_home);

        let mut instructions = self.base_template.trim_end().to_string();
        let merged = agent.merged_instructions();
        if !merged.trim().is_empty() {
            instructions.push_str("\n\n");
            instructions.push_str(merged.trim_end());
        }
        instructions.push('\n');
        write_private(&dir.join(INSTRUCTIONS_FILE), instructions.as_bytes())?;

        let credential_env: BTreeMap<&String, Vec<&String>> = injected
            .iter()
            .map(|(provider, entries)| (provider, entries.iter().map(|(name, _)| name).collect()))
            .collect();
        let tools = serde_json::json!({
            "agent_id": agent.id,
            "config": agent.tool_config,
            "allow": agent.tool_allow,
            "deny": agent.tool_deny,
            "credential_env": credential_env,
        });
        let rendered = serde_json::to_vec_pretty(&tools).map_err(std::io::Error::other)?;
        write_private(&dir.join(TOOLS_FILE), &rendered)?;
        Ok(())
    }

    /// Force-clean `exec-*` directories older than `max_age`, left behind by
    /// a crashed host. Returns how many were removed.
    pub fn sweep_orphans(&self, max_age: Duration) -> CoreResult<usize> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(DIR_PREFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            match secure_remove_dir(&entry.path()) {
                Ok(()) => {
                    removed += 1;
                    self.cleanups.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => error!("Orphan sweep: {}", e),
            }
        }
        if removed > 0 {
            info!("Orphan sweep removed {} execution directories", removed);
        }
        Ok(removed)
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    NativePlatform::restrict_file_permissions(path);
    Ok(())
}

/// Overwrite every file with random bytes, sync, unlink, then remove the
/// directories bottom-up.
fn secure_remove_dir(dir: &Path) -> CoreResult<()> {
    let mut failures = Vec::new();
    scrub(dir, &mut failures);
    if let Err(e) = std::fs::remove_dir(dir)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        failures.push(format!("{}: {}", dir.display(), e));
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(CoreError::CleanupFailure(failures.join("; ")))
    }
}

fn scrub(dir: &Path, failures: &mut Vec<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                failures.push(format!("{}: {}", dir.display(), e));
            }
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            scrub(&path, failures);
            if let Err(e) = std::fs::remove_dir(&path) {
                failures.push(format!("{}: {}", path.display(), e));
            }
        } else if let Err(e) = overwrite_and_remove(&path) {
            failures.push(format!("{}: {}", path.display(), e));
        }
    }
}

fn overwrite_and_remove(path: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    let len = meta.len();
    if meta.file_type().is_file() && len > 0 {
        let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
        let mut rng = rand::thread_rng();
        let mut buf = [0u8; 4096];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            rng.fill_bytes(&mut buf[..n]);
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }
    std::fs::remove_file(path)
}
