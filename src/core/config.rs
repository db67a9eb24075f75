//! Runtime configuration loaded from `<data_dir>/conductor.toml`.
//!
//! Every section has defaults, so a missing file produces a working setup.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::agent::Agent;
use crate::core::error::{CoreError, CoreResult};
use crate::core::pool::AccountSpec;

pub const CONFIG_FILE: &str = "conductor.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub log_level: String,
    pub api: ApiConfig,
    pub vault: VaultConfig,
    pub execution: ExecutionConfig,
    pub pool: PoolConfig,
    pub ephemeral: EphemeralConfig,
    pub oauth: OAuthSettings,
    pub supervisor: SupervisorConfig,
    pub accounts: Vec<AccountSpec>,
    pub agents: Vec<Agent>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            api: ApiConfig::default(),
            vault: VaultConfig::default(),
            execution: ExecutionConfig::default(),
            pool: PoolConfig::default(),
            ephemeral: EphemeralConfig::default(),
            oauth: OAuthSettings::default(),
            supervisor: SupervisorConfig::default(),
            accounts: Vec::new(),
            agents: Vec::new(),
        }
    }
}

impl CoreConfig {
    /// Read `conductor.toml` from `data_dir`; absent file means defaults.
    pub fn load(data_dir: &Path) -> CoreResult<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> CoreResult<Self> {
        toml::from_str(raw).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required on every route except the OAuth callback.
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 17990,
            token: None,
        }
    }
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub kdf_iterations: u32,
    pub rotation_overlap_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: 210_000,
            rotation_overlap_secs: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Binary spawned once per execution; the prompt is written to its stdin.
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub grace_period_secs: u64,
    /// Host variables copied into the otherwise cleared process environment.
    pub passthrough_env: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
            timeout_secs: 30 * 60,
            grace_period_secs: 10,
            passthrough_env: vec!["LANG".to_string(), "TZ".to_string()],
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPolicy {
    /// Wait (bounded) for an account to free up or leave cooldown.
    Queue,
    /// Report `AccountsExhausted` immediately.
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub exhausted_policy: ExhaustedPolicy,
    pub queue_wait_secs: u64,
    pub default_cooldown_secs: u64,
    /// Half-life of the rolling usage estimate used to rank accounts.
    pub usage_half_life_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            exhausted_policy: ExhaustedPolicy::Queue,
            queue_wait_secs: 30,
            default_cooldown_secs: 60,
            usage_half_life_secs: 300,
        }
    }
}

impl PoolConfig {
    pub fn queue_wait(&self) -> Duration {
        Duration::from_secs(self.queue_wait_secs)
    }

    pub fn default_cooldown(&self) -> Duration {
        Duration::from_secs(self.default_cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EphemeralConfig {
    pub orphan_max_age_secs: u64,
    /// Six-field cron expression for the orphan sweep.
    pub sweep_cron: String,
    /// Prepended to every agent's instructions.
    pub base_template: String,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            orphan_max_age_secs: 6 * 3600,
            sweep_cron: "0 */10 * * * *".to_string(),
            base_template: "You are an organizational agent. Work only on the task you are given \
                            and only with the tools and credentials provided to you."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    pub redirect_uri: String,
    pub state_ttl_secs: u64,
    pub providers: BTreeMap<String, OAuthProviderConfig>,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            redirect_uri: "http://127.0.0.1:17990/api/oauth/callback".to_string(),
            state_ttl_secs: 600,
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct OAuthProviderConfig {
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_scope_separator")]
    pub scope_separator: String,
}

fn default_scope_separator() -> String {
    " ".to_string()
}

impl std::fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Escalate timed-out or crashed executions to the agent's manager.
    pub auto_escalate: bool,
}

pub fn executions_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("executions")
}
