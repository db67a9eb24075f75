use thiserror::Error;

/// Failure taxonomy shared by every component of the execution core.
///
/// Messages are safe to log and to return over the API: no variant carries
/// credential material, only identifiers.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("credential '{0}' not found")]
    CredentialNotFound(String),

    #[error("decryption failed for credential '{credential_id}': no key in the ring could open it")]
    DecryptionFailed { credential_id: String },

    #[error("OAuth state is missing, expired or already used; restart the authorization flow")]
    OAuthStateExpired,

    #[error("OAuth token exchange failed: {0}")]
    OAuthExchange(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("failed to generate execution environment: {0}")]
    ConfigGenerationFailed(String),

    #[error("failed to spawn execution process: {0}")]
    ProcessSpawnError(String),

    #[error("execution exceeded its {timeout_secs}s timeout")]
    ExecutionTimeout { timeout_secs: u64 },

    #[error("execution process crashed (exit code {code:?})")]
    ProcessCrashed { code: Option<i32> },

    #[error("no account available for organization '{organization_id}'")]
    AccountsExhausted { organization_id: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("agent '{agent_id}' has no manager to escalate to")]
    NoEscalationTarget { agent_id: String },

    #[error("cleanup failed: {0}")]
    CleanupFailure(String),

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("assigning '{manager_id}' as manager of '{agent_id}' would create a cycle")]
    HierarchyCycle { agent_id: String, manager_id: String },

    #[error("invalid execution transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Stable machine-readable identifier for API responses and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::CredentialNotFound(_) => "credential_not_found",
            CoreError::DecryptionFailed { .. } => "decryption_failed",
            CoreError::OAuthStateExpired => "oauth_state_expired",
            CoreError::OAuthExchange(_) => "oauth_exchange_failed",
            CoreError::UnknownProvider(_) => "unknown_provider",
            CoreError::ConfigGenerationFailed(_) => "config_generation_failed",
            CoreError::ProcessSpawnError(_) => "process_spawn_error",
            CoreError::ExecutionTimeout { .. } => "execution_timeout",
            CoreError::ProcessCrashed { .. } => "process_crashed",
            CoreError::AccountsExhausted { .. } => "accounts_exhausted",
            CoreError::PermissionDenied(_) => "permission_denied",
            CoreError::NoEscalationTarget { .. } => "no_escalation_target",
            CoreError::CleanupFailure(_) => "cleanup_failure",
            CoreError::AgentNotFound(_) => "agent_not_found",
            CoreError::ExecutionNotFound(_) => "execution_not_found",
            CoreError::HierarchyCycle { .. } => "hierarchy_cycle",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::Config(_) => "config_error",
            CoreError::Storage(_) => "storage_error",
            CoreError::Io(_) => "io_error",
            CoreError::Serialization(_) => "serialization_error",
        }
    }

    /// Failures the supervisor may recover from by retrying or escalating.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::ExecutionTimeout { .. } | CoreError::ProcessCrashed { .. }
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
