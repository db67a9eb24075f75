use serde::{Deserialize, Serialize};

/// Provider-specific secret shapes. All of them share the same encrypted
/// envelope; only the plaintext JSON differs.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialPayload {
    ApiKey {
        key: String,
    },
    OauthTokens {
        access_token: String,
        #[serde(default)]
        token_type: Option<String>,
    },
    /// Kept as its own record and linked from the access token.
    RefreshToken {
        refresh_token: String,
    },
    BasicAuth {
        username: String,
        password: String,
    },
}

impl CredentialPayload {
    pub fn api_key(key: impl Into<String>) -> Self {
        CredentialPayload::ApiKey { key: key.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CredentialPayload::ApiKey { .. } => "api_key",
            CredentialPayload::OauthTokens { .. } => "oauth_tokens",
            CredentialPayload::RefreshToken { .. } => "refresh_token",
            CredentialPayload::BasicAuth { .. } => "basic_auth",
        }
    }

    /// Environment entries scoped to `provider`, e.g. `GITHUB_ACCESS_TOKEN`.
    /// Refresh tokens stay inside the vault.
    pub fn env_entries(&self, provider: &str) -> Vec<(String, String)> {
        let prefix = env_prefix(provider);
        match self {
            CredentialPayload::ApiKey { key } => vec![(format!("{}_API_KEY", prefix), key.clone())],
            CredentialPayload::OauthTokens { access_token, .. } => {
                vec![(format!("{}_ACCESS_TOKEN", prefix), access_token.clone())]
            }
            CredentialPayload::RefreshToken { .. } => Vec::new(),
            CredentialPayload::BasicAuth { username, password } => vec![
                (format!("{}_USERNAME", prefix), username.clone()),
                (format!("{}_PASSWORD", prefix), password.clone()),
            ],
        }
    }

    /// Values that must never appear in logs or stream output.
    pub fn secret_values(&self) -> Vec<&str> {
        match self {
            CredentialPayload::ApiKey { key } => vec![key.as_str()],
            CredentialPayload::OauthTokens { access_token, .. } => vec![access_token.as_str()],
            CredentialPayload::RefreshToken { refresh_token } => vec![refresh_token.as_str()],
            CredentialPayload::BasicAuth { password, .. } => vec![password.as_str()],
        }
    }
}

impl std::fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialPayload::{}(<redacted>)", self.kind())
    }
}

/// `my-provider.io` -> `MY_PROVIDER_IO`
pub fn env_prefix(provider: &str) -> String {
    provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
