//! OAuth authorization-code flow with a single shared callback.
//!
//! The `state` parameter is an opaque token carrying organization, agent,
//! provider, nonce and issue time, so one callback URL serves every agent.
//! The nonce row is deleted atomically on the first callback, which makes
//! each state single-use.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::config::{OAuthProviderConfig, OAuthSettings};
use crate::core::error::{CoreError, CoreResult};
use crate::core::vault::{CredentialPayload, CredentialVault, NewCredential};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthState {
    pub nonce: String,
    pub organization_id: String,
    pub agent_id: String,
    pub provider: String,
    pub issued_at: DateTime<Utc>,
}

impl OAuthState {
    pub fn encode(&self) -> CoreResult<String> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    /// Any malformed token is reported the same way as an expired one.
    pub fn decode(token: &str) -> CoreResult<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| CoreError::OAuthStateExpired)?;
        serde_json::from_slice(&bytes).map_err(|_| CoreError::OAuthStateExpired)
    }
}

pub fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Tokens returned by a provider's token endpoint.
#[derive(Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(
        &self,
        provider: &OAuthProviderConfig,
        code: &str,
        redirect_uri: &str,
    ) -> CoreResult<TokenSet>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Posts the authorization-code grant to the provider's token endpoint.
pub struct HttpTokenExchanger {
    client: reqwest::Client,
}

impl HttpTokenExchanger {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(
        &self,
        provider: &OAuthProviderConfig,
        code: &str,
        redirect_uri: &str,
    ) -> CoreResult<TokenSet> {
        let params = [
            ("code", code),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ];

        let response = self
            .client
            .post(&provider.token_url)
            .header("accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| CoreError::OAuthExchange(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::OAuthExchange(format!("failed to read response: {}", e)))?;

        // The body may contain tokens, so it is never echoed into errors.
        if !status.is_success() {
            return Err(CoreError::OAuthExchange(format!(
                "token endpoint returned HTTP {}",
                status
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|_| CoreError::OAuthExchange("unparseable token response".to_string()))?;

        if let Some(error) = token.error {
            return Err(CoreError::OAuthExchange(format!(
                "{} - {}",
                error,
                token.error_description.unwrap_or_default()
            )));
        }

        let access_token = token
            .access_token
            .ok_or_else(|| CoreError::OAuthExchange("no access_token in response".to_string()))?;

        Ok(TokenSet {
            access_token,
            refresh_token: token.refresh_token,
            token_type: token.token_type,
            expires_in: token.expires_in,
            scopes: token
                .scope
                .map(|s| s.split([' ', ',']).filter(|p| !p.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }
}

pub struct OAuthFlow {
    db: Arc<Mutex<Connection>>,
    vault: Arc<CredentialVault>,
    settings: OAuthSettings,
    exchanger: Arc<dyn TokenExchanger>,
}

impl OAuthFlow {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        vault: Arc<CredentialVault>,
        settings: OAuthSettings,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Self {
        Self {
            db,
            vault,
            settings,
            exchanger,
        }
    }

    pub async fn initialize(&self) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS oauth_states (
                nonce TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                issued_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn provider(&self, provider: &str) -> CoreResult<&OAuthProviderConfig> {
        self.settings
            .providers
            .get(provider)
            .ok_or_else(|| CoreError::UnknownProvider(provider.to_string()))
    }

    fn ttl(&self) -> chrono::Duration {
        crate::core::vault::overlap(self.settings.state_ttl_secs)
    }

    /// Issue a fresh state and return the provider's authorize URL.
    pub async fn begin(
        &self,
        organization_id: &str,
        agent_id: &str,
        provider: &str,
    ) -> CoreResult<String> {
        let config = self.provider(provider)?;
        let state = OAuthState {
            nonce: generate_nonce(),
            organization_id: organization_id.to_string(),
            agent_id: agent_id.to_string(),
            provider: provider.to_string(),
            issued_at: Utc::now(),
        };

        {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO oauth_states (nonce, organization_id, agent_id, provider, issued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    state.nonce,
                    state.organization_id,
                    state.agent_id,
                    state.provider,
                    timestamp(state.issued_at),
                ],
            )?;
        }

        let url = build_auth_url(config, &self.settings.redirect_uri, &state.encode()?)?;
        info!(
            "Started OAuth flow for agent [{}] provider [{}]",
            agent_id, provider
        );
        Ok(url)
    }

    /// Consume the state, exchange the code server-side and store the tokens.
    /// Returns the id of the access-token credential.
    pub async fn complete(&self, state_token: &str, code: &str) -> CoreResult<String> {
        let claimed = OAuthState::decode(state_token)?;

        let stored = {
            let db = self.db.lock().await;
            db.query_row(
                "DELETE FROM oauth_states WHERE nonce = ?1
                 RETURNING organization_id, agent_id, provider, issued_at",
                params![claimed.nonce],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((organization_id, agent_id, provider, issued_at)) = stored else {
            return Err(CoreError::OAuthStateExpired);
        };
        let issued_at = DateTime::parse_from_rfc3339(&issued_at)
            .map_err(|_| CoreError::OAuthStateExpired)?
            .with_timezone(&Utc);
        let stored = OAuthState {
            nonce: claimed.nonce.clone(),
            organization_id,
            agent_id,
            provider,
            issued_at,
        };

        if stored.organization_id != claimed.organization_id
            || stored.agent_id != claimed.agent_id
            || stored.provider != claimed.provider
        {
            warn!("OAuth callback state did not match the issued record, rejecting");
            return Err(CoreError::OAuthStateExpired);
        }
        if Utc::now() >= stored.issued_at + self.ttl() {
            return Err(CoreError::OAuthStateExpired);
        }

        let config = self.provider(&stored.provider)?;
        let tokens = self
            .exchanger
            .exchange(config, code, &self.settings.redirect_uri)
            .await?;
        let expires_at = tokens.expires_in.and_then(|secs| {
            let expiry = expiry_after(secs);
            if expiry.is_none() {
                warn!(
                    "Provider [{}] returned unusable expires_in {}, storing token without expiry",
                    stored.provider, secs
                );
            }
            expiry
        });

        let refresh_id = match tokens.refresh_token.clone() {
            Some(refresh_token) => Some(
                self.vault
                    .store(
                        &stored.agent_id,
                        &stored.provider,
                        NewCredential {
                            payload: CredentialPayload::RefreshToken { refresh_token },
                            scopes: tokens.scopes.clone(),
                            expires_at: None,
                            refresh_credential_id: None,
                        },
                    )
                    .await?,
            ),
            None => None,
        };

        let credential_id = self
            .vault
            .store(
                &stored.agent_id,
                &stored.provider,
                NewCredential {
                    payload: CredentialPayload::OauthTokens {
                        access_token: tokens.access_token,
                        token_type: tokens.token_type,
                    },
                    scopes: if tokens.scopes.is_empty() {
                        config.scopes.clone()
                    } else {
                        tokens.scopes
                    },
                    expires_at,
                    refresh_credential_id: refresh_id,
                },
            )
            .await?;

        info!(
            "Completed OAuth flow for agent [{}] provider [{}]",
            stored.agent_id, stored.provider
        );
        Ok(credential_id)
    }

    /// Drop states whose TTL has passed. Returns how many were removed.
    pub async fn purge_expired(&self) -> CoreResult<usize> {
        let cutoff = timestamp(Utc::now() - self.ttl());
        let db = self.db.lock().await;
        let removed = db.execute(
            "DELETE FROM oauth_states WHERE issued_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }
}

/// `None` when the provider's lifetime does not fit a timestamp.
fn expiry_after(secs: i64) -> Option<DateTime<Utc>> {
    chrono::Duration::try_seconds(secs).and_then(|d| Utc::now().checked_add_signed(d))
}

/// Fixed-width so stored timestamps compare lexically.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn build_auth_url(
    config: &OAuthProviderConfig,
    redirect_uri: &str,
    state: &str,
) -> CoreResult<String> {
    let mut url = url::Url::parse(&config.auth_url)
        .map_err(|e| CoreError::Config(format!("invalid auth_url: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", &config.scopes.join(&config.scope_separator))
        .append_pair("state", state)
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    Ok(url.to_string())
}
