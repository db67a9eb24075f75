mod keys;
mod payload;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::core::error::{CoreError, CoreResult};

pub use keys::{Envelope, KeyRing, MasterSecret, overlap};
pub use payload::CredentialPayload;

/// Input for `store`.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub payload: CredentialPayload,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_credential_id: Option<String>,
}

impl NewCredential {
    pub fn new(payload: CredentialPayload) -> Self {
        Self {
            payload,
            scopes: Vec::new(),
            expires_at: None,
            refresh_credential_id: None,
        }
    }
}

/// Everything about a credential except its plaintext.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialMeta {
    pub id: String,
    pub agent_id: String,
    pub provider: String,
    pub kind: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_credential_id: Option<String>,
    pub revoked: bool,
    pub key_id: String,
}

impl CredentialMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub meta: CredentialMeta,
    pub payload: CredentialPayload,
}

struct StoredRow {
    meta: CredentialMeta,
    envelope: Envelope,
}

/// Encrypted per-agent credential storage.
///
/// Plaintext only exists inside this type's methods and in the values they
/// return; rows hold ciphertext, per-record salt and nonce, and the id of the
/// key that sealed them.
pub struct CredentialVault {
    db: Arc<Mutex<Connection>>,
    keys: RwLock<Arc<KeyRing>>,
}

const SELECT_COLUMNS: &str = "id, agent_id, provider, kind, scopes, expires_at, refresh_credential_id, revoked, key_id, salt, nonce, ciphertext";

impl CredentialVault {
    pub fn new(db: Arc<Mutex<Connection>>, keys: KeyRing) -> Self {
        Self {
            db,
            keys: RwLock::new(Arc::new(keys)),
        }
    }

    pub async fn initialize(&self) -> CoreResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                kind TEXT NOT NULL,
                scopes TEXT NOT NULL DEFAULT '[]',
                expires_at TEXT,
                refresh_credential_id TEXT,
                revoked INTEGER NOT NULL DEFAULT 0,
                key_id TEXT NOT NULL,
                salt BLOB NOT NULL,
                nonce BLOB NOT NULL,
                ciphertext BLOB NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_credentials_agent ON credentials(agent_id)",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS vault_retiring_keys (
                key_id TEXT PRIMARY KEY,
                retire_at TEXT NOT NULL
            )",
            [],
        )?;
        drop(db);
        self.pin_retirement().await
    }

    /// The first deadline recorded for a retiring key wins, so restarting
    /// with the same previous key does not reopen its overlap window.
    async fn pin_retirement(&self) -> CoreResult<()> {
        let mut keys = self.keys.write().await;
        let Some((key_id, proposed)) = keys.retiring() else {
            return Ok(());
        };
        let stored: String = {
            let db = self.db.lock().await;
            db.execute(
                "INSERT OR IGNORE INTO vault_retiring_keys (key_id, retire_at) VALUES (?1, ?2)",
                params![key_id, proposed.to_rfc3339()],
            )?;
            db.query_row(
                "SELECT retire_at FROM vault_retiring_keys WHERE key_id = ?1",
                params![key_id],
                |row| row.get(0),
            )?
        };
        let retire_at = DateTime::parse_from_rfc3339(&stored)
            .map_err(|e| {
                CoreError::Config(format!("retirement deadline of vault key {}: {}", key_id, e))
            })?
            .with_timezone(&Utc);
        if retire_at != proposed {
            let mut ring = KeyRing::clone(&keys);
            ring.retire_previous_at(retire_at);
            *keys = Arc::new(ring);
        }
        if retire_at <= Utc::now() {
            warn!("Previous vault key {} retired at {}", key_id, retire_at.to_rfc3339());
        } else {
            info!("Previous vault key {} retires at {}", key_id, retire_at.to_rfc3339());
        }
        Ok(())
    }

    pub async fn store(
        &self,
        agent_id: &str,
        provider: &str,
        credential: NewCredential,
    ) -> CoreResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let envelope = self.seal(&credential.payload).await?;
        let scopes = serde_json::to_string(&credential.scopes)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO credentials
                (id, agent_id, provider, kind, scopes, expires_at, refresh_credential_id, key_id, salt, nonce, ciphertext)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                agent_id,
                provider,
                credential.payload.kind(),
                scopes,
                credential.expires_at.map(|t| t.to_rfc3339()),
                credential.refresh_credential_id,
                envelope.key_id,
                envelope.salt,
                envelope.nonce,
                envelope.ciphertext,
            ],
        )?;
        info!(
            "Stored {} credential [{}] for agent [{}] provider [{}]",
            credential.payload.kind(),
            id,
            agent_id,
            provider
        );
        Ok(id)
    }

    /// Decrypt an active credential. Revoked credentials read as not found.
    pub async fn get(&self, credential_id: &str) -> CoreResult<CredentialPayload> {
        Ok(self.resolve(credential_id).await?.payload)
    }

    pub async fn resolve(&self, credential_id: &str) -> CoreResult<ResolvedCredential> {
        let row = self
            .load_row(credential_id)
            .await?
            .filter(|r| !r.meta.revoked)
            .ok_or_else(|| CoreError::CredentialNotFound(credential_id.to_string()))?;
        self.open_row(row).await
    }

    /// Replace the ciphertext in place, e.g. after a token refresh.
    pub async fn rotate(&self, credential_id: &str, credential: NewCredential) -> CoreResult<()> {
        let envelope = self.seal(&credential.payload).await?;
        let scopes = serde_json::to_string(&credential.scopes)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE credentials
             SET kind = ?1, scopes = ?2, expires_at = ?3, refresh_credential_id = COALESCE(?4, refresh_credential_id),
                 key_id = ?5, salt = ?6, nonce = ?7, ciphertext = ?8, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?9 AND revoked = 0",
            params![
                credential.payload.kind(),
                scopes,
                credential.expires_at.map(|t| t.to_rfc3339()),
                credential.refresh_credential_id,
                envelope.key_id,
                envelope.salt,
                envelope.nonce,
                envelope.ciphertext,
                credential_id,
            ],
        )?;
        if rows == 0 {
            return Err(CoreError::CredentialNotFound(credential_id.to_string()));
        }
        info!("Rotated credential [{}]", credential_id);
        Ok(())
    }

    /// Disable without deleting so the audit trail survives.
    pub async fn revoke(&self, credential_id: &str) -> CoreResult<()> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE credentials SET revoked = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
            params![credential_id],
        )?;
        if rows == 0 {
            return Err(CoreError::CredentialNotFound(credential_id.to_string()));
        }
        info!("Revoked credential [{}]", credential_id);
        Ok(())
    }

    pub async fn list_for_agent(&self, agent_id: &str) -> CoreResult<Vec<CredentialMeta>> {
        Ok(self
            .load_rows_for_agent(agent_id)
            .await?
            .into_iter()
            .map(|r| r.meta)
            .collect())
    }

    /// Non-revoked, non-expired credentials for the given providers,
    /// decrypted, for one execution. Other providers are never decrypted.
    pub async fn active_for_agent(
        &self,
        agent_id: &str,
        providers: &[String],
    ) -> CoreResult<Vec<ResolvedCredential>> {
        let now = Utc::now();
        let mut out = Vec::new();
        for row in self.load_rows_for_agent(agent_id).await? {
            if row.meta.revoked
                || row.meta.is_expired(now)
                || !providers.iter().any(|p| p == &row.meta.provider)
            {
                continue;
            }
            out.push(self.open_row(row).await?);
        }
        Ok(out)
    }

    /// Rotate the master key. Records sealed with the old key keep
    /// decrypting until the overlap window closes; the deadline is recorded
    /// so a restart with the old key as previous key keeps it.
    pub async fn rotate_master_key(
        &self,
        next: MasterSecret,
        overlap_window: chrono::Duration,
    ) -> CoreResult<()> {
        let mut keys = self.keys.write().await;
        let mut ring = KeyRing::clone(&keys);
        ring.rotate(next, overlap_window);
        if let Some((key_id, retire_at)) = ring.retiring() {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO vault_retiring_keys (key_id, retire_at) VALUES (?1, ?2)
                 ON CONFLICT(key_id) DO UPDATE SET retire_at = excluded.retire_at",
                params![key_id, retire_at.to_rfc3339()],
            )?;
        }
        info!("Vault master key rotated, new key id {}", ring.current_key_id());
        *keys = Arc::new(ring);
        Ok(())
    }

    /// Batch job: re-seal every record not yet under the current key.
    /// Returns how many records were re-encrypted.
    pub async fn reencrypt_all(&self) -> CoreResult<usize> {
        let current = self.keys.read().await.current_key_id();
        let stale_ids: Vec<String> = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare("SELECT id FROM credentials WHERE key_id != ?1")?;
            let rows = stmt.query_map(params![current], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut count = 0;
        for id in stale_ids {
            let Some(row) = self.load_row(&id).await? else {
                continue;
            };
            match self.open_row(row).await {
                Ok(_) => count += 1,
                Err(e) => error!("Batch re-encryption skipped credential [{}]: {}", id, e),
            }
        }
        if count > 0 {
            info!("Re-encrypted {} credentials under key {}", count, current);
        }
        Ok(count)
    }

    /// Key derivation is CPU-bound; run it on the blocking pool against a
    /// snapshot of the ring.
    async fn with_ring<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&KeyRing) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let ring = self.keys.read().await.clone();
        tokio::task::spawn_blocking(move || work(ring.as_ref()))
            .await
            .map_err(|e| CoreError::Io(e.into()))?
    }

    async fn seal(&self, payload: &CredentialPayload) -> CoreResult<Envelope> {
        let plaintext = serde_json::to_vec(payload)?;
        self.with_ring(move |ring| ring.seal(&plaintext)).await
    }

    /// Decrypt a row; stale rows are lazily re-sealed under the current key.
    async fn open_row(&self, row: StoredRow) -> CoreResult<ResolvedCredential> {
        let envelope = row.envelope.clone();
        let credential_id = row.meta.id.clone();
        let opened = self
            .with_ring(move |ring| {
                let opened = ring.open(&envelope, &credential_id)?;
                let fresh = if opened.stale {
                    Some(ring.seal(&opened.plaintext)?)
                } else {
                    None
                };
                Ok((opened, fresh))
            })
            .await;
        let (opened, fresh) = match opened {
            Ok(o) => o,
            Err(e) => {
                error!(
                    "Credential [{}] could not be decrypted with any vault key",
                    row.meta.id
                );
                return Err(e);
            }
        };
        let payload: CredentialPayload = serde_json::from_slice(&opened.plaintext).map_err(|_| {
            CoreError::DecryptionFailed {
                credential_id: row.meta.id.clone(),
            }
        })?;

        let mut meta = row.meta;
        if let Some(fresh) = fresh {
            let db = self.db.lock().await;
            // Only replace the exact ciphertext we opened; a concurrent
            // rotate() must not be overwritten with older plaintext.
            let updated = db.execute(
                "UPDATE credentials SET key_id = ?1, salt = ?2, nonce = ?3, ciphertext = ?4, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?5 AND ciphertext = ?6",
                params![
                    fresh.key_id,
                    fresh.salt,
                    fresh.nonce,
                    fresh.ciphertext,
                    meta.id,
                    row.envelope.ciphertext,
                ],
            )?;
            if updated > 0 {
                meta.key_id = fresh.key_id;
            } else {
                warn!(
                    "Credential [{}] changed during lazy re-encryption, keeping newer value",
                    meta.id
                );
            }
        }

        Ok(ResolvedCredential { meta, payload })
    }

    async fn load_row(&self, credential_id: &str) -> CoreResult<Option<StoredRow>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM credentials WHERE id = ?1", SELECT_COLUMNS);
        let row = db
            .query_row(&sql, params![credential_id], map_row)
            .optional()?;
        Ok(row)
    }

    async fn load_rows_for_agent(&self, agent_id: &str) -> CoreResult<Vec<StoredRow>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM credentials WHERE agent_id = ?1 ORDER BY created_at ASC, id ASC",
            SELECT_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![agent_id], map_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    let scopes: String = row.get(4)?;
    let expires_at: Option<String> = row.get(5)?;
    Ok(StoredRow {
        meta: CredentialMeta {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            provider: row.get(2)?,
            kind: row.get(3)?,
            scopes: serde_json::from_str(&scopes).unwrap_or_default(),
            expires_at: expires_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            refresh_credential_id: row.get(6)?,
            revoked: row.get(7)?,
            key_id: row.get(8)?,
        },
        envelope: Envelope {
            key_id: row.get(8)?,
            salt: row.get(9)?,
            nonce: row.get(10)?,
            ciphertext: row.get(11)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(secret: &str) -> KeyRing {
        KeyRing::new(MasterSecret::new(secret.as_bytes().to_vec()), 1_000)
    }

    fn providers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    async fn test_vault() -> CredentialVault {
        let db = Connection::open_in_memory().expect("in-memory db");
        let vault = CredentialVault::new(Arc::new(Mutex::new(db)), ring("master-a"));
        vault.initialize().await.expect("init vault tables");
        vault
    }

    #[tokio::test]
    async fn store_and_get_roundtrip() {
        let vault = test_vault().await;
        let id = vault
            .store(
                "agent-1",
                "github",
                NewCredential::new(CredentialPayload::api_key("tok_abc123")),
            )
            .await
            .unwrap();
        match vault.get(&id).await.unwrap() {
            CredentialPayload::ApiKey { key } => assert_eq!(key, "tok_abc123"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn plaintext_is_not_persisted() {
        let vault = test_vault().await;
        vault
            .store(
                "agent-1",
                "github",
                NewCredential::new(CredentialPayload::api_key("tok_abc123")),
            )
            .await
            .unwrap();
        let db = vault.db.lock().await;
        let blob: Vec<u8> = db
            .query_row("SELECT ciphertext FROM credentials", [], |r| r.get(0))
            .unwrap();
        let needle = b"tok_abc123";
        assert!(!blob.windows(needle.len()).any(|w| w == needle));
    }

    #[tokio::test]
    async fn missing_credential_is_not_found() {
        let vault = test_vault().await;
        let err = vault.get("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::CredentialNotFound(_)));
    }

    #[tokio::test]
    async fn pre_rotation_credential_decrypts_via_fallback_and_is_resealed() {
        let vault = test_vault().await;
        let id = vault
            .store(
                "agent-1",
                "github",
                NewCredential::new(CredentialPayload::api_key("tok_abc123")),
            )
            .await
            .unwrap();
        let old_key = vault.list_for_agent("agent-1").await.unwrap()[0]
            .key_id
            .clone();

        vault
            .rotate_master_key(
                MasterSecret::new(b"master-b".to_vec()),
                chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        assert_eq!(
            vault.get(&id).await.unwrap(),
            CredentialPayload::api_key("tok_abc123")
        );
        let meta = &vault.list_for_agent("agent-1").await.unwrap()[0];
        assert_ne!(meta.key_id, old_key, "lazy re-encryption should move the record");
        assert_eq!(meta.key_id, MasterSecret::new(b"master-b".to_vec()).key_id());
    }

    #[tokio::test]
    async fn batch_reencryption_moves_every_stale_record() {
        let vault = test_vault().await;
        for i in 0..3 {
            vault
                .store(
                    "agent-1",
                    "p",
                    NewCredential::new(CredentialPayload::api_key(format!("k{}", i))),
                )
                .await
                .unwrap();
        }
        vault
            .rotate_master_key(
                MasterSecret::new(b"master-b".to_vec()),
                chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(vault.reencrypt_all().await.unwrap(), 3);
        assert_eq!(vault.reencrypt_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_key_is_decryption_failed() {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let writer = CredentialVault::new(db.clone(), ring("master-a"));
        writer.initialize().await.unwrap();
        let id = writer
            .store(
                "agent-1",
                "p",
                NewCredential::new(CredentialPayload::api_key("secret")),
            )
            .await
            .unwrap();

        let reader = CredentialVault::new(db, ring("master-z"));
        let err = reader.get(&id).await.unwrap_err();
        assert!(matches!(err, CoreError::DecryptionFailed { .. }));
        assert!(!err.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn rotate_replaces_value_in_place() {
        let vault = test_vault().await;
        let id = vault
            .store(
                "agent-1",
                "p",
                NewCredential::new(CredentialPayload::api_key("v1")),
            )
            .await
            .unwrap();
        vault
            .rotate(&id, NewCredential::new(CredentialPayload::api_key("v2")))
            .await
            .unwrap();
        assert_eq!(vault.get(&id).await.unwrap(), CredentialPayload::api_key("v2"));
        assert_eq!(vault.list_for_agent("agent-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn revoked_credentials_stay_for_audit_but_cannot_be_read() {
        let vault = test_vault().await;
        let id = vault
            .store(
                "agent-1",
                "p",
                NewCredential::new(CredentialPayload::api_key("v1")),
            )
            .await
            .unwrap();
        vault.revoke(&id).await.unwrap();
        assert!(matches!(
            vault.get(&id).await.unwrap_err(),
            CoreError::CredentialNotFound(_)
        ));
        let listed = vault.list_for_agent("agent-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].revoked);
        let active = vault
            .active_for_agent("agent-1", &providers(&["p"]))
            .await
            .unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn expired_credentials_are_not_active() {
        let vault = test_vault().await;
        let mut expired = NewCredential::new(CredentialPayload::api_key("old"));
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        vault.store("agent-1", "p", expired).await.unwrap();
        vault
            .store(
                "agent-1",
                "q",
                NewCredential::new(CredentialPayload::api_key("fresh")),
            )
            .await
            .unwrap();
        let active = vault
            .active_for_agent("agent-1", &providers(&["p", "q"]))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].meta.provider, "q");
    }

    #[tokio::test]
    async fn unlisted_providers_are_never_decrypted() {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let foreign = CredentialVault::new(db.clone(), ring("master-z"));
        foreign.initialize().await.unwrap();
        foreign
            .store(
                "agent-1",
                "slack",
                NewCredential::new(CredentialPayload::api_key("xoxb")),
            )
            .await
            .unwrap();

        let vault = CredentialVault::new(db, ring("master-a"));
        vault.initialize().await.unwrap();
        vault
            .store(
                "agent-1",
                "github",
                NewCredential::new(CredentialPayload::api_key("ghp")),
            )
            .await
            .unwrap();

        let active = vault
            .active_for_agent("agent-1", &providers(&["github"]))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].meta.provider, "github");
        assert!(matches!(
            vault
                .active_for_agent("agent-1", &providers(&["github", "slack"]))
                .await,
            Err(CoreError::DecryptionFailed { .. })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn key_derivation_does_not_stall_other_tasks() {
        let db = Connection::open_in_memory().unwrap();
        let vault = CredentialVault::new(
            Arc::new(Mutex::new(db)),
            KeyRing::new(MasterSecret::new(b"master-a".to_vec()), 200_000),
        );
        vault.initialize().await.unwrap();

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
        });
        vault
            .store(
                "agent-1",
                "p",
                NewCredential::new(CredentialPayload::api_key("v1")),
            )
            .await
            .unwrap();
        ticker.abort();
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn retirement_deadline_survives_a_restart() {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let old = MasterSecret::new(b"master-a".to_vec());
        let writer = CredentialVault::new(db.clone(), KeyRing::new(old.clone(), 1_000));
        writer.initialize().await.unwrap();
        let id = writer
            .store(
                "agent-1",
                "p",
                NewCredential::new(CredentialPayload::api_key("v1")),
            )
            .await
            .unwrap();

        // First start after the rotation: the window has since closed.
        let first = CredentialVault::new(
            db.clone(),
            ring("master-b").with_previous(old.clone(), Utc::now() - chrono::Duration::seconds(1)),
        );
        first.initialize().await.unwrap();

        // A later restart proposes a fresh window; the recorded one wins.
        let restarted = CredentialVault::new(
            db,
            ring("master-b").with_previous(old.clone(), Utc::now() + chrono::Duration::hours(1)),
        );
        restarted.initialize().await.unwrap();
        let (key_id, retire_at) = restarted.keys.read().await.retiring().unwrap();
        assert_eq!(key_id, old.key_id());
        assert!(retire_at <= Utc::now());
        assert!(matches!(
            restarted.get(&id).await,
            Err(CoreError::DecryptionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn explicit_rotation_records_the_deadline() {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let vault = CredentialVault::new(db.clone(), ring("master-a"));
        vault.initialize().await.unwrap();
        vault
            .rotate_master_key(
                MasterSecret::new(b"master-b".to_vec()),
                chrono::Duration::seconds(0),
            )
            .await
            .unwrap();

        let restarted = CredentialVault::new(
            db,
            ring("master-b").with_previous(
                MasterSecret::new(b"master-a".to_vec()),
                Utc::now() + chrono::Duration::hours(1),
            ),
        );
        restarted.initialize().await.unwrap();
        let (_, retire_at) = restarted.keys.read().await.retiring().unwrap();
        assert!(retire_at <= Utc::now());
    }
}
