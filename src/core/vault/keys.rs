use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use hmac::Mac;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::core::config::VaultConfig;
use crate::core::error::{CoreError, CoreResult};

type HmacSha256 = hmac::Hmac<Sha256>;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

/// Process-wide master secret. Never printed, never stored next to ciphertext.
#[derive(Clone)]
pub struct MasterSecret(Vec<u8>);

impl MasterSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Short fingerprint stored with each record so stale records can be
    /// found without trial decryption.
    pub fn key_id(&self) -> String {
        let digest = Sha256::digest(&self.0);
        hex::encode(&digest[..8])
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterSecret({})", self.key_id())
    }
}

/// Derive a machine-bound fallback secret from hostname + username so a
/// development setup works without `CONDUCTOR_MASTER_KEY`.
fn machine_secret() -> CoreResult<MasterSecret> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let username = whoami::username();
    let input = format!("{}{}", hostname, username);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"conductor-vault-v1")
        .map_err(|e| CoreError::Config(format!("vault key derivation: {}", e)))?;
    mac.update(input.as_bytes());
    Ok(MasterSecret::new(mac.finalize().into_bytes().to_vec()))
}

/// Sealed form of one credential: everything needed to decrypt except the key.
#[derive(Clone)]
pub struct Envelope {
    pub key_id: String,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

pub struct Opened {
    pub plaintext: Vec<u8>,
    /// Opened with a key other than the current one; re-encrypt on next write.
    pub stale: bool,
}

impl std::fmt::Debug for Opened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opened")
            .field("plaintext", &format_args!("<{} bytes>", self.plaintext.len()))
            .field("stale", &self.stale)
            .finish()
    }
}

#[derive(Clone)]
struct RetiringKey {
    secret: MasterSecret,
    retire_at: DateTime<Utc>,
}

/// Current key plus, during a rotation, the previous key until its overlap
/// window closes.
#[derive(Clone)]
pub struct KeyRing {
    current: MasterSecret,
    previous: Option<RetiringKey>,
    iterations: u32,
}

impl KeyRing {
    pub fn new(current: MasterSecret, iterations: u32) -> Self {
        Self {
            current,
            previous: None,
            iterations: iterations.max(1),
        }
    }

    pub fn with_previous(mut self, previous: MasterSecret, retire_at: DateTime<Utc>) -> Self {
        self.previous = Some(RetiringKey {
            secret: previous,
            retire_at,
        });
        self
    }

    /// Build from `CONDUCTOR_MASTER_KEY` / `CONDUCTOR_PREVIOUS_MASTER_KEY`.
    /// The previous key's deadline is only proposed here; the vault pins it
    /// to the first recorded one on `initialize`.
    pub fn from_env(cfg: &VaultConfig) -> CoreResult<Self> {
        let current = match std::env::var("CONDUCTOR_MASTER_KEY") {
            Ok(v) if !v.trim().is_empty() => MasterSecret::new(v.into_bytes()),
            _ => {
                warn!("CONDUCTOR_MASTER_KEY not set, using machine-bound vault key");
                machine_secret()?
            }
        };
        let mut ring = KeyRing::new(current, cfg.kdf_iterations);
        if let Ok(prev) = std::env::var("CONDUCTOR_PREVIOUS_MASTER_KEY")
            && !prev.trim().is_empty()
        {
            let retire_at = Utc::now() + overlap(cfg.rotation_overlap_secs);
            ring = ring.with_previous(MasterSecret::new(prev.into_bytes()), retire_at);
        }
        Ok(ring)
    }

    pub fn current_key_id(&self) -> String {
        self.current.key_id()
    }

    /// Id and deadline of the key being retired, if any.
    pub fn retiring(&self) -> Option<(String, DateTime<Utc>)> {
        self.previous
            .as_ref()
            .map(|p| (p.secret.key_id(), p.retire_at))
    }

    pub fn retire_previous_at(&mut self, retire_at: DateTime<Utc>) {
        if let Some(prev) = &mut self.previous {
            prev.retire_at = retire_at;
        }
    }

    /// Make `next` the current key; the old one keeps decrypting until
    /// `now + overlap`.
    pub fn rotate(&mut self, next: MasterSecret, overlap_window: chrono::Duration) {
        let old = std::mem::replace(&mut self.current, next);
        self.previous = Some(RetiringKey {
            secret: old,
            retire_at: Utc::now() + overlap_window,
        });
    }

    pub fn seal(&self, plaintext: &[u8]) -> CoreResult<Envelope> {
        let salt: [u8; SALT_LEN] = rand::random();
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let cipher = self.cipher_for(&self.current, &salt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CoreError::Config("credential encryption failed".to_string()))?;
        Ok(Envelope {
            key_id: self.current.key_id(),
            salt: salt.to_vec(),
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    /// Current key first, then the previous key while its window is open.
    pub fn open(&self, envelope: &Envelope, credential_id: &str) -> CoreResult<Opened> {
        if envelope.nonce.len() != NONCE_LEN || envelope.salt.len() != SALT_LEN {
            return Err(CoreError::DecryptionFailed {
                credential_id: credential_id.to_string(),
            });
        }

        let current_id = self.current.key_id();
        // Try the key the record names first; each attempt costs a derivation.
        let mut candidates = vec![&self.current];
        if let Some(prev) = self.previous.as_ref().filter(|p| Utc::now() < p.retire_at) {
            if envelope.key_id == prev.secret.key_id() {
                candidates.insert(0, &prev.secret);
            } else {
                candidates.push(&prev.secret);
            }
        }

        for secret in candidates {
            if let Some(plaintext) = self.try_open(secret, envelope) {
                return Ok(Opened {
                    plaintext,
                    stale: secret.key_id() != current_id || envelope.key_id != current_id,
                });
            }
        }

        Err(CoreError::DecryptionFailed {
            credential_id: credential_id.to_string(),
        })
    }

    fn try_open(&self, secret: &MasterSecret, envelope: &Envelope) -> Option<Vec<u8>> {
        let cipher = self.cipher_for(secret, &envelope.salt).ok()?;
        cipher
            .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_ref())
            .ok()
    }

    fn cipher_for(&self, secret: &MasterSecret, salt: &[u8]) -> CoreResult<Aes256Gcm> {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(&secret.0, salt, self.iterations, &mut key);
        Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CoreError::Config(format!("invalid derived key: {}", e)))
    }
}

pub fn overlap(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}
