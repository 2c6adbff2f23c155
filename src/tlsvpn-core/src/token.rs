//! Single-use enrollment tokens.
//!
//! A token is simultaneously the proof of entitlement for one certificate
//! enrollment and the AES-256-GCM key that encrypts that exchange. Each
//! token lives in its own JSON file (`<id>.json`, mode 0600) in the token
//! directory; the in-memory index is rebuilt from those files at startup.
//!
//! `validate_and_consume` is the only operation that may race with itself:
//! the whole read-decide-persist sequence runs under one exclusive lock, so
//! exactly one of N concurrent callers for the same id succeeds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tlsvpn_crypto::rng;

/// Key length: AES-256.
pub const TOKEN_KEY_LEN: usize = 32;

/// One enrollment token. The key is serialized as lowercase hex under
/// `key_hex`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    #[serde(rename = "key_hex", with = "hex_key")]
    pub key: Vec<u8>,
    pub client_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
}

impl Token {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// `valid`, `used` or `expired` as rendered by `token/list`.
    pub fn status(&self) -> &'static str {
        if self.used {
            "used"
        } else if self.is_expired() {
            "expired"
        } else {
            "valid"
        }
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Durable single-use token records with an in-memory index.
pub struct TokenStore {
    dir: PathBuf,
    tokens: Mutex<HashMap<String, Token>>,
}

impl TokenStore {
    /// Open a store rooted at `dir`, reconstituting the index from the
    /// per-token files already there. Records without a key are corrupted
    /// and skipped with a warning.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let store = Self {
            dir,
            tokens: Mutex::new(HashMap::new()),
        };
        store.load_from_directory()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_from_directory(&self) -> Result<()> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            // Missing directory is not an error; it appears on first generate.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading token dir {}", self.dir.display()))
            }
        };

        let mut loaded = 0usize;
        let mut tokens = self.tokens.lock().expect("token index poisoned");
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let data = match std::fs::read_to_string(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(file = %path.display(), %e, "unreadable token file, skipping");
                    continue;
                }
            };
            let token: Token = match serde_json::from_str(&data) {
                Ok(token) => token,
                Err(e) => {
                    warn!(file = %path.display(), %e, "corrupt token file, skipping");
                    continue;
                }
            };
            if token.key.len() != TOKEN_KEY_LEN {
                warn!(file = %path.display(), "token record has no usable key, skipping");
                continue;
            }
            tokens.insert(token.id.clone(), token);
            loaded += 1;
        }
        drop(tokens);

        if loaded > 0 {
            info!(count = loaded, dir = %self.dir.display(), "loaded enrollment tokens");
        }
        Ok(())
    }

    /// Create a token for `client_name` valid for `ttl`, persist it and
    /// return it (key included). The key is surfaced to the operator exactly
    /// once through this return value.
    pub fn generate(&self, client_name: &str, ttl: Duration) -> Result<Token> {
        if client_name.is_empty() {
            bail!("client name must not be empty");
        }

        let key: [u8; TOKEN_KEY_LEN] = rng::random_bytes();
        let now = Utc::now();
        let token = Token {
            id: format!("{client_name}-{}", now.format("%Y%m%d-%H%M%S")),
            key: key.to_vec(),
            client_name: client_name.to_string(),
            created_at: now,
            expires_at: now + ttl,
            used: false,
            used_at: None,
            used_by: None,
        };

        let mut tokens = self.tokens.lock().expect("token index poisoned");
        self.persist(&token)?;
        tokens.insert(token.id.clone(), token.clone());
        Ok(token)
    }

    /// Atomically consume a token. Fails when the token is absent, already
    /// used or expired; otherwise marks it used, persists the transition and
    /// only then returns the token (key included).
    pub fn validate_and_consume(&self, id: &str, caller: &str) -> Result<Token> {
        let mut tokens = self.tokens.lock().expect("token index poisoned");

        let token = match tokens.get_mut(id) {
            Some(token) => token,
            None => bail!("token not found: {id}"),
        };

        if token.used {
            let when = token
                .used_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown".into());
            let who = token.used_by.clone().unwrap_or_else(|| "unknown".into());
            bail!("token already used (at {when}, by {who})");
        }
        if token.is_expired() {
            bail!("token expired at {}", token.expires_at.to_rfc3339());
        }

        token.used = true;
        token.used_at = Some(Utc::now());
        token.used_by = Some(caller.to_string());

        let consumed = token.clone();
        // The durable write completes before the caller sees the token.
        self.persist(&consumed)?;
        info!(id = %consumed.id, client = %consumed.client_name, %caller, "token consumed");
        Ok(consumed)
    }

    /// All tokens, newest first.
    pub fn list(&self) -> Vec<Token> {
        let tokens = self.tokens.lock().expect("token index poisoned");
        let mut list: Vec<Token> = tokens.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Delete a token and its file.
    pub fn revoke(&self, id: &str) -> Result<()> {
        let mut tokens = self.tokens.lock().expect("token index poisoned");
        if tokens.remove(id).is_none() {
            bail!("token not found: {id}");
        }
        let path = self.token_path(id);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing token file {}", path.display()))?;
        }
        Ok(())
    }

    /// Remove every used or expired token; returns how many were removed.
    pub fn cleanup_expired_or_used(&self) -> usize {
        let mut tokens = self.tokens.lock().expect("token index poisoned");
        let stale: Vec<String> = tokens
            .values()
            .filter(|t| t.used || t.is_expired())
            .map(|t| t.id.clone())
            .collect();

        let mut removed = 0usize;
        for id in stale {
            tokens.remove(&id);
            let path = self.token_path(&id);
            if !path.exists() || std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.tokens.lock().expect("token index poisoned").len()
    }

    pub fn token_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn persist(&self, token: &Token) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))?;
        }

        let path = self.token_path(&token.id);
        let data = serde_json::to_string_pretty(token).context("serializing token")?;
        std::fs::write(&path, data)
            .with_context(|| format!("writing token file {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn generate_persists_and_shapes_id() {
        let dir = tempdir().unwrap();
        let store = TokenStore::open(dir.path()).unwrap();

        let token = store.generate("alice", Duration::hours(24)).unwrap();
        assert!(token.id.starts_with("alice-"));
        assert_eq!(token.key.len(), TOKEN_KEY_LEN);
        assert!(store.token_path(&token.id).exists());

        let on_disk = std::fs::read_to_string(store.token_path(&token.id)).unwrap();
        assert!(on_disk.contains(&hex::encode(&token.key)));
    }

    #[test]
    #[cfg(unix)]
    fn token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("tokens")).unwrap();
        let token = store.generate("bob", Duration::hours(1)).unwrap();

        let mode = std::fs::metadata(store.token_path(&token.id))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn consume_is_single_use() {
        let dir = tempdir().unwrap();
        let store = TokenStore::open(dir.path()).unwrap();
        let token = store.generate("carol", Duration::hours(1)).unwrap();

        let consumed = store.validate_and_consume(&token.id, "192.0.2.1").unwrap();
        assert_eq!(consumed.key, token.key);
        assert!(consumed.used);
        assert_eq!(consumed.used_by.as_deref(), Some("192.0.2.1"));

        let err = store
            .validate_and_consume(&token.id, "192.0.2.2")
            .unwrap_err();
        assert!(err.to_string().contains("already used"));
    }

    #[test]
    fn consume_persists_before_returning() {
        let dir = tempdir().unwrap();
        let store = TokenStore::open(dir.path()).unwrap();
        let token = store.generate("dave", Duration::hours(1)).unwrap();
        store.validate_and_consume(&token.id, "peer").unwrap();

        // A fresh store sees the used flag from disk.
        let reopened = TokenStore::open(dir.path()).unwrap();
        assert!(reopened
            .validate_and_consume(&token.id, "peer")
            .is_err());
    }

    #[test]
    fn expired_token_is_rejected_and_unchanged() {
        let dir = tempdir().unwrap();
        let store = TokenStore::open(dir.path()).unwrap();
        let token = store.generate("erin", Duration::seconds(-5)).unwrap();

        let err = store.validate_and_consume(&token.id, "peer").unwrap_err();
        assert!(err.to_string().contains("expired"));

        let listed = store.list();
        assert!(!listed[0].used, "expiry check must not mutate the token");
    }

    #[test]
    fn exactly_one_concurrent_consumer_wins() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TokenStore::open(dir.path()).unwrap());
        let token = store.generate("frank", Duration::hours(1)).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                let id = token.id.clone();
                std::thread::spawn(move || {
                    store
                        .validate_and_consume(&id, &format!("caller-{i}"))
                        .is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();


        assert_eq!(wins, 1);
    }

    #[test]
    fn load_skips_keyless_records() {
        let dir = tempdir().unwrap();
        {
            let store = TokenStore::open(dir.path()).unwrap();
            store.generate("good", Duration::hours(1)).unwrap();
        }
        // A record missing key_hex is corrupt per the on-disk contract.
        std::fs::write(
            dir.path().join("broken-20240101-000000.json"),
            r#"{"id":"broken-20240101-000000","client_name":"broken","created_at":"2024-01-01T00:00:00Z","expires_at":"2099-01-01T00:00:00Z","used":false}"#,
        )
        .unwrap();

        let store = TokenStore::open(dir.path()).unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.list()[0].client_name, "good");
    }

    #[test]
    fn cleanup_removes_used_and_expired() {
        let dir = tempdir().unwrap();
        let store = TokenStore::open(dir.path()).unwrap();

        let used = store.generate("used", Duration::hours(1)).unwrap();
        store.validate_and_consume(&used.id, "peer").unwrap();
        store.generate("stale", Duration::seconds(-1)).unwrap();
        store.generate("fresh", Duration::hours(1)).unwrap();

        assert_eq!(store.cleanup_expired_or_used(), 2);
        assert_eq!(store.count(), 1);
        assert_eq!(store.list()[0].client_name, "fresh");
    }

    #[test]
    fn revoke_deletes_record_and_file() {
        let dir = tempdir().unwrap();
        let store = TokenStore::open(dir.path()).unwrap();
        let token = store.generate("gone", Duration::hours(1)).unwrap();

        store.revoke(&token.id).unwrap();
        assert_eq!(store.count(), 0);
        assert!(!store.token_path(&token.id).exists());
        assert!(store.revoke(&token.id).is_err());
    }
}
