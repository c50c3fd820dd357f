use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::Mac;
use rusqlite::{Connection, OptionalExtension};
use sha2::Sha256;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::auth::{AuthStrategy, TenantCredentials};

type HmacSha256 = hmac::Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// Vault entry holding the LLM API key when no environment variable is set.
pub const LLM_API_KEY: &str = "llm_api_key";

/// Encrypted key/value secrets stored next to the rest of the data.
///
/// Values are AES-256-GCM encrypted with a key derived from the host name and
/// user name, so a copied database is useless on another machine.
pub struct SecretsVault {
    db: Arc<Mutex<Connection>>,
    cipher: Aes256Gcm,
}

fn derive_key() -> [u8; 32] {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let input = format!("{}:{}", host, whoami::username());

    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"vigil-vault-v1")
        .expect("HMAC accepts keys of any length");
    mac.update(input.as_bytes());

    let mut key = [0u8; 32];
    key.copy_from_slice(&mac.finalize().into_bytes());
    key
}

pub fn tenant_key(tenant_id: &str, secret: &str) -> String {
    format!("tenant:{}:{}", tenant_id, secret)
}

impl SecretsVault {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        let cipher = Aes256Gcm::new(&derive_key().into());
        Self { db, cipher }
    }

    /// base64(nonce || ciphertext)
    fn seal(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| anyhow!("encryption failed: {}", e))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(B64.encode(sealed))
    }

    fn open(&self, sealed: &str) -> Result<String> {
        let bytes = B64
            .decode(sealed)
            .map_err(|e| anyhow!("vault entry is not base64: {}", e))?;
        if bytes.len() <= NONCE_LEN {
            return Err(anyhow!("vault entry is truncated"));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("vault entry cannot be decrypted on this machine"))?;
        String::from_utf8(plaintext).map_err(|e| anyhow!("vault entry is not UTF-8: {}", e))
    }

    pub async fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        let sealed = self.seal(value)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO secrets_vault (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            (key, &sealed),
        )?;
        Ok(())
    }

    pub async fn get_secret(&self, key: &str) -> Result<Option<String>> {
        let sealed: Option<String> = {
            let db = self.db.lock().await;
            db.query_row(
                "SELECT value FROM secrets_vault WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?
        };
        sealed.map(|s| self.open(&s)).transpose()
    }

    pub async fn remove_secret(&self, key: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute("DELETE FROM secrets_vault WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Names (not values) of the secrets stored for one tenant.
    pub async fn tenant_secret_names(&self, tenant_id: &str) -> Result<Vec<String>> {
        let prefix = tenant_key(tenant_id, "");
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT key FROM secrets_vault WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
        let rows = stmt.query_map((&prefix, prefix.len() as i64), |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for key in rows {
            let key = key?;
            names.push(key[prefix.len()..].to_string());
        }
        Ok(names)
    }

    pub async fn set_tenant_secret(&self, tenant_id: &str, strategy: AuthStrategy, value: &str) -> Result<()> {
        self.set_secret(&tenant_key(tenant_id, strategy.secret_name()), value)
            .await
    }

    pub async fn tenant_credentials(&self, tenant_id: &str) -> Result<TenantCredentials> {
        let load = |s: AuthStrategy| self.get_secret_owned(tenant_key(tenant_id, s.secret_name()));
        Ok(TenantCredentials {
            gcp_access_token: load(AuthStrategy::Gcp).await?,
            soar_api_key: load(AuthStrategy::SoarApiKey).await?,
            bindplane_api_key: load(AuthStrategy::BindplaneApiKey).await?,
        })
    }

    async fn get_secret_owned(&self, key: String) -> Result<Option<String>> {
        self.get_secret(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> SecretsVault {
        let db = Connection::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE secrets_vault (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .unwrap();
        SecretsVault::new(Arc::new(Mutex::new(db)))
    }

    #[test]
    fn sealing_is_randomized_and_reversible() {
        let vault = test_vault();
        let a = vault.seal("AppKey-123").unwrap();
        let b = vault.seal("AppKey-123").unwrap();
        assert_ne!(a, b);
        assert_eq!(vault.open(&a).unwrap(), "AppKey-123");
        assert_eq!(vault.open(&b).unwrap(), "AppKey-123");
    }

    #[test]
    fn open_rejects_garbage() {
        let vault = test_vault();
        assert!(vault.open("not-valid-base64!!!").is_err());
        assert!(vault.open(&B64.encode(b"short")).is_err());
    }

    #[tokio::test]
    async fn set_overwrite_and_remove() {
        let vault = test_vault();
        vault.set_secret(LLM_API_KEY, "old").await.unwrap();
        vault.set_secret(LLM_API_KEY, "new").await.unwrap();
        assert_eq!(vault.get_secret(LLM_API_KEY).await.unwrap().as_deref(), Some("new"));
        assert!(vault.remove_secret(LLM_API_KEY).await.unwrap());
        assert!(!vault.remove_secret(LLM_API_KEY).await.unwrap());
        assert_eq!(vault.get_secret(LLM_API_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn tenant_credentials_are_scoped() {
        let vault = test_vault();
        vault
            .set_tenant_secret("acme", AuthStrategy::SoarApiKey, "soar-1")
            .await
            .unwrap();
        vault
            .set_tenant_secret("other", AuthStrategy::BindplaneApiKey, "bp-2")
            .await
            .unwrap();

        let creds = vault.tenant_credentials("acme").await.unwrap();
        assert_eq!(creds.soar_api_key.as_deref(), Some("soar-1"));
        assert!(creds.bindplane_api_key.is_none());
        assert!(creds.gcp_access_token.is_none());

        assert_eq!(
            vault.tenant_secret_names("acme").await.unwrap(),
            vec!["soar_api_key"]
        );
    }
}
