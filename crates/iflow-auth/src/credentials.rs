//! Account model and on-disk account snapshot
//!
//! An `Account` is one set of upstream credentials plus its health and
//! rate-limit bookkeeping. The pool persists all accounts as a single
//! versioned JSON snapshot (`AccountStorage`). All writes use atomic
//! temp-file + rename to prevent corruption on crash; a tokio Mutex
//! serializes concurrent writers within the process. Across writers the
//! snapshot is last-writer-wins.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use common::Secret;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Snapshot format version written by this crate.
pub const STORAGE_VERSION: u32 = 1;

/// Generate a random 128-bit account identifier, hex encoded.
pub fn generate_account_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// How an account authenticates upstream.
///
/// Token-based accounts carry the refresh credential and the expiry of the
/// current access token; static-key accounts carry nothing beyond the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "authMethod")]
pub enum AuthMethod {
    #[serde(rename = "oauth")]
    OAuth {
        #[serde(
            rename = "refreshToken",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        refresh_token: Option<Secret<String>>,
        #[serde(
            rename = "accessToken",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        access_token: Option<Secret<String>>,
        /// Expiration of the access token, unix milliseconds
        #[serde(rename = "expiresAt", default, skip_serializing_if = "Option::is_none")]
        expires_at: Option<u64>,
    },
    #[serde(rename = "apikey")]
    ApiKey,
}

impl AuthMethod {
    /// Label for logging and health output.
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::OAuth { .. } => "oauth",
            AuthMethod::ApiKey => "apikey",
        }
    }
}

fn default_healthy() -> bool {
    true
}

/// A single upstream account.
///
/// All timestamps are unix milliseconds. `rate_limit_reset_time == 0` means
/// not rate limited. `last_used` lives only in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    /// Human-facing label, usually the account email. Not unique.
    #[serde(rename = "email", default)]
    pub label: String,
    #[serde(flatten)]
    pub auth: AuthMethod,
    /// Bearer credential sent upstream
    #[serde(rename = "apiKey")]
    pub static_key: Secret<String>,
    #[serde(default)]
    pub rate_limit_reset_time: u64,
    #[serde(default = "default_healthy")]
    pub is_healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_time: Option<u64>,
    #[serde(skip)]
    pub last_used: Option<u64>,
}

impl Account {
    /// Create a healthy static-key account with a fresh id.
    pub fn new_api_key(label: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: generate_account_id(),
            label: label.into(),
            auth: AuthMethod::ApiKey,
            static_key: Secret::new(api_key.into()),
            rate_limit_reset_time: 0,
            is_healthy: true,
            unhealthy_reason: None,
            recovery_time: None,
            last_used: None,
        }
    }

    /// Create a healthy token-based account with a fresh id.
    pub fn new_oauth(
        label: impl Into<String>,
        api_key: impl Into<String>,
        refresh_token: impl Into<String>,
        access_token: impl Into<String>,
        expires_at: u64,
    ) -> Self {
        Self {
            auth: AuthMethod::OAuth {
                refresh_token: Some(Secret::new(refresh_token.into())),
                access_token: Some(Secret::new(access_token.into())),
                expires_at: Some(expires_at),
            },
            ..Self::new_api_key(label, api_key)
        }
    }

    pub fn is_token_based(&self) -> bool {
        matches!(self.auth, AuthMethod::OAuth { .. })
    }

    /// Access token expiry, for token-based accounts that recorded one.
    pub fn expires_at(&self) -> Option<u64> {
        match &self.auth {
            AuthMethod::OAuth { expires_at, .. } => *expires_at,
            AuthMethod::ApiKey => None,
        }
    }

    /// Refresh credential, if present and non-empty.
    pub fn refresh_token(&self) -> Option<&Secret<String>> {
        match &self.auth {
            AuthMethod::OAuth {
                refresh_token: Some(token),
                ..
            } if !token.is_empty() => Some(token),
            _ => None,
        }
    }

    /// Set the unhealthy markers together.
    pub fn mark_unhealthy(&mut self, reason: impl Into<String>, recovery_at: u64) {
        self.is_healthy = false;
        self.unhealthy_reason = Some(reason.into());
        self.recovery_time = Some(recovery_at);
    }

    /// Clear the unhealthy markers together.
    pub fn clear_unhealthy(&mut self) {
        self.is_healthy = true;
        self.unhealthy_reason = None;
        self.recovery_time = None;
    }
}

/// Persisted pool snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStorage {
    pub version: u32,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub active_index: usize,
}

impl Default for AccountStorage {
    fn default() -> Self {
        Self {
            version: STORAGE_VERSION,
            accounts: Vec::new(),
            active_index: 0,
        }
    }
}

/// Durable storage for the account snapshot.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Persistence>`).
pub trait Persistence: Send + Sync {
    /// Load the stored snapshot. A store with nothing saved yet returns an
    /// empty snapshot.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<AccountStorage>> + Send + '_>>;

    /// Replace the stored snapshot.
    fn save<'a>(
        &'a self,
        storage: &'a AccountStorage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// JSON file implementation of `Persistence`.
pub struct AccountStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AccountStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<AccountStorage> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "account file not found, starting with empty pool");
            let storage = AccountStorage::default();
            // Create the empty file so future loads don't need the cold-start path
            self.write(&storage).await?;
            return Ok(storage);
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading account file: {e}")))?;
        let storage: AccountStorage = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing account file: {e}")))?;
        if storage.version != STORAGE_VERSION {
            return Err(Error::CredentialParse(format!(
                "unsupported account file version {} (expected {STORAGE_VERSION})",
                storage.version
            )));
        }
        info!(path = %self.path.display(), accounts = storage.accounts.len(), "loaded accounts");
        Ok(storage)
    }

    async fn write(&self, storage: &AccountStorage) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.path, storage).await
    }
}

impl Persistence for AccountStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<AccountStorage>> + Send + '_>> {
        Box::pin(self.read())
    }

    fn save<'a>(
        &'a self,
        storage: &'a AccountStorage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.write(storage))
    }
}

/// Write the snapshot to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains API keys and refresh tokens.
async fn write_atomic(path: &Path, data: &AccountStorage) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing accounts: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => return Err(Error::Io("account path has no parent directory".into())),
    };

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Io(format!("creating account directory: {e}")))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp account file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting account file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp account file: {e}")))?;

    debug!(path = %path.display(), accounts = data.accounts.len(), "persisted accounts");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(accounts: Vec<Account>, active_index: usize) -> AccountStorage {
        AccountStorage {
            version: STORAGE_VERSION,
            accounts,
            active_index,
        }
    }

    #[test]
    fn generated_ids_are_hex_and_distinct() {
        let a = generate_account_id();
        let b = generate_account_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn oauth_account_serializes_with_tag_and_camel_case() {
        let mut account = Account::new_oauth("a@example.com", "sk-1", "rt-1", "at-1", 1_700_000_000_000);
        account.last_used = Some(42);
        let json = serde_json::to_value(&account).unwrap();

        assert_eq!(json["authMethod"], "oauth");
        assert_eq!(json["email"], "a@example.com");
        assert_eq!(json["apiKey"], "sk-1");
        assert_eq!(json["refreshToken"], "rt-1");
        assert_eq!(json["accessToken"], "at-1");
        assert_eq!(json["expiresAt"], 1_700_000_000_000u64);
        assert_eq!(json["rateLimitResetTime"], 0);
        assert_eq!(json["isHealthy"], true);
        assert!(json.get("lastUsed").is_none());
        assert!(json.get("unhealthyReason").is_none());
    }

    #[test]
    fn api_key_account_has_no_token_fields() {
        let account = Account::new_api_key("ops", "sk-2");
        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["authMethod"], "apikey");
        assert!(json.get("refreshToken").is_none());
        assert!(json.get("expiresAt").is_none());
        assert!(!account.is_token_based());
        assert_eq!(account.expires_at(), None);
    }

    #[test]
    fn deserializes_existing_file_format() {
        let json = r#"{
            "id": "abc",
            "email": "user@example.com",
            "authMethod": "oauth",
            "refreshToken": "rt",
            "accessToken": "at",
            "expiresAt": 1000,
            "apiKey": "sk",
            "rateLimitResetTime": 0,
            "isHealthy": false,
            "unhealthyReason": "Authentication failed",
            "recoveryTime": 5000
        }"#;
        let account: Account = serde_json::from_str(json).unwrap();
        assert_eq!(account.id, "abc");
        assert_eq!(account.label, "user@example.com");
        assert_eq!(account.static_key.expose(), "sk");
        assert_eq!(account.expires_at(), Some(1000));
        assert_eq!(account.refresh_token().unwrap().expose(), "rt");
        assert!(!account.is_healthy);
        assert_eq!(account.recovery_time, Some(5000));
        assert_eq!(account.last_used, None);
    }

    #[test]
    fn empty_refresh_token_counts_as_absent() {
        let mut account = Account::new_oauth("x", "sk", "", "at", 0);
        assert!(account.refresh_token().is_none());
        account.auth = AuthMethod::OAuth {
            refresh_token: None,
            access_token: None,
            expires_at: None,
        };
        assert!(account.refresh_token().is_none());
    }

    #[test]
    fn unhealthy_markers_move_together() {
        let mut account = Account::new_api_key("x", "sk");
        account.mark_unhealthy("server error", 99);
        assert!(!account.is_healthy);
        assert_eq!(account.unhealthy_reason.as_deref(), Some("server error"));
        assert_eq!(account.recovery_time, Some(99));

        account.clear_unhealthy();
        assert!(account.is_healthy);
        assert!(account.unhealthy_reason.is_none());
        assert!(account.recovery_time.is_none());
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));

        let accounts = vec![
            Account::new_api_key("one", "sk-1"),
            Account::new_oauth("two", "sk-2", "rt-2", "at-2", 123),
        ];
        store.save(&snapshot(accounts.clone(), 1)).await.unwrap();

        let loaded = AccountStore::new(dir.path().join("accounts.json"))
            .load()
            .await
            .unwrap();
        assert_eq!(loaded.version, STORAGE_VERSION);
        assert_eq!(loaded.active_index, 1);
        assert_eq!(loaded.accounts, accounts);
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = AccountStore::new(path.clone());

        assert!(!path.exists());
        let loaded = store.load().await.unwrap();
        assert!(loaded.accounts.is_empty());
        assert_eq!(loaded.active_index, 0);
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: AccountStorage = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, AccountStorage::default());
    }

    #[tokio::test]
    async fn rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        tokio::fs::write(&path, r#"{"version":2,"accounts":[],"activeIndex":0}"#)
            .await
            .unwrap();

        let err = AccountStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, Error::CredentialParse(_)), "got: {err}");
    }

    #[tokio::test]
    async fn rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let err = AccountStore::new(path).load().await.unwrap_err();
        assert!(matches!(err, Error::CredentialParse(_)), "got: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = AccountStore::new(path.clone());
        store
            .save(&snapshot(vec![Account::new_api_key("x", "sk")], 0))
            .await
            .unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "account file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_saves_leave_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = std::sync::Arc::new(AccountStore::new(path.clone()));

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let accounts = vec![Account::new_api_key(format!("acct-{i}"), "sk")];
                store.save(&snapshot(accounts, 0)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // Last writer wins, but the file is always one complete snapshot
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: AccountStorage = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.accounts.len(), 1);
    }
}
