//! Token persistence
//!
//! [`TokenStorage`] is the seam to whatever medium the host application keeps
//! credentials in. Two implementations ship with the crate: an in-memory
//! store and a JSON file store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::error::{ClientError, Result};
use crate::types::{AccessToken, RefreshToken};

/// Errors raised by the bundled storage backends
#[derive(Debug, Error)]
pub enum TokenError {
    /// I/O error during storage operations
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TokenError> for ClientError {
    fn from(err: TokenError) -> Self {
        ClientError::storage(err.to_string())
    }
}

// ============================================================================
// Storage Trait
// ============================================================================

/// Persists and retrieves access and refresh tokens.
///
/// All operations are asynchronous and may fail. Writes must be durable (or
/// at least visible to subsequent reads) by the time the returned future
/// completes: the refresh coordinator resumes waiting requests only after its
/// writes have finished.
///
/// # Example
///
/// ```no_run
/// use auth_refresh_client::auth::TokenStorage;
/// use auth_refresh_client::types::{AccessToken, RefreshToken};
/// use auth_refresh_client::Result;
/// use async_trait::async_trait;
///
/// struct KeychainStorage;
///
/// #[async_trait]
/// impl TokenStorage for KeychainStorage {
///     async fn get_access_token(&self) -> Result<Option<AccessToken>> { Ok(None) }
///     async fn get_refresh_token(&self) -> Result<Option<RefreshToken>> { Ok(None) }
///     async fn set_access_token(&self, _token: AccessToken) -> Result<()> { Ok(()) }
///     async fn set_refresh_token(&self, _token: RefreshToken) -> Result<()> { Ok(()) }
///     async fn clear_tokens(&self) -> Result<()> { Ok(()) }
/// }
/// ```
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Current access token, if one is stored
    async fn get_access_token(&self) -> Result<Option<AccessToken>>;

    /// Current refresh token, if one is stored
    async fn get_refresh_token(&self) -> Result<Option<RefreshToken>>;

    /// Replace the stored access token
    async fn set_access_token(&self, token: AccessToken) -> Result<()>;

    /// Replace the stored refresh token
    async fn set_refresh_token(&self, token: RefreshToken) -> Result<()>;

    /// Remove both tokens
    async fn clear_tokens(&self) -> Result<()>;
}

#[async_trait]
impl<T: TokenStorage + ?Sized> TokenStorage for Arc<T> {
    async fn get_access_token(&self) -> Result<Option<AccessToken>> {
        (**self).get_access_token().await
    }

    async fn get_refresh_token(&self) -> Result<Option<RefreshToken>> {
        (**self).get_refresh_token().await
    }

    async fn set_access_token(&self, token: AccessToken) -> Result<()> {
        (**self).set_access_token(token).await
    }

    async fn set_refresh_token(&self, token: RefreshToken) -> Result<()> {
        (**self).set_refresh_token(token).await
    }

    async fn clear_tokens(&self) -> Result<()> {
        (**self).clear_tokens().await
    }
}

/// Type alias for shared token storage.
pub type SharedTokenStorage = Arc<dyn TokenStorage>;

/// On-disk / in-memory record of both tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<AccessToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<RefreshToken>,
}

// ============================================================================
// In-memory Storage
// ============================================================================

/// Process-local token storage
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    tokens: Mutex<StoredTokens>,
}

impl MemoryTokenStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with tokens
    #[must_use]
    pub fn with_tokens(access_token: Option<&str>, refresh_token: Option<&str>) -> Self {
        Self {
            tokens: Mutex::new(StoredTokens {
                access_token: access_token.map(AccessToken::from),
                refresh_token: refresh_token.map(RefreshToken::from),
            }),
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut StoredTokens) -> R) -> R {
        let mut guard = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[async_trait]
impl TokenStorage for MemoryTokenStorage {
    async fn get_access_token(&self) -> Result<Option<AccessToken>> {
        Ok(self.with_lock(|t| t.access_token.clone()))
    }

    async fn get_refresh_token(&self) -> Result<Option<RefreshToken>> {
        Ok(self.with_lock(|t| t.refresh_token.clone()))
    }

    async fn set_access_token(&self, token: AccessToken) -> Result<()> {
        self.with_lock(|t| t.access_token = Some(token));
        Ok(())
    }

    async fn set_refresh_token(&self, token: RefreshToken) -> Result<()> {
        self.with_lock(|t| t.refresh_token = Some(token));
        Ok(())
    }

    async fn clear_tokens(&self) -> Result<()> {
        self.with_lock(|t| *t = StoredTokens::default());
        Ok(())
    }
}

// ============================================================================
// File Storage
// ============================================================================

/// JSON file token storage with user-only permissions (600 on Unix)
#[derive(Debug)]
pub struct FileTokenStorage {
    storage_path: PathBuf,
    // Serializes read-modify-write cycles on the file
    write_lock: tokio::sync::Mutex<()>,
}

impl Default for FileTokenStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTokenStorage {
    /// Create token storage with default path (platform-specific config directory)
    #[must_use]
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("auth-refresh-client");

        Self::with_path(config_dir.join("tokens.json"))
    }

    /// Create token storage with custom path
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            storage_path: path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Get the storage path
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.storage_path
    }

    async fn load(&self) -> std::result::Result<StoredTokens, TokenError> {
        match tokio::fs::read_to_string(&self.storage_path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoredTokens::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Sibling file the next version is written to before it replaces the real one
    fn staging_path(&self) -> PathBuf {
        let mut name = self.storage_path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Write to a user-only staging file, then rename it over the real one so
    /// readers see either the old or the new content, never a partial write.
    async fn save(&self, tokens: &StoredTokens) -> std::result::Result<(), TokenError> {
        if let Some(parent) = self.storage_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec_pretty(tokens)?;
        let staging = self.staging_path();

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&staging).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&staging, &self.storage_path).await?;
        Ok(())
    }

    async fn update(&self, f: impl FnOnce(&mut StoredTokens) + Send) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tokens = self.load().await?;
        f(&mut tokens);
        self.save(&tokens).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStorage for FileTokenStorage {
    async fn get_access_token(&self) -> Result<Option<AccessToken>> {
        Ok(self.load().await?.access_token)
    }

    async fn get_refresh_token(&self) -> Result<Option<RefreshToken>> {
        Ok(self.load().await?.refresh_token)
    }

    async fn set_access_token(&self, token: AccessToken) -> Result<()> {
        self.update(move |t| t.access_token = Some(token)).await
    }

    async fn set_refresh_token(&self, token: RefreshToken) -> Result<()> {
        self.update(move |t| t.refresh_token = Some(token)).await
    }

    async fn clear_tokens(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.storage_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TokenError::from(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryTokenStorage::new();
        assert!(storage.get_access_token().await.unwrap().is_none());

        storage.set_access_token("a1".into()).await.unwrap();
        storage.set_refresh_token("r1".into()).await.unwrap();
        assert_eq!(
            storage.get_access_token().await.unwrap().unwrap().expose(),
            "a1"
        );
        assert_eq!(
            storage.get_refresh_token().await.unwrap().unwrap().expose(),
            "r1"
        );

        storage.clear_tokens().await.unwrap();
        assert!(storage.get_access_token().await.unwrap().is_none());
        assert!(storage.get_refresh_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_storage_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::with_path(temp_dir.path().join("nested/tokens.json"));

        storage.set_access_token("test_access".into()).await.unwrap();
        storage
            .set_refresh_token("test_refresh".into())
            .await
            .unwrap();

        // A second instance on the same path sees the persisted values
        let reopened = FileTokenStorage::with_path(storage.path().clone());
        assert_eq!(
            reopened.get_access_token().await.unwrap().unwrap().expose(),
            "test_access"
        );
        assert_eq!(
            reopened.get_refresh_token().await.unwrap().unwrap().expose(),
            "test_refresh"
        );
    }

    #[tokio::test]
    async fn test_file_storage_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::with_path(temp_dir.path().join("nonexistent.json"));

        assert!(storage.get_access_token().await.unwrap().is_none());
        // Clearing a missing file is not an error
        storage.clear_tokens().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_storage_corrupt_file_is_storage_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tokens.json");
        std::fs::write(&path, "{not json").unwrap();

        let storage = FileTokenStorage::with_path(path);
        let err = storage.get_access_token().await.unwrap_err();
        assert!(matches!(err, ClientError::Storage(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_storage_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::with_path(temp_dir.path().join("tokens.json"));
        storage.set_access_token("a".into()).await.unwrap();

        let mode = std::fs::metadata(storage.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_file_storage_leaves_no_staging_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileTokenStorage::with_path(temp_dir.path().join("tokens.json"));
        storage.set_access_token("a".into()).await.unwrap();
        storage.set_refresh_token("r".into()).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("tokens.json")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_storage_reads_never_see_partial_writes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(FileTokenStorage::with_path(temp_dir.path().join("tokens.json")));
        storage.set_refresh_token("r".into()).await.unwrap();

        let writer = tokio::spawn({
            let storage = Arc::clone(&storage);
            async move {
                for i in 0..50 {
                    let token = format!("access-{i}-{}", "x".repeat(4096));
                    storage.set_access_token(token.into()).await.unwrap();
                }
            }
        });

        while !writer.is_finished() {
            // A torn file would fail to parse and surface as a storage error
            storage.get_refresh_token().await.unwrap();
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(
            storage.get_refresh_token().await.unwrap().unwrap().expose(),
            "r"
        );
    }
}
