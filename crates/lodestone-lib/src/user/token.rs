//! Access token storage, kept apart from `user.json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::states::UserProfile;
use crate::utils::fs::write_atomic_async;

#[async_trait]
pub trait UserTokenStorage: Send + Sync {
    async fn get(&self, user: &UserProfile) -> Result<Option<String>>;
    async fn put(&self, user: &UserProfile, token: &str) -> Result<()>;
    async fn remove(&self, user: &UserProfile) -> Result<()>;
}

fn token_key(user: &UserProfile) -> String {
    format!("{}/{}", user.auth_service, user.id)
}

#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UserTokenStorage for MemoryTokenStorage {
    async fn get(&self, user: &UserProfile) -> Result<Option<String>> {
        Ok(self.tokens().get(&token_key(user)).cloned())
    }

    async fn put(&self, user: &UserProfile, token: &str) -> Result<()> {
        self.tokens().insert(token_key(user), token.to_string());
        Ok(())
    }

    async fn remove(&self, user: &UserProfile) -> Result<()> {
        self.tokens().remove(&token_key(user));
        Ok(())
    }
}

/// Tokens in a JSON file. An unreadable file holds no tokens.
#[derive(Debug)]
pub struct FileTokenStorage {
    path: PathBuf,
    write: tokio::sync::Mutex<()>,
}

impl FileTokenStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: tokio::sync::Mutex::new(()),
        }
    }

    async fn load(&self) -> HashMap<String, String> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                log::warn!("[user] Failed to read tokens from {:?}: {}", self.path, e);
                return HashMap::new();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("[user] Ignoring corrupted token file {:?}: {}", self.path, e);
            HashMap::new()
        })
    }

    async fn update(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> Result<()> {
        let _guard = self.write.lock().await;
        let mut tokens = self.load().await;
        f(&mut tokens);
        let bytes = serde_json::to_vec_pretty(&tokens)?;
        write_atomic_async(&self.path, bytes)
            .await
            .with_context(|| format!("Failed to save tokens to {:?}", self.path))
    }
}

#[async_trait]
impl UserTokenStorage for FileTokenStorage {
    async fn get(&self, user: &UserProfile) -> Result<Option<String>> {
        Ok(self.load().await.remove(&token_key(user)))
    }

    async fn put(&self, user: &UserProfile, token: &str) -> Result<()> {
        let key = token_key(user);
        self.update(|tokens| {
            tokens.insert(key, token.to_string());
        })
        .await
    }

    async fn remove(&self, user: &UserProfile) -> Result<()> {
        let key = token_key(user);
        self.update(|tokens| {
            tokens.remove(&key);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, service: &str) -> UserProfile {
        UserProfile {
            id: id.into(),
            auth_service: service.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tokens_are_scoped_by_service() {
        let storage = MemoryTokenStorage::new();
        storage.put(&user("a", "offline"), "t1").await.unwrap();
        assert_eq!(storage.get(&user("a", "offline")).await.unwrap().as_deref(), Some("t1"));
        assert_eq!(storage.get(&user("a", "microsoft")).await.unwrap(), None);
        storage.remove(&user("a", "offline")).await.unwrap();
        assert_eq!(storage.get(&user("a", "offline")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_storage_survives_reopen_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let storage = FileTokenStorage::new(&path);
        storage.put(&user("a", "offline"), "t1").await.unwrap();
        storage.put(&user("b", "offline"), "t2").await.unwrap();

        let reopened = FileTokenStorage::new(&path);
        assert_eq!(reopened.get(&user("b", "offline")).await.unwrap().as_deref(), Some("t2"));

        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert_eq!(reopened.get(&user("a", "offline")).await.unwrap(), None);
    }
}
