//! authlib-injector support for third-party Yggdrasil accounts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::states::UserProfile;
use crate::utils::fs::write_atomic_async;

pub const AUTHLIB_METADATA_URL: &str = "https://authlib-injector.yushi.moe/artifact/latest.json";

/// Auth services that the game supports without an agent.
const NATIVE_AUTH_SERVICES: &[&str] = &["microsoft", "mojang", "offline"];

/// Where the injector jar lives and which server it redirects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthlibAgent {
    pub jar: PathBuf,
    pub host: String,
}

#[async_trait]
pub trait AuthlibInjector: Send + Sync {
    fn requires_injector(&self, user: &UserProfile) -> bool {
        !user.auth_service.is_empty()
            && !NATIVE_AUTH_SERVICES.contains(&user.auth_service.as_str())
    }

    /// Yggdrasil API root of the user's auth service.
    fn yggdrasil_host(&self, user: &UserProfile) -> Option<String> {
        let service = user.auth_service.trim();
        (service.starts_with("http://") || service.starts_with("https://"))
            .then(|| service.to_string())
    }

    /// Path of the injector jar, downloading it first if needed.
    async fn get_or_install(&self) -> Result<PathBuf>;
}

#[derive(Debug, Deserialize)]
struct ArtifactMetadata {
    download_url: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    checksums: Option<Checksums>,
}

#[derive(Debug, Deserialize)]
struct Checksums {
    sha256: Option<String>,
}

/// Keeps a single injector jar under the launcher root.
#[derive(Debug, Clone)]
pub struct LocalAuthlibInjector {
    jar: PathBuf,
    client: Client,
    metadata_url: String,
}

impl LocalAuthlibInjector {
    pub fn new(root: &Path, client: Client) -> Self {
        Self {
            jar: root.join("authlib-injector.jar"),
            client,
            metadata_url: AUTHLIB_METADATA_URL.to_string(),
        }
    }

    pub fn with_metadata_url(mut self, url: impl Into<String>) -> Self {
        self.metadata_url = url.into();
        self
    }

    pub fn jar(&self) -> &Path {
        &self.jar
    }
}

#[async_trait]
impl AuthlibInjector for LocalAuthlibInjector {
    async fn get_or_install(&self) -> Result<PathBuf> {
        if tokio::fs::try_exists(&self.jar).await.unwrap_or(false) {
            return Ok(self.jar.clone());
        }
        let metadata: ArtifactMetadata = self
            .client
            .get(&self.metadata_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("Failed to query authlib-injector metadata")?
            .json()
            .await
            .context("Invalid authlib-injector metadata")?;
        log::info!(
            "[launch] Installing authlib-injector {}",
            metadata.version.as_deref().unwrap_or("(unknown version)")
        );
        let bytes = self
            .client
            .get(&metadata.download_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to download {}", metadata.download_url))?
            .bytes()
            .await?;
        if let Some(expected) = metadata.checksums.and_then(|c| c.sha256) {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(&expected) {
                anyhow::bail!("authlib-injector checksum mismatch: expected {}, got {}", expected, actual);
            }
        }
        write_atomic_async(&self.jar, bytes.to_vec()).await?;
        Ok(self.jar.clone())
    }
}
