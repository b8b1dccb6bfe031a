//! Sharing of content folders between game directories.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait ContentLinker: Send + Sync {
    fn name(&self) -> &str;
    async fn link(&self, game_directory: &Path) -> Result<()>;
}

/// Links `<game_directory>/<folder>` to a folder shared by every instance.
/// An existing folder or link in the game directory is left alone.
#[derive(Debug, Clone)]
pub struct SharedFolderLinker {
    folder: String,
    shared_root: PathBuf,
}

impl SharedFolderLinker {
    pub fn new(folder: impl Into<String>, shared_root: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            shared_root: shared_root.into(),
        }
    }

    pub fn shader_packs(shared_root: impl Into<PathBuf>) -> Self {
        Self::new("shaderpacks", shared_root)
    }

    pub fn resource_packs(shared_root: impl Into<PathBuf>) -> Self {
        Self::new("resourcepacks", shared_root)
    }
}

#[async_trait]
impl ContentLinker for SharedFolderLinker {
    fn name(&self) -> &str {
        &self.folder
    }

    async fn link(&self, game_directory: &Path) -> Result<()> {
        let shared = self.shared_root.join(&self.folder);
        let target = game_directory.join(&self.folder);
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&shared)
            .await
            .with_context(|| format!("Failed to create {:?}", shared))?;
        tokio::fs::create_dir_all(game_directory).await?;
        create_link(&shared, &target)
            .await
            .with_context(|| format!("Failed to link {:?} to {:?}", target, shared))?;
        log::debug!("[launch] Linked {:?} -> {:?}", target, shared);
        Ok(())
    }
}

#[cfg(unix)]
async fn create_link(original: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(original, link).await
}

#[cfg(windows)]
async fn create_link(original: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_dir(original, link).await
}
