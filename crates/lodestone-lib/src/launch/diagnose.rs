//! Detection and repair of missing or corrupted game files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;

use super::version::ResolvedVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    Missing,
    Corrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIssue {
    pub name: String,
    pub kind: IssueKind,
    pub path: PathBuf,
    pub url: Option<String>,
    pub sha1: Option<String>,
}

#[async_trait]
pub trait Diagnoser: Send + Sync {
    async fn diagnose_jar(&self, version: &ResolvedVersion) -> Result<Option<FileIssue>>;
    async fn diagnose_libraries(&self, version: &ResolvedVersion) -> Result<Vec<FileIssue>>;
}

#[async_trait]
pub trait Installer: Send + Sync {
    async fn install_jar(&self, version: &ResolvedVersion) -> Result<()>;
    async fn install_libraries(&self, issues: &[FileIssue]) -> Result<()>;
}

/// Checks existence and, when known, the sha1 of every file.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDiagnoser;

impl LocalDiagnoser {
    async fn check(
        name: &str,
        path: &Path,
        url: Option<&String>,
        sha1: Option<&String>,
    ) -> Result<Option<FileIssue>> {
        let kind = if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            Some(IssueKind::Missing)
        } else if let Some(expected) = sha1 {
            let actual = sha1_file(path).await?;
            (!actual.eq_ignore_ascii_case(expected)).then_some(IssueKind::Corrupted)
        } else {
            None
        };
        Ok(kind.map(|kind| FileIssue {
            name: name.to_string(),
            kind,
            path: path.to_path_buf(),
            url: url.cloned(),
            sha1: sha1.cloned(),
        }))
    }
}

#[async_trait]
impl Diagnoser for LocalDiagnoser {
    async fn diagnose_jar(&self, version: &ResolvedVersion) -> Result<Option<FileIssue>> {
        Self::check(
            &version.minecraft_version,
            &version.jar,
            version.jar_url.as_ref(),
            version.jar_sha1.as_ref(),
        )
        .await
    }

    async fn diagnose_libraries(&self, version: &ResolvedVersion) -> Result<Vec<FileIssue>> {
        let checks = version.libraries.iter().map(|library| {
            Self::check(&library.name, &library.path, library.url.as_ref(), library.sha1.as_ref())
        });
        let issues = futures::future::try_join_all(checks).await?;
        Ok(issues.into_iter().flatten().collect())
    }
}

pub async fn sha1_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {:?} for hashing", path))?;
    let digest = tokio::task::spawn_blocking(move || Sha1::digest(&bytes)).await?;
    Ok(hex::encode(digest))
}

/// Downloads missing files over HTTP.
#[derive(Debug, Clone)]
pub struct DownloadInstaller {
    client: Client,
    concurrency: usize,
}

impl DownloadInstaller {
    pub fn new(client: Client, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    async fn download(&self, url: &str, path: &Path, expected_sha1: Option<&str>) -> Result<()> {
        log::debug!("[launch] Downloading {} -> {:?}", url, path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to request {}", url))?;

        let part = path.with_extension("part");
        let mut file = tokio::fs::File::create(&part).await?;
        let mut hasher = Sha1::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Failed to download {}", url))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = expected_sha1 {
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&part).await;
                bail!("Checksum mismatch for {}: expected {}, got {}", url, expected, actual);
            }
        }
        tokio::fs::rename(&part, path)
            .await
            .with_context(|| format!("Failed to move download into {:?}", path))?;
        Ok(())
    }
}

#[async_trait]
impl Installer for DownloadInstaller {
    async fn install_jar(&self, version: &ResolvedVersion) -> Result<()> {
        let url = version
            .jar_url
            .as_deref()
            .with_context(|| format!("No download url for the {} jar", version.minecraft_version))?;
        self.download(url, &version.jar, version.jar_sha1.as_deref()).await
    }

    async fn install_libraries(&self, issues: &[FileIssue]) -> Result<()> {
        futures::stream::iter(issues.iter().map(Ok::<_, anyhow::Error>))
            .try_for_each_concurrent(self.concurrency, |issue| async move {
                let url = issue
                    .url
                    .as_deref()
                    .with_context(|| format!("No download url for library {}", issue.name))?;
                self.download(url, &issue.path, issue.sha1.as_deref()).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::version::ResolvedLibrary;

    #[tokio::test]
    async fn missing_and_corrupted_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.jar");
        let bad = dir.path().join("bad.jar");
        tokio::fs::write(&good, b"hello").await.unwrap();
        tokio::fs::write(&bad, b"tampered").await.unwrap();
        let hello_sha1 = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d".to_string();

        let library = |name: &str, path: PathBuf| ResolvedLibrary {
            name: name.into(),
            path,
            url: None,
            sha1: Some(hello_sha1.clone()),
        };
        let version = ResolvedVersion {
            minecraft_version: "1.20.1".into(),
            jar: dir.path().join("client.jar"),
            libraries: vec![
                library("good", good),
                library("bad", bad),
                library("gone", dir.path().join("gone.jar")),
            ],
            ..Default::default()
        };

        let jar = LocalDiagnoser.diagnose_jar(&version).await.unwrap().unwrap();
        assert_eq!(jar.kind, IssueKind::Missing);

        let issues = LocalDiagnoser.diagnose_libraries(&version).await.unwrap();
        let kinds: Vec<_> = issues.iter().map(|i| (i.name.as_str(), i.kind)).collect();
        assert_eq!(kinds, vec![("bad", IssueKind::Corrupted), ("gone", IssueKind::Missing)]);
    }

    #[tokio::test]
    async fn libraries_without_url_cannot_be_installed() {
        let installer = DownloadInstaller::new(Client::new(), 4);
        let issue = FileIssue {
            name: "org.example:lib:1.0".into(),
            kind: IssueKind::Missing,
            path: PathBuf::from("/nonexistent/lib.jar"),
            url: None,
            sha1: None,
        };
        let err = installer.install_libraries(&[issue]).await.unwrap_err();
        assert!(err.to_string().contains("org.example:lib:1.0"));
    }
}
