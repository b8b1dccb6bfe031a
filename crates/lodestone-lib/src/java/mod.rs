//! Java runtime discovery and validation.

mod service;

pub use service::{JavaService, JAVA_SERVICE};

use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JavaValidation {
    Okay,
    NotExisted,
    NoPermission,
}

#[async_trait]
pub trait JavaValidator: Send + Sync {
    async fn validate(&self, path: &str) -> Result<JavaValidation>;
}

/// Checks that the path is an existing, executable file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsJavaValidator;

#[async_trait]
impl JavaValidator for FsJavaValidator {
    async fn validate(&self, path: &str) -> Result<JavaValidation> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(JavaValidation::NotExisted)
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Ok(JavaValidation::NoPermission)
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Ok(JavaValidation::NotExisted);
        }
        if !is_executable(Path::new(path), &metadata) {
            return Ok(JavaValidation::NoPermission);
        }
        Ok(JavaValidation::Okay)
    }
}

#[cfg(unix)]
fn is_executable(_path: &Path, metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _metadata: &std::fs::Metadata) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

/// `(version, major)` from `java -version` output, e.g. `1.8.0_312` → 8.
pub fn parse_java_version(output: &str) -> Option<(String, u32)> {
    static VERSION: OnceLock<Option<Regex>> = OnceLock::new();
    let re = VERSION
        .get_or_init(|| Regex::new(r#"version\s+"(\d+)(?:\.(\d+))?[^"]*""#).ok())
        .as_ref()?;
    let caps = re.captures(output)?;
    let full = caps.get(0)?.as_str();
    let version = full[full.find('"')? + 1..full.len() - 1].to_string();
    let major: u32 = caps.get(1)?.as_str().parse().ok()?;
    let major = if major == 1 {
        caps.get(2)?.as_str().parse().ok()?
    } else {
        major
    };
    Some((version, major))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn java_version_output_is_parsed() {
        assert_eq!(
            parse_java_version("java version \"1.8.0_312\"\nJava(TM) SE Runtime Environment"),
            Some(("1.8.0_312".to_string(), 8))
        );
        assert_eq!(
            parse_java_version("openjdk version \"17.0.2\" 2022-01-18\nOpenJDK Runtime Environment"),
            Some(("17.0.2".to_string(), 17))
        );
        assert_eq!(
            parse_java_version("openjdk version \"21-ea\" 2023-09-19"),
            Some(("21-ea".to_string(), 21))
        );
        assert_eq!(parse_java_version("command not found"), None);
    }

    #[tokio::test]
    async fn validation_classifies_paths() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert_eq!(
            FsJavaValidator.validate(&missing.to_string_lossy()).await.unwrap(),
            JavaValidation::NotExisted
        );
        assert_eq!(
            FsJavaValidator.validate(&dir.path().to_string_lossy()).await.unwrap(),
            JavaValidation::NotExisted
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let java = dir.path().join("java");
            std::fs::write(&java, b"#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&java, std::fs::Permissions::from_mode(0o644)).unwrap();
            assert_eq!(
                FsJavaValidator.validate(&java.to_string_lossy()).await.unwrap(),
                JavaValidation::NoPermission
            );
            std::fs::set_permissions(&java, std::fs::Permissions::from_mode(0o755)).unwrap();
            assert_eq!(
                FsJavaValidator.validate(&java.to_string_lossy()).await.unwrap(),
                JavaValidation::Okay
            );
        }
    }
}
