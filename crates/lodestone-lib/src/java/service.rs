use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use super::{parse_java_version, FsJavaValidator, JavaValidation, JavaValidator};
use crate::error::{DispatchError, ServiceError};
use crate::service::{Args, CallOutcome, Service, ServiceKey};
use crate::states::{JavaMutation, JavaRecord, JavaState};
use crate::sync::{MutableState, StateRegistry, SyncError};
use crate::utils::process::LauncherCommandExt;

pub const JAVA_SERVICE: ServiceKey = "JavaService";

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(windows)]
const JAVA_EXECUTABLE: &str = "java.exe";
#[cfg(not(windows))]
const JAVA_EXECUTABLE: &str = "java";

pub struct JavaService {
    state: MutableState<JavaState>,
    validator: FsJavaValidator,
}

impl JavaService {
    pub fn new(states: &StateRegistry) -> Result<Self, SyncError> {
        let state = states.register("java", JavaState::default())?;
        state.activate();
        Ok(Self {
            state,
            validator: FsJavaValidator,
        })
    }

    pub fn state(&self) -> &MutableState<JavaState> {
        &self.state
    }

    pub async fn validate_java_path(&self, path: &str) -> anyhow::Result<JavaValidation> {
        self.validator.validate(path).await
    }

    /// Probe one executable with `java -version`.
    pub async fn resolve_java(&self, path: &str) -> JavaRecord {
        let mut record = JavaRecord {
            path: path.to_string(),
            version: String::new(),
            major_version: 0,
            valid: false,
        };
        match self.validator.validate(path).await {
            Ok(JavaValidation::Okay) => {}
            Ok(other) => {
                log::debug!("[java] {} is not usable: {:?}", path, other);
                return record;
            }
            Err(e) => {
                log::warn!("[java] Failed to validate {}: {:#}", path, e);
                return record;
            }
        }
        let mut command = tokio::process::Command::new(path);
        command
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .suppress_console();
        let output = match tokio::time::timeout(VERSION_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                log::warn!("[java] Failed to run {} -version: {}", path, e);
                return record;
            }
            Err(_) => {
                log::warn!("[java] {} -version timed out", path);
                return record;
            }
        };
        // java -version prints to stderr
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stderr),
            String::from_utf8_lossy(&output.stdout)
        );
        if let Some((version, major)) = parse_java_version(&text) {
            record.version = version;
            record.major_version = major;
            record.valid = true;
        }
        record
    }

    /// Add one installation to the state.
    pub async fn add_java(&self, path: &str) -> Result<JavaRecord, SyncError> {
        let record = self.resolve_java(path).await;
        self.state
            .mutate(JavaMutation::JavaUpdate(vec![record.clone()]))?;
        Ok(record)
    }

    pub fn remove_java(&self, path: &str) -> Result<(), SyncError> {
        self.state.mutate(JavaMutation::JavaRemove(path.to_string()))
    }

    /// Rescan `PATH` and `JAVA_HOME`, re-probing everything already known.
    pub async fn refresh_local_java(&self) -> Result<Vec<JavaRecord>, SyncError> {
        let mut candidates: BTreeSet<PathBuf> = BTreeSet::new();
        match which::which_all(JAVA_EXECUTABLE) {
            Ok(found) => candidates.extend(found),
            Err(e) => log::debug!("[java] No java on PATH: {}", e),
        }
        if let Some(home) = std::env::var_os("JAVA_HOME") {
            candidates.insert(PathBuf::from(home).join("bin").join(JAVA_EXECUTABLE));
        }
        let mut paths: BTreeSet<String> = self
            .state
            .with(|s| s.all.iter().map(|j| j.path.clone()).collect());
        for candidate in candidates {
            let resolved = tokio::fs::canonicalize(candidate.clone()).await.unwrap_or(candidate);
            paths.insert(resolved.to_string_lossy().to_string());
        }

        let records =
            futures::future::join_all(paths.iter().map(|path| self.resolve_java(path))).await;
        log::info!(
            "[java] Found {} java installations, {} usable",
            records.len(),
            records.iter().filter(|r| r.valid).count()
        );
        self.state.mutate(JavaMutation::JavaUpdate(records.clone()))?;
        Ok(records)
    }
}

#[async_trait]
impl JavaValidator for JavaService {
    async fn validate(&self, path: &str) -> anyhow::Result<JavaValidation> {
        self.validate_java_path(path).await
    }
}

#[async_trait]
impl Service for JavaService {
    fn key(&self) -> ServiceKey {
        JAVA_SERVICE
    }

    fn methods(&self) -> &'static [&'static str] {
        &[
            "getJavaState",
            "validateJavaPath",
            "refreshLocalJava",
            "addJava",
            "removeJava",
        ]
    }

    async fn call(&self, method: &str, args: Args) -> Result<CallOutcome, ServiceError> {
        match method {
            "getJavaState" => Ok(CallOutcome::state(&self.state)),
            "validateJavaPath" => {
                CallOutcome::value(self.validate_java_path(&args.get::<String>(0)?).await?)
            }
            "refreshLocalJava" => CallOutcome::value(self.refresh_local_java().await?),
            "addJava" => CallOutcome::value(self.add_java(&args.get::<String>(0)?).await?),
            "removeJava" => {
                self.remove_java(&args.get::<String>(0)?)?;
                Ok(CallOutcome::unit())
            }
            _ => Err(DispatchError::ServiceMethodNotFound {
                service: JAVA_SERVICE.to_string(),
                method: method.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn fake_java_is_probed() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let java = dir.path().join("java");
        std::fs::write(
            &java,
            "#!/bin/sh\necho 'openjdk version \"17.0.9\" 2023-10-17' 1>&2\n",
        )
        .unwrap();
        std::fs::set_permissions(&java, std::fs::Permissions::from_mode(0o755)).unwrap();

        let service = JavaService::new(&StateRegistry::default()).unwrap();
        let record = service.add_java(&java.to_string_lossy()).await.unwrap();
        assert!(record.valid);
        assert_eq!(record.major_version, 17);
        assert_eq!(service.state().read().preferred(), Some(&record));

        service.remove_java(&record.path).unwrap();
        assert!(service.state().read().all.is_empty());
    }

    #[tokio::test]
    async fn missing_java_is_recorded_invalid() {
        let service = JavaService::new(&StateRegistry::default()).unwrap();
        let record = service.resolve_java("/definitely/not/java").await;
        assert!(!record.valid);
    }
}
