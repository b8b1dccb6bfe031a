use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::states::UserProfile;
use crate::utils::process::quote_arg;

/// Everything a frontend passes to `launch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchOptions {
    /// Installed version id, e.g. `1.20.1` or `fabric-loader-0.15.0-1.20.1`.
    pub version: String,
    pub game_directory: PathBuf,
    pub user: UserProfile,
    /// Path of the java executable.
    pub java: String,
    pub server: Option<ServerOptions>,
    pub launcher_name: Option<String>,
    pub launcher_brand: Option<String>,
    /// MiB
    pub min_memory: Option<u32>,
    pub max_memory: Option<u32>,
    pub vm_options: Vec<String>,
    pub mc_options: Vec<String>,
    pub env: HashMap<String, String>,
    pub skip_assets_check: bool,
    pub skip_user_refresh: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOptions {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// A fully assembled process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl LaunchCommand {
    /// `program` followed by `args`.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Human-readable command line with `secret` masked.
    pub fn display_redacted(&self, secret: Option<&str>) -> String {
        self.argv()
            .iter()
            .map(|arg| match secret {
                Some(secret) if !secret.is_empty() && arg.contains(secret) => {
                    quote_arg(&arg.replace(secret, "***"))
                }
                _ => quote_arg(arg),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinecraftStart {
    pub pid: Option<u32>,
    pub version: String,
    pub minecraft: String,
    pub game_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinecraftOutput {
    pub pid: Option<u32>,
    pub line: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinecraftWindowReady {
    pub pid: Option<u32>,
    pub version: String,
    pub game_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinecraftExit {
    pub pid: Option<u32>,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Milliseconds the process ran.
    pub duration: u64,
    pub crash_report: Option<String>,
    pub crash_report_location: Option<String>,
    /// Everything the process wrote to stderr.
    pub error_log: String,
    pub version: String,
    pub game_directory: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_is_masked_in_logs() {
        let command = LaunchCommand {
            program: PathBuf::from("/usr/bin/java"),
            args: vec!["--accessToken".into(), "s3cret".into(), "--demo".into()],
            ..Default::default()
        };
        assert_eq!(
            command.display_redacted(Some("s3cret")),
            "/usr/bin/java --accessToken *** --demo"
        );
    }

    #[test]
    fn options_accept_camel_case_with_defaults() {
        let options: LaunchOptions = serde_json::from_value(serde_json::json!({
            "version": "1.20.1",
            "gameDirectory": "/games/main",
            "java": "/usr/bin/java",
            "server": { "host": "mc.example.org" }
        }))
        .unwrap();
        assert_eq!(options.version, "1.20.1");
        assert!(!options.skip_assets_check);
        assert_eq!(options.server.unwrap().port, None);
    }
}
