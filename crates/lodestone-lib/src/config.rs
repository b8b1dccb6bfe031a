//! Launcher configuration persisted as `config.json` in the data directory.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::states::SettingState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LauncherConfig {
    pub locale: String,
    pub min_memory: Option<u32>,
    pub max_memory: Option<u32>,
    pub launcher_name: String,
    pub launcher_brand: String,
    pub max_sockets: u32,
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    pub debug_logging: bool,
    /// Yggdrasil API roots offered for third-party login.
    pub yggdrasil_services: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let settings = SettingState::default();
        Self {
            locale: settings.locale,
            min_memory: settings.min_memory,
            max_memory: settings.max_memory,
            launcher_name: settings.launcher_name,
            launcher_brand: settings.launcher_brand,
            max_sockets: settings.max_sockets,
            log_level: "info".to_string(),
            debug_logging: false,
            yggdrasil_services: vec!["https://littleskin.cn/api/yggdrasil".to_string()],
        }
    }
}

impl LauncherConfig {
    /// Reads `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse config {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        crate::utils::fs::write_atomic(path, raw.as_bytes())
    }

    /// Effective log level; `debug_logging` forces `debug`.
    pub fn level_filter(&self) -> log::LevelFilter {
        if self.debug_logging {
            return log::LevelFilter::Debug;
        }
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn settings(&self) -> SettingState {
        SettingState {
            locale: self.locale.clone(),
            min_memory: self.min_memory,
            max_memory: self.max_memory,
            launcher_name: self.launcher_name.clone(),
            launcher_brand: self.launcher_brand.clone(),
            max_sockets: self.max_sockets,
        }
    }

    /// Copies the user-editable settings back into the config.
    pub fn apply_settings(&mut self, settings: &SettingState) {
        self.locale = settings.locale.clone();
        self.min_memory = settings.min_memory;
        self.max_memory = settings.max_memory;
        self.launcher_name = settings.launcher_name.clone();
        self.launcher_brand = settings.launcher_brand.clone();
        self.max_sockets = settings.max_sockets;
    }
}
