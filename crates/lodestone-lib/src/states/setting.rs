use serde::{Deserialize, Serialize};

use crate::sync::SyncState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingState {
    pub locale: String,
    /// Default JVM memory bounds in MiB.
    pub min_memory: Option<u32>,
    pub max_memory: Option<u32>,
    pub launcher_name: String,
    pub launcher_brand: String,
    /// Concurrent downloads allowed to the installer.
    pub max_sockets: u32,
}

impl Default for SettingState {
    fn default() -> Self {
        Self {
            locale: "en".to_string(),
            min_memory: None,
            max_memory: None,
            launcher_name: "Lodestone".to_string(),
            launcher_brand: "lodestone".to_string(),
            max_sockets: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRange {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SettingMutation {
    LocaleSet(String),
    MemorySet(MemoryRange),
    LauncherNameSet(String),
    MaxSocketsSet(u32),
}

impl SyncState for SettingState {
    const NAME: &'static str = "SettingState";
    const MUTATIONS: &'static [&'static str] =
        &["localeSet", "memorySet", "launcherNameSet", "maxSocketsSet"];
    type Mutation = SettingMutation;

    fn apply(&mut self, mutation: &SettingMutation) {
        match mutation {
            SettingMutation::LocaleSet(locale) => self.locale = locale.clone(),
            SettingMutation::MemorySet(range) => {
                self.min_memory = range.min;
                self.max_memory = range.max;
            }
            SettingMutation::LauncherNameSet(name) => self.launcher_name = name.clone(),
            SettingMutation::MaxSocketsSet(n) => self.max_sockets = (*n).max(1),
        }
    }
}
