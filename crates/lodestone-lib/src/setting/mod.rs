//! User-editable launcher settings, mirrored to frontends and persisted
//! into `config.json`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::LauncherConfig;
use crate::error::{DispatchError, ServiceError};
use crate::service::{Args, CallOutcome, Service, ServiceKey};
use crate::states::{MemoryRange, SettingMutation, SettingState};
use crate::sync::{MutableState, MutationBus, StateRegistry, SubscriptionToken, SyncError, SyncState};

pub const SETTING_SERVICE: ServiceKey = "SettingService";

const SAVE_DELAY: Duration = Duration::from_millis(300);

pub struct SettingService {
    state: MutableState<SettingState>,
    config: Arc<Mutex<LauncherConfig>>,
    path: PathBuf,
    bus: MutationBus,
    persistence: Mutex<Option<(SubscriptionToken, JoinHandle<()>)>>,
}

impl SettingService {
    /// Seeds the `settings` state from `config`; changes are written back to
    /// `path` shortly after they happen.
    pub fn new(
        states: &StateRegistry,
        config: LauncherConfig,
        path: impl Into<PathBuf>,
    ) -> Result<Self, SyncError> {
        let state = states.register("settings", config.settings())?;
        state.activate();
        let service = Self {
            state,
            config: Arc::new(Mutex::new(config)),
            path: path.into(),
            bus: states.bus().clone(),
            persistence: Mutex::new(None),
        };
        service.start_persistence();
        Ok(service)
    }

    pub fn state(&self) -> &MutableState<SettingState> {
        &self.state
    }

    /// Current config with the live settings folded in.
    pub fn config(&self) -> LauncherConfig {
        let mut config = self
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        config.apply_settings(&self.state.read());
        config
    }

    pub fn set_locale(&self, locale: &str) -> Result<(), SyncError> {
        self.state.mutate(SettingMutation::LocaleSet(locale.to_string()))
    }

    pub fn set_memory(&self, range: MemoryRange) -> Result<(), SyncError> {
        if let (Some(min), Some(max)) = (range.min, range.max) {
            if min > max {
                log::warn!("[settings] Minimum memory {} exceeds maximum {}", min, max);
            }
        }
        self.state.mutate(SettingMutation::MemorySet(range))
    }

    pub fn set_launcher_name(&self, name: &str) -> Result<(), SyncError> {
        self.state
            .mutate(SettingMutation::LauncherNameSet(name.to_string()))
    }

    pub fn set_max_sockets(&self, max_sockets: u32) -> Result<(), SyncError> {
        self.state.mutate(SettingMutation::MaxSocketsSet(max_sockets))
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        save_config(&self.config, &self.state, &self.path).await
    }

    fn start_persistence(&self) {
        let notify = Arc::new(Notify::new());
        let trigger = notify.clone();
        let subscription = self
            .bus
            .subscribe_all(SettingState::MUTATIONS, move |_| trigger.notify_one());
        let state = self.state.downgrade();
        let config = self.config.clone();
        let path = self.path.clone();
        let task = tokio::spawn(async move {
            loop {
                notify.notified().await;
                tokio::time::sleep(SAVE_DELAY).await;
                let Some(state) = state.upgrade() else { break };
                if let Err(e) = save_config(&config, &state, &path).await {
                    log::error!("[settings] Failed to save config: {:#}", e);
                }
            }
        });
        *self
            .persistence
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((subscription, task));
    }

    fn stop_persistence(&self) {
        let persistence = self
            .persistence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((subscription, task)) = persistence {
            self.bus.unsubscribe(&subscription);
            task.abort();
        }
    }
}

async fn save_config(
    config: &Mutex<LauncherConfig>,
    state: &MutableState<SettingState>,
    path: &std::path::Path,
) -> anyhow::Result<()> {
    let bytes = {
        let mut config = config.lock().unwrap_or_else(PoisonError::into_inner);
        config.apply_settings(&state.read());
        serde_json::to_vec_pretty(&*config)?
    };
    crate::utils::fs::write_atomic_async(path, bytes).await?;
    log::debug!("[settings] Saved config to {:?}", path);
    Ok(())
}

#[async_trait]
impl Service for SettingService {
    fn key(&self) -> ServiceKey {
        SETTING_SERVICE
    }

    fn methods(&self) -> &'static [&'static str] {
        &[
            "getSettings",
            "setLocale",
            "setMemory",
            "setLauncherName",
            "setMaxSockets",
        ]
    }

    async fn call(&self, method: &str, args: Args) -> Result<CallOutcome, ServiceError> {
        match method {
            "getSettings" => return Ok(CallOutcome::state(&self.state)),
            "setLocale" => self.set_locale(&args.get::<String>(0)?)?,
            "setMemory" => self.set_memory(args.get(0)?)?,
            "setLauncherName" => self.set_launcher_name(&args.get::<String>(0)?)?,
            "setMaxSockets" => self.set_max_sockets(args.get(0)?)?,
            _ => {
                return Err(DispatchError::ServiceMethodNotFound {
                    service: SETTING_SERVICE.to_string(),
                    method: method.to_string(),
                }
                .into())
            }
        }
        Ok(CallOutcome::unit())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.stop_persistence();
        self.save().await
    }
}
