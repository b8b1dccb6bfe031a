use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Child;
use tokio::sync::oneshot;

use super::arguments::{build_command, CommandInput};
use super::authlib::{AuthlibAgent, AuthlibInjector};
use super::content::ContentLinker;
use super::diagnose::{Diagnoser, Installer};
use super::process::{self, LineCallback, OutputStream, ProcessExit, ProcessSpawner};
use super::registry::{LaunchSession, ProcessRegistry};
use super::types::{
    LaunchCommand, LaunchOptions, MinecraftExit, MinecraftOutput, MinecraftStart,
    MinecraftWindowReady,
};
use super::version::{ResolvedVersion, VersionResolver};
use super::LaunchError;
use crate::error::{DispatchError, SerializedError, ServiceError};
use crate::java::{JavaValidation, JavaValidator};
use crate::service::{Args, CallOutcome, EventHub, Service, ServiceKey};
use crate::states::{LaunchMutation, LaunchState, LaunchStatus, SettingState, UserProfile};
use crate::sync::{MutableState, StateRegistry, SyncError};
use crate::user::{UserError, UserTokenStorage};

pub const LAUNCH_SERVICE: ServiceKey = "LaunchService";

/// Refreshes an account before its token is used to launch.
#[async_trait]
pub trait UserStatusRefresher: Send + Sync {
    async fn refresh_user_status(&self, user_id: &str) -> Result<(), UserError>;
}

/// Collaborators of [`LaunchService`], one per launch phase.
#[derive(Clone)]
pub struct LaunchDependencies {
    pub resolver: Arc<dyn VersionResolver>,
    pub diagnoser: Arc<dyn Diagnoser>,
    pub installer: Arc<dyn Installer>,
    pub authlib: Arc<dyn AuthlibInjector>,
    pub linkers: Vec<Arc<dyn ContentLinker>>,
    pub java: Arc<dyn JavaValidator>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub tokens: Arc<dyn UserTokenStorage>,
    pub users: Arc<dyn UserStatusRefresher>,
}

/// Serializes read-modify-write updates of `activeCount`.
#[derive(Clone)]
struct ActiveCounter {
    state: MutableState<LaunchState>,
    lock: Arc<Mutex<()>>,
}

impl ActiveCounter {
    fn adjust(&self, delta: i64) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = (self.state.with(|s| s.active_count) as i64 + delta).max(0);
        if let Err(e) = self.state.mutate(LaunchMutation::LaunchCount(next)) {
            log::error!("[launch] Failed to update active count: {}", e);
        }
    }
}

pub struct LaunchService {
    state: MutableState<LaunchState>,
    settings: MutableState<SettingState>,
    events: EventHub,
    root: PathBuf,
    deps: LaunchDependencies,
    /// Bumped by every launch and every cancel. A launch whose ticket no
    /// longer matches has been cancelled.
    generation: AtomicU64,
    transition: Mutex<()>,
    counter: ActiveCounter,
    processes: ProcessRegistry,
}

impl LaunchService {
    pub fn new(
        states: &StateRegistry,
        settings: MutableState<SettingState>,
        events: EventHub,
        root: impl Into<PathBuf>,
        deps: LaunchDependencies,
    ) -> Result<Self, SyncError> {
        let state = states.register("launch", LaunchState::default())?;
        state.activate();
        Ok(Self {
            counter: ActiveCounter {
                state: state.clone(),
                lock: Arc::new(Mutex::new(())),
            },
            state,
            settings,
            events,
            root: root.into(),
            deps,
            generation: AtomicU64::new(0),
            transition: Mutex::new(()),
            processes: ProcessRegistry::new(),
        })
    }

    pub fn state(&self) -> &MutableState<LaunchState> {
        &self.state
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    /// Launch a game. `Ok(false)` means nothing was started: another launch
    /// is in progress, or this one was cancelled.
    pub async fn launch(&self, options: LaunchOptions) -> Result<bool, LaunchError> {
        let Some(ticket) = self.begin() else {
            log::warn!(
                "[launch] Ignoring launch of {} while status is {:?}",
                options.version,
                self.state.with(|s| s.status)
            );
            return Ok(false);
        };
        log::info!(
            "[launch] Launching {} in {:?}",
            options.version,
            options.game_directory
        );
        let result = self.run(ticket, &options).await;
        self.finish(ticket);
        if let Err(e) = &result {
            log::error!("[launch] Failed to launch {}: {}", options.version, e);
        }
        result
    }

    /// Reset the status to idle, abandoning a launch between phases.
    pub fn cancel(&self) -> bool {
        let _guard = self.transition();
        if self.state.with(|s| s.status) == LaunchStatus::Idle {
            return false;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.set_status(LaunchStatus::Idle);
        log::info!("[launch] Launch cancelled");
        true
    }

    /// Terminate the most recently started game.
    pub async fn kill(&self) -> bool {
        match self.processes.kill_latest().await {
            Some(session) => {
                log::info!("[launch] Killing game session {} (PID {:?})", session.id, session.pid);
                true
            }
            None => false,
        }
    }

    /// The command line `launch` would run, without running it.
    pub async fn generate_arguments(&self, options: &LaunchOptions) -> Result<Vec<String>, LaunchError> {
        let version = self.resolve_version(&options.version).await?;
        let agent = if self.deps.authlib.requires_injector(&options.user) {
            self.prepare_authlib(&options.user).await.ok()
        } else {
            None
        };
        let token = self.access_token(&options.user).await;
        Ok(self
            .command(options, &version, token.as_deref(), agent.as_ref())
            .argv())
    }

    fn transition(&self) -> std::sync::MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: LaunchStatus) {
        if let Err(e) = self.state.mutate(LaunchMutation::LaunchStatus(status)) {
            log::error!("[launch] Failed to set status {:?}: {}", status, e);
        }
    }

    fn begin(&self) -> Option<u64> {
        let _guard = self.transition();
        if self.state.with(|s| s.status) != LaunchStatus::Idle {
            return None;
        }
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_status(LaunchStatus::CheckingProblems);
        Some(ticket)
    }

    /// Move to `status` unless the launch was cancelled meanwhile.
    fn advance(&self, ticket: u64, status: LaunchStatus) {
        let _guard = self.transition();
        if self.generation.load(Ordering::SeqCst) == ticket {
            self.set_status(status);
        }
    }

    fn finish(&self, ticket: u64) {
        let _guard = self.transition();
        if self.generation.load(Ordering::SeqCst) == ticket {
            self.set_status(LaunchStatus::Idle);
        }
    }

    fn is_cancelled(&self, ticket: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != ticket
            || self.state.with(|s| s.status) == LaunchStatus::Idle
    }

    async fn run(&self, ticket: u64, options: &LaunchOptions) -> Result<bool, LaunchError> {
        if !options.skip_user_refresh {
            self.refresh_user(&options.user).await;
        }
        self.link_content(options).await;

        if self.is_cancelled(ticket) {
            log::info!("[launch] Launch of {} was cancelled", options.version);
            return Ok(false);
        }

        let agent = if self.deps.authlib.requires_injector(&options.user) {
            self.advance(ticket, LaunchStatus::InjectingAuthLib);
            match self.prepare_authlib(&options.user).await {
                Ok(agent) => Some(agent),
                Err(e) => {
                    log::warn!("[launch] Continuing without authlib-injector: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let version = self.resolve_version(&options.version).await?;
        if !options.skip_assets_check {
            self.repair(&version).await.map_err(LaunchError::general)?;
        }

        self.advance(ticket, LaunchStatus::Launching);
        self.validate_java(&options.java).await?;

        let token = self.access_token(&options.user).await;
        let command = self.command(options, &version, token.as_deref(), agent.as_ref());
        log::info!("[launch] Exec: {}", command.display_redacted(token.as_deref()));

        let child = self
            .deps
            .spawner
            .spawn(&command)
            .with_context(|| format!("Failed to spawn {:?}", command.program))
            .map_err(LaunchError::general)?;
        self.supervise(child, options, &version).await;
        Ok(true)
    }

    async fn refresh_user(&self, user: &UserProfile) {
        if let Err(source) = self.deps.users.refresh_user_status(&user.id).await {
            log::warn!("[launch] Failed to refresh user {}: {}", user.id, source);
            let err = LaunchError::UserStatusRefreshFailed {
                user_id: user.id.clone(),
                source,
            };
            self.events.emit(
                LAUNCH_SERVICE,
                "error",
                SerializedError::from_error("LaunchError", &err),
            );
        }
    }

    async fn link_content(&self, options: &LaunchOptions) {
        let dir = &options.game_directory;
        let results = futures::future::join_all(
            self.deps
                .linkers
                .iter()
                .map(|linker| async move { (linker.name(), linker.link(dir).await) }),
        )
        .await;
        for (name, result) in results {
            if let Err(e) = result {
                log::warn!("[launch] Failed to link {} into {:?}: {:#}", name, dir, e);
            }
        }
    }

    async fn prepare_authlib(&self, user: &UserProfile) -> anyhow::Result<AuthlibAgent> {
        let jar = self.deps.authlib.get_or_install().await?;
        let host = self
            .deps
            .authlib
            .yggdrasil_host(user)
            .with_context(|| format!("No Yggdrasil host for {}", user.auth_service))?;
        Ok(AuthlibAgent { jar, host })
    }

    async fn resolve_version(&self, version: &str) -> Result<ResolvedVersion, LaunchError> {
        self.deps
            .resolver
            .resolve(version)
            .await
            .map_err(|source| LaunchError::NoVersionInstalled {
                version: version.to_string(),
                source,
            })
    }

    async fn repair(&self, version: &ResolvedVersion) -> anyhow::Result<()> {
        let (jar, libraries) = tokio::try_join!(
            self.deps.diagnoser.diagnose_jar(version),
            self.deps.diagnoser.diagnose_libraries(version),
        )?;
        let install_jar = async {
            if let Some(issue) = jar {
                log::info!("[launch] Game jar is {:?}, repairing", issue.kind);
                self.deps
                    .installer
                    .install_jar(version)
                    .await
                    .context("Failed to repair the game jar")?;
            }
            anyhow::Ok(())
        };
        let install_libraries = async {
            if !libraries.is_empty() {
                log::info!("[launch] Repairing {} libraries", libraries.len());
                self.deps
                    .installer
                    .install_libraries(&libraries)
                    .await
                    .context("Failed to repair libraries")?;
            }
            anyhow::Ok(())
        };
        tokio::try_join!(install_jar, install_libraries)?;
        Ok(())
    }

    async fn validate_java(&self, java: &str) -> Result<(), LaunchError> {
        let java_path = java.to_string();
        if java.trim().is_empty() {
            return Err(LaunchError::NoProperJava { java_path });
        }
        match self.deps.java.validate(java).await {
            Ok(JavaValidation::Okay) => Ok(()),
            Ok(JavaValidation::NotExisted) => Err(LaunchError::InvalidJavaPath { java_path }),
            Ok(JavaValidation::NoPermission) => Err(LaunchError::JavaNoPermission { java_path }),
            Err(e) => {
                log::warn!("[launch] Failed to validate java {}: {:#}", java, e);
                Err(LaunchError::NoProperJava { java_path })
            }
        }
    }

    async fn access_token(&self, user: &UserProfile) -> Option<String> {
        match self.deps.tokens.get(user).await {
            Ok(token) => token,
            Err(e) => {
                log::warn!("[launch] Failed to read the token of {}: {:#}", user.id, e);
                None
            }
        }
    }

    fn command(
        &self,
        options: &LaunchOptions,
        version: &ResolvedVersion,
        token: Option<&str>,
        agent: Option<&AuthlibAgent>,
    ) -> LaunchCommand {
        let settings = self.settings.read();
        build_command(&CommandInput {
            options,
            version,
            root: &self.root,
            access_token: token,
            authlib: agent,
            launcher_name: options
                .launcher_name
                .as_deref()
                .unwrap_or(&settings.launcher_name),
            launcher_brand: options
                .launcher_brand
                .as_deref()
                .unwrap_or(&settings.launcher_brand),
            min_memory: options.min_memory.or(settings.min_memory),
            max_memory: options.max_memory.or(settings.max_memory),
        })
    }

    async fn supervise(&self, child: Child, options: &LaunchOptions, version: &ResolvedVersion) {
        let pid = child.id();
        let session = LaunchSession {
            id: self.processes.next_id(),
            pid,
            version: version.id.clone(),
            minecraft: version.minecraft_version.clone(),
            java: options.java.clone(),
            game_directory: options.game_directory.clone(),
            started_at: Utc::now(),
        };
        let (kill_tx, kill_rx) = oneshot::channel();
        self.processes.register(session.clone(), kill_tx).await;
        self.counter.adjust(1);
        log::info!("[launch] Game started with PID {:?}", pid);
        self.events.emit(
            LAUNCH_SERVICE,
            "minecraft-start",
            MinecraftStart {
                pid,
                version: session.version.clone(),
                minecraft: session.minecraft.clone(),
                game_directory: session.game_directory.clone(),
            },
        );

        let events = self.events.clone();
        let counter = self.counter.clone();
        let processes = self.processes.clone();
        tokio::spawn(async move {
            let output = events.clone();
            let window_ready = AtomicBool::new(false);
            let ready_payload = MinecraftWindowReady {
                pid,
                version: session.version.clone(),
                game_directory: session.game_directory.clone(),
            };
            let on_line: LineCallback = Arc::new(move |stream: OutputStream, line: &str| {
                output.emit(
                    LAUNCH_SERVICE,
                    stream.event_name(),
                    MinecraftOutput {
                        pid,
                        line: line.to_string(),
                    },
                );
                if process::is_window_ready(line) && !window_ready.swap(true, Ordering::SeqCst) {
                    log::info!("[launch] Game window of {:?} is ready", pid);
                    output.emit(LAUNCH_SERVICE, "minecraft-window-ready", ready_payload.clone());
                }
            });
            let started = std::time::Instant::now();
            let exit = match process::watch(child, kill_rx, on_line).await {
                Ok(exit) => exit,
                Err(e) => {
                    log::error!("[launch] Lost track of game process {:?}: {}", pid, e);
                    let err = LaunchError::general(e);
                    events.emit(
                        LAUNCH_SERVICE,
                        "error",
                        SerializedError::from_error("LaunchError", &err),
                    );
                    ProcessExit {
                        duration: started.elapsed(),
                        ..Default::default()
                    }
                }
            };

            let crash_report = match &exit.crash_report_location {
                Some(location) => tokio::fs::read_to_string(location).await.ok(),
                None => None,
            };
            log::info!(
                "[launch] Game {:?} exited with code {:?} signal {:?} after {:?}",
                pid,
                exit.code,
                exit.signal,
                exit.duration
            );
            events.emit(
                LAUNCH_SERVICE,
                "minecraft-exit",
                MinecraftExit {
                    pid,
                    code: exit.code,
                    signal: exit.signal,
                    duration: exit.duration.as_millis() as u64,
                    crash_report,
                    crash_report_location: exit.crash_report_location,
                    error_log: exit.stderr.join("\n"),
                    version: session.version.clone(),
                    game_directory: session.game_directory.clone(),
                },
            );
            counter.adjust(-1);
            processes.unregister(session.id).await;
        });
    }
}

#[async_trait]
impl Service for LaunchService {
    fn key(&self) -> ServiceKey {
        LAUNCH_SERVICE
    }

    fn methods(&self) -> &'static [&'static str] {
        &[
            "getLaunchState",
            "launch",
            "kill",
            "cancel",
            "generateArguments",
            "getRunningProcesses",
        ]
    }

    async fn call(&self, method: &str, args: Args) -> Result<CallOutcome, ServiceError> {
        match method {
            "getLaunchState" => Ok(CallOutcome::state(&self.state)),
            "launch" => CallOutcome::value(self.launch(args.get(0)?).await?),
            "kill" => CallOutcome::value(self.kill().await),
            "cancel" => CallOutcome::value(self.cancel()),
            "generateArguments" => {
                CallOutcome::value(self.generate_arguments(&args.get(0)?).await?)
            }
            "getRunningProcesses" => CallOutcome::value(self.processes.get_all().await),
            _ => Err(DispatchError::ServiceMethodNotFound {
                service: LAUNCH_SERVICE.to_string(),
                method: method.to_string(),
            }
            .into()),
        }
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.cancel();
        Ok(())
    }
}
