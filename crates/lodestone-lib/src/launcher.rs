//! Construction of the whole backend from a data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::LauncherConfig;
use crate::java::{JavaService, JavaValidator};
use crate::launch::authlib::{AuthlibInjector, LocalAuthlibInjector};
use crate::launch::content::{ContentLinker, SharedFolderLinker};
use crate::launch::diagnose::{Diagnoser, DownloadInstaller, Installer, LocalDiagnoser};
use crate::launch::process::{DetachedSpawner, ProcessSpawner};
use crate::launch::version::{LocalVersionResolver, VersionResolver};
use crate::launch::{LaunchDependencies, LaunchService};
use crate::service::{EventHub, ServiceDispatcher, ServiceRegistry};
use crate::setting::SettingService;
use crate::states::descriptor_table;
use crate::sync::StateRegistry;
use crate::transport::{self, TransportClient};
use crate::user::{FileTokenStorage, UserService, UserTokenStorage};

const USER_AGENT: &str = concat!("Lodestone/", env!("CARGO_PKG_VERSION"));

/// Replaceable collaborators of the launch pipeline.
///
/// `java` defaults to the [`JavaService`] itself when left empty.
#[derive(Clone)]
pub struct LauncherCollaborators {
    pub client: reqwest::Client,
    pub resolver: Arc<dyn VersionResolver>,
    pub diagnoser: Arc<dyn Diagnoser>,
    pub installer: Arc<dyn Installer>,
    pub authlib: Arc<dyn AuthlibInjector>,
    pub linkers: Vec<Arc<dyn ContentLinker>>,
    pub java: Option<Arc<dyn JavaValidator>>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub tokens: Arc<dyn UserTokenStorage>,
}

impl LauncherCollaborators {
    pub fn with_defaults(root: &Path, config: &LauncherConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            resolver: Arc::new(LocalVersionResolver::new(root)),
            diagnoser: Arc::new(LocalDiagnoser),
            installer: Arc::new(DownloadInstaller::new(
                client.clone(),
                config.max_sockets as usize,
            )),
            authlib: Arc::new(LocalAuthlibInjector::new(root, client.clone())),
            linkers: vec![
                Arc::new(SharedFolderLinker::shader_packs(root)),
                Arc::new(SharedFolderLinker::resource_packs(root)),
            ],
            java: None,
            spawner: Arc::new(DetachedSpawner),
            tokens: Arc::new(FileTokenStorage::new(root.join("tokens.json"))),
            client,
        }
    }
}

/// Every backend service, wired to one dispatcher.
pub struct Launcher {
    root: PathBuf,
    dispatcher: Arc<ServiceDispatcher>,
    settings: Arc<SettingService>,
    user: Arc<UserService>,
    java: Arc<JavaService>,
    launch: Arc<LaunchService>,
}

impl Launcher {
    pub async fn with_defaults(root: impl Into<PathBuf>, config: LauncherConfig) -> anyhow::Result<Self> {
        let root = root.into();
        let collaborators = LauncherCollaborators::with_defaults(&root, &config);
        Self::new(root, config, collaborators).await
    }

    pub async fn new(
        root: impl Into<PathBuf>,
        config: LauncherConfig,
        collaborators: LauncherCollaborators,
    ) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create data directory {:?}", root))?;
        log::info!("[services] Starting backend in {:?}", root);

        let states = StateRegistry::default();
        let events = EventHub::default();
        let yggdrasil_services = config.yggdrasil_services.clone();

        let settings = Arc::new(SettingService::new(
            &states,
            config,
            root.join("config.json"),
        )?);
        let user = Arc::new(
            UserService::new(
                &states,
                root.join("user.json"),
                &yggdrasil_services,
                collaborators.tokens.clone(),
                collaborators.client.clone(),
            )
            .await?,
        );
        let java = Arc::new(JavaService::new(&states)?);
        let validator: Arc<dyn JavaValidator> = match collaborators.java {
            Some(validator) => validator,
            None => java.clone(),
        };
        let launch = Arc::new(LaunchService::new(
            &states,
            settings.state().clone(),
            events.clone(),
            &root,
            LaunchDependencies {
                resolver: collaborators.resolver,
                diagnoser: collaborators.diagnoser,
                installer: collaborators.installer,
                authlib: collaborators.authlib,
                linkers: collaborators.linkers,
                java: validator,
                spawner: collaborators.spawner,
                tokens: collaborators.tokens,
                users: user.clone(),
            },
        )?);

        let mut services = ServiceRegistry::new();
        services.register(settings.clone());
        services.register(user.clone());
        services.register(java.clone());
        services.register(launch.clone());

        Ok(Self {
            root,
            dispatcher: Arc::new(ServiceDispatcher::new(services, states, events)),
            settings,
            user,
            java,
            launch,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dispatcher(&self) -> &Arc<ServiceDispatcher> {
        &self.dispatcher
    }

    pub fn settings(&self) -> &Arc<SettingService> {
        &self.settings
    }

    pub fn user(&self) -> &Arc<UserService> {
        &self.user
    }

    pub fn java(&self) -> &Arc<JavaService> {
        &self.java
    }

    pub fn launch(&self) -> &Arc<LaunchService> {
        &self.launch
    }

    /// A frontend living in this process.
    pub fn connect(&self) -> TransportClient {
        transport::connect_in_process(self.dispatcher.clone(), descriptor_table())
    }

    /// Serves one JSON-lines frontend until its input ends.
    pub async fn serve_lines<R, W>(&self, reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        transport::serve_lines(self.dispatcher.clone(), reader, writer).await
    }

    /// Disposes every service and flushes persisted files.
    ///
    /// Services no frontend has touched were never initialized and are not
    /// disposed by the dispatcher, so their files are written here.
    pub async fn shutdown(&self) {
        log::info!("[services] Shutting down");
        self.launch.cancel();
        self.dispatcher.shutdown().await;
        if let Err(e) = self.user.save().await {
            log::error!("[services] Failed to save users: {:#}", e);
        }
        if let Err(e) = self.settings.save().await {
            log::error!("[services] Failed to save config: {:#}", e);
        }
    }
}
