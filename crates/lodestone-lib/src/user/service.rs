use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::account::{AccountSystem, LoginOptions, OfflineAccountSystem, UploadSkinOptions};
use super::cancel::CancelSlot;
use super::token::UserTokenStorage;
use super::yggdrasil::YggdrasilAccountSystem;
use super::UserError;
use crate::error::{DispatchError, ServiceError};
use crate::launch::UserStatusRefresher;
use crate::service::{Args, CallOutcome, Service, ServiceKey};
use crate::states::{ProfileSelection, UserMutation, UserProfile, UserState, YggdrasilApi};
use crate::sync::{MutableState, MutationBus, StateRegistry, SubscriptionToken};
use crate::utils::fs::write_atomic_async;

pub const USER_SERVICE: ServiceKey = "UserService";

/// Mutations that change what `user.json` holds.
const PERSISTED_MUTATIONS: &[&str] = &[
    "userProfile",
    "userProfileRemove",
    "userGameProfileSelect",
    "userSelect",
    "userInvalidate",
    "userYggdrasilServices",
];
const SAVE_DELAY: Duration = Duration::from_millis(500);

struct Persistence {
    subscription: SubscriptionToken,
    task: JoinHandle<()>,
}

pub struct UserService {
    state: MutableState<UserState>,
    tokens: Arc<dyn UserTokenStorage>,
    systems: RwLock<HashMap<String, Arc<dyn AccountSystem>>>,
    yggdrasil: Arc<dyn AccountSystem>,
    login_slot: CancelSlot,
    refresh_slot: CancelSlot,
    skin_slot: CancelSlot,
    path: PathBuf,
    bus: MutationBus,
    persistence: Mutex<Option<Persistence>>,
}

impl UserService {
    /// Load `path` (a missing file means no users) and register the user
    /// state. `default_services` seed the Yggdrasil server list when the
    /// file has none.
    pub async fn new(
        states: &StateRegistry,
        path: impl Into<PathBuf>,
        default_services: &[String],
        tokens: Arc<dyn UserTokenStorage>,
        client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let path = path.into();
        let mut data = load_user_file(&path).await?;
        if data.client_token.is_empty() {
            data.client_token = Uuid::new_v4().simple().to_string();
        }
        if data.yggdrasil_services.is_empty() {
            data.yggdrasil_services = default_services
                .iter()
                .map(|url| YggdrasilApi {
                    url: url.clone(),
                    name: None,
                })
                .collect();
        }
        log::info!("[user] Loaded {} users from {:?}", data.users.len(), path);

        let yggdrasil: Arc<dyn AccountSystem> = Arc::new(YggdrasilAccountSystem::new(
            client,
            tokens.clone(),
            data.client_token.clone(),
        ));
        let mut systems: HashMap<String, Arc<dyn AccountSystem>> = HashMap::new();
        systems.insert(
            "offline".to_string(),
            Arc::new(OfflineAccountSystem::new(tokens.clone())),
        );

        let state = states.register("user", data)?;
        state.activate();
        let service = Self {
            state,
            tokens,
            systems: RwLock::new(systems),
            yggdrasil,
            login_slot: CancelSlot::default(),
            refresh_slot: CancelSlot::default(),
            skin_slot: CancelSlot::default(),
            path,
            bus: states.bus().clone(),
            persistence: Mutex::new(None),
        };
        service.start_persistence();
        Ok(service)
    }

    pub fn state(&self) -> &MutableState<UserState> {
        &self.state
    }

    /// Use `system` for users whose auth service is `name`.
    pub fn register_account_system(&self, name: &str, system: Arc<dyn AccountSystem>) {
        self.systems
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), system);
    }

    fn system_for(&self, service: &str) -> Arc<dyn AccountSystem> {
        self.systems
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.yggdrasil.clone())
    }

    fn apply(&self, mutation: UserMutation) {
        if let Err(e) = self.state.mutate(mutation) {
            log::error!("[user] Failed to update user state: {}", e);
        }
    }

    fn user(&self, user_id: &str) -> Option<UserProfile> {
        self.state.with(|s| s.users.get(user_id).cloned())
    }

    pub async fn login(&self, options: LoginOptions) -> Result<UserProfile, UserError> {
        let guard = self.login_slot.begin();
        log::info!("[user] Logging in {} with {}", options.username, options.service);
        let system = self.system_for(&options.service);
        let profile = system.login(&options, guard.token()).await?;
        self.apply(UserMutation::UserProfile(profile.clone()));
        self.apply(UserMutation::UserSelect(profile.id.clone()));
        Ok(profile)
    }

    /// Validate and renew the token of `user_id`. Unknown users are skipped.
    pub async fn refresh_user(&self, user_id: &str) -> Result<(), UserError> {
        let Some(user) = self.user(user_id) else {
            log::debug!("[user] Skip refreshing unknown user {}", user_id);
            return Ok(());
        };
        let guard = self.refresh_slot.begin();
        let system = self.system_for(&user.auth_service);
        match system.refresh(&user, guard.token()).await {
            Ok(refreshed) => {
                self.apply(UserMutation::UserProfile(refreshed));
                Ok(())
            }
            Err(e) => {
                if e.invalidates_user() {
                    log::warn!("[user] Invalidating {}: {}", user.username, e);
                    self.apply(UserMutation::UserInvalidate(user.id.clone()));
                }
                Err(e)
            }
        }
    }

    pub async fn upload_skin(&self, options: UploadSkinOptions) -> Result<UserProfile, UserError> {
        let user = self.user(&options.user_id).ok_or_else(|| UserError::UnknownUser {
            user_id: options.user_id.clone(),
        })?;
        let profile_id = options
            .game_profile_id
            .clone()
            .unwrap_or_else(|| user.selected_profile.clone());
        let profile = user
            .profiles
            .get(&profile_id)
            .cloned()
            .ok_or_else(|| UserError::UnknownGameProfile {
                user_id: user.id.clone(),
                profile_id: profile_id.clone(),
            })?;
        let skin = options.skin.ok_or_else(|| UserError::General {
            message: "no skin to upload".to_string(),
        })?;
        let token = self.tokens.get(&user).await.map_err(UserError::storage)?;
        if token.is_none() || user.invalidated {
            return Err(UserError::Authentication {
                message: format!("{} must log in again to change skins", user.username),
            });
        }

        log::info!("[user] Uploading skin of {}({})", profile.name, profile.id);
        let guard = self.skin_slot.begin();
        let system = self.system_for(&user.auth_service);
        let updated = system.set_skin(&user, &profile, &skin, guard.token()).await?;
        self.apply(UserMutation::UserProfile(updated.clone()));
        Ok(updated)
    }

    pub fn select_game_profile(&self, user_id: &str, profile_id: &str) -> bool {
        let exists = self.state.with(|s| {
            s.users
                .get(user_id)
                .is_some_and(|u| u.profiles.contains_key(profile_id))
        });
        if exists {
            self.apply(UserMutation::UserGameProfileSelect(ProfileSelection {
                user_id: user_id.to_string(),
                profile_id: profile_id.to_string(),
            }));
        }
        exists
    }

    pub fn select_user(&self, user_id: &str) -> Result<(), UserError> {
        if self.user(user_id).is_none() {
            return Err(UserError::UnknownUser {
                user_id: user_id.to_string(),
            });
        }
        self.apply(UserMutation::UserSelect(user_id.to_string()));
        Ok(())
    }

    pub async fn remove_user(&self, user_id: &str) {
        let Some(user) = self.user(user_id) else {
            return;
        };
        self.apply(UserMutation::UserProfileRemove(user_id.to_string()));
        if let Err(e) = self.tokens.remove(&user).await {
            log::warn!("[user] Failed to forget the token of {}: {:#}", user_id, e);
        }
    }

    pub fn put_user(&self, user: UserProfile) {
        self.apply(UserMutation::UserProfile(user));
    }

    pub fn add_yggdrasil_service(&self, url: &str) {
        let url = url.trim_end_matches('/').to_string();
        let mut services = self.state.with(|s| s.yggdrasil_services.clone());
        if services.iter().any(|s| s.url == url) {
            return;
        }
        log::info!("[user] Adding Yggdrasil service {}", url);
        services.push(YggdrasilApi { url, name: None });
        self.apply(UserMutation::UserYggdrasilServices(services));
    }

    pub fn remove_yggdrasil_service(&self, url: &str) {
        let mut services = self.state.with(|s| s.yggdrasil_services.clone());
        let before = services.len();
        services.retain(|s| s.url != url);
        if services.len() != before {
            self.apply(UserMutation::UserYggdrasilServices(services));
        }
    }

    pub fn abort_login(&self) -> bool {
        self.login_slot.abort()
    }

    pub fn abort_refresh(&self) -> bool {
        self.refresh_slot.abort()
    }

    pub fn abort_upload_skin(&self) -> bool {
        self.skin_slot.abort()
    }

    /// Write `user.json` now.
    pub async fn save(&self) -> anyhow::Result<()> {
        save_user_file(&self.path, &self.state.read()).await
    }

    fn start_persistence(&self) {
        let notify = Arc::new(Notify::new());
        let trigger = notify.clone();
        let subscription = self
            .bus
            .subscribe_all(PERSISTED_MUTATIONS, move |_| trigger.notify_one());
        let state = self.state.downgrade();
        let path = self.path.clone();
        let task = tokio::spawn(async move {
            loop {
                notify.notified().await;
                // coalesce bursts of mutations into one write
                tokio::time::sleep(SAVE_DELAY).await;
                let Some(state) = state.upgrade() else { break };
                if let Err(e) = save_user_file(&path, &state.read()).await {
                    log::error!("[user] Failed to save users: {:#}", e);
                }
            }
        });
        *self
            .persistence
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Persistence { subscription, task });
    }

    fn stop_persistence(&self) {
        let persistence = self
            .persistence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(persistence) = persistence {
            self.bus.unsubscribe(&persistence.subscription);
            persistence.task.abort();
        }
    }
}

async fn load_user_file(path: &Path) -> anyhow::Result<UserState> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse user file {:?}", path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UserState::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read user file {:?}", path)),
    }
}

async fn save_user_file(path: &Path, state: &UserState) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(state)?;
    write_atomic_async(path, bytes).await?;
    log::debug!("[user] Saved {} users to {:?}", state.users.len(), path);
    Ok(())
}

#[async_trait]
impl UserStatusRefresher for UserService {
    async fn refresh_user_status(&self, user_id: &str) -> Result<(), UserError> {
        self.refresh_user(user_id).await
    }
}

#[async_trait]
impl Service for UserService {
    fn key(&self) -> ServiceKey {
        USER_SERVICE
    }

    fn methods(&self) -> &'static [&'static str] {
        &[
            "getUserState",
            "login",
            "refreshUser",
            "uploadSkin",
            "selectGameProfile",
            "selectUser",
            "removeUser",
            "putUser",
            "addYggdrasilService",
            "removeYggdrasilService",
            "abortLogin",
            "abortRefresh",
            "abortUploadSkin",
        ]
    }

    async fn call(&self, method: &str, args: Args) -> Result<CallOutcome, ServiceError> {
        match method {
            "getUserState" => Ok(CallOutcome::state(&self.state)),
            "login" => CallOutcome::value(self.login(args.get(0)?).await?),
            "refreshUser" => {
                self.refresh_user(&args.get::<String>(0)?).await?;
                Ok(CallOutcome::unit())
            }
            "uploadSkin" => CallOutcome::value(self.upload_skin(args.get(0)?).await?),
            "selectGameProfile" => CallOutcome::value(
                self.select_game_profile(&args.get::<String>(0)?, &args.get::<String>(1)?),
            ),
            "selectUser" => {
                self.select_user(&args.get::<String>(0)?)?;
                Ok(CallOutcome::unit())
            }
            "removeUser" => {
                self.remove_user(&args.get::<String>(0)?).await;
                Ok(CallOutcome::unit())
            }
            "putUser" => {
                self.put_user(args.get(0)?);
                Ok(CallOutcome::unit())
            }
            "addYggdrasilService" => {
                self.add_yggdrasil_service(&args.get::<String>(0)?);
                Ok(CallOutcome::unit())
            }
            "removeYggdrasilService" => {
                self.remove_yggdrasil_service(&args.get::<String>(0)?);
                Ok(CallOutcome::unit())
            }
            "abortLogin" => CallOutcome::value(self.abort_login()),
            "abortRefresh" => CallOutcome::value(self.abort_refresh()),
            "abortUploadSkin" => CallOutcome::value(self.abort_upload_skin()),
            _ => Err(DispatchError::ServiceMethodNotFound {
                service: USER_SERVICE.to_string(),
                method: method.to_string(),
            }
            .into()),
        }
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.login_slot.abort();
        self.refresh_slot.abort();
        self.skin_slot.abort();
        self.stop_persistence();
        self.save().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{CancelToken, MemoryTokenStorage, SkinUpload};
    use crate::states::GameProfile;

    async fn service(dir: &Path) -> UserService {
        UserService::new(
            &StateRegistry::default(),
            dir.join("user.json"),
            &["https://littleskin.cn/api/yggdrasil".to_string()],
            Arc::new(MemoryTokenStorage::new()),
            reqwest::Client::new(),
        )
        .await
        .unwrap()
    }

    fn offline_login(name: &str) -> LoginOptions {
        LoginOptions {
            username: name.into(),
            service: "offline".into(),
            ..Default::default()
        }
    }

    struct StubbornSystem;

    #[async_trait]
    impl AccountSystem for StubbornSystem {
        async fn login(&self, _: &LoginOptions, cancel: CancelToken) -> Result<UserProfile, UserError> {
            cancel
                .run("login", async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(UserError::General { message: "unreachable".into() })
                })
                .await
        }

        async fn refresh(&self, _: &UserProfile, _: CancelToken) -> Result<UserProfile, UserError> {
            Err(UserError::InvalidCredentials { message: "expired".into() })
        }

        async fn set_skin(
            &self,
            user: &UserProfile,
            _: &GameProfile,
            _: &SkinUpload,
            _: CancelToken,
        ) -> Result<UserProfile, UserError> {
            Ok(user.clone())
        }
    }

    #[tokio::test]
    async fn seeds_client_token_and_services() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let state = service.state().read();
        assert!(!state.client_token.is_empty());
        assert_eq!(state.yggdrasil_services.len(), 1);
    }

    #[tokio::test]
    async fn offline_login_selects_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let user = service.login(offline_login("Alex")).await.unwrap();
        assert_eq!(service.state().read().selected_user.as_deref(), Some(user.id.as_str()));

        service.save().await.unwrap();
        let saved: UserState =
            serde_json::from_slice(&tokio::fs::read(dir.path().join("user.json")).await.unwrap()).unwrap();
        assert!(saved.users.contains_key(&user.id));
    }

    #[tokio::test]
    async fn mutations_are_saved_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        service.login(offline_login("Alex")).await.unwrap();
        tokio::time::sleep(SAVE_DELAY * 3).await;
        assert!(tokio::fs::try_exists(dir.path().join("user.json")).await.unwrap());
    }

    #[tokio::test]
    async fn abort_login_cancels_in_flight_login() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(service(dir.path()).await);
        service.register_account_system("stubborn", Arc::new(StubbornSystem));
        let login = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .login(LoginOptions {
                        username: "x".into(),
                        service: "stubborn".into(),
                        ..Default::default()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.abort_login());
        let err = login.await.unwrap().unwrap_err();
        assert!(matches!(err, UserError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn failed_refresh_invalidates_user() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        service.register_account_system("stubborn", Arc::new(StubbornSystem));
        service.put_user(UserProfile {
            id: "u1".into(),
            username: "steve".into(),
            auth_service: "stubborn".into(),
            ..Default::default()
        });
        let err = service.refresh_user("u1").await.unwrap_err();
        assert_eq!(crate::error::ErrorKind::kind(&err), "LoginInvalidCredentials");
        assert!(service.state().read().users["u1"].invalidated);
        assert!(service.refresh_user("nobody").await.is_ok());
    }

    #[tokio::test]
    async fn upload_skin_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let mut user = UserProfile {
            id: "u1".into(),
            username: "steve".into(),
            auth_service: "offline".into(),
            selected_profile: "p1".into(),
            ..Default::default()
        };
        user.profiles.insert(
            "p1".into(),
            GameProfile {
                id: "p1".into(),
                name: "Steve".into(),
                skin: None,
            },
        );
        service.put_user(user);
        let err = service
            .upload_skin(UploadSkinOptions {
                user_id: "u1".into(),
                game_profile_id: None,
                skin: Some(SkinUpload {
                    url: "/tmp/skin.png".into(),
                    slim: true,
                }),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::Authentication { .. }));
    }

    #[tokio::test]
    async fn select_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;
        let user = service.login(offline_login("Alex")).await.unwrap();
        assert!(service.select_game_profile(&user.id, &user.selected_profile));
        assert!(!service.select_game_profile(&user.id, "missing"));
        assert!(service.select_user("missing").is_err());

        service.remove_user(&user.id).await;
        assert!(service.state().read().users.is_empty());
        assert_eq!(service.state().read().selected_user, None);
    }
}
