//! Account systems: how users of one auth service log in.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cancel::CancelToken;
use super::token::UserTokenStorage;
use super::UserError;
use crate::states::{GameProfile, SkinInfo, UserProfile};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginOptions {
    pub username: String,
    pub password: Option<String>,
    /// `offline`, or the API root of a Yggdrasil server.
    pub service: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadSkinOptions {
    pub user_id: String,
    pub game_profile_id: Option<String>,
    pub skin: Option<SkinUpload>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkinUpload {
    /// `http(s)` url or a local file path.
    pub url: String,
    pub slim: bool,
}

#[async_trait]
pub trait AccountSystem: Send + Sync {
    async fn login(&self, options: &LoginOptions, cancel: CancelToken) -> Result<UserProfile, UserError>;

    /// Validate the user's token, renewing it if needed.
    async fn refresh(&self, user: &UserProfile, cancel: CancelToken) -> Result<UserProfile, UserError>;

    async fn set_skin(
        &self,
        user: &UserProfile,
        profile: &GameProfile,
        skin: &SkinUpload,
        cancel: CancelToken,
    ) -> Result<UserProfile, UserError>;
}

/// Accounts that never talk to a server.
pub struct OfflineAccountSystem {
    tokens: Arc<dyn UserTokenStorage>,
}

impl OfflineAccountSystem {
    pub fn new(tokens: Arc<dyn UserTokenStorage>) -> Self {
        Self { tokens }
    }
}

/// Stable id of an offline player name.
pub fn offline_uuid(name: &str) -> String {
    Uuid::new_v3(&Uuid::NAMESPACE_OID, format!("OfflinePlayer:{name}").as_bytes())
        .simple()
        .to_string()
}

fn is_valid_player_name(name: &str) -> bool {
    (1..=16).contains(&name.len()) && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl AccountSystem for OfflineAccountSystem {
    async fn login(&self, options: &LoginOptions, _cancel: CancelToken) -> Result<UserProfile, UserError> {
        let name = options.username.trim();
        if !is_valid_player_name(name) {
            return Err(UserError::InvalidCredentials {
                message: format!("{name:?} is not a valid player name"),
            });
        }
        let id = offline_uuid(name);
        let user = UserProfile {
            id: id.clone(),
            username: name.to_string(),
            auth_service: "offline".to_string(),
            invalidated: false,
            expired_at: i64::MAX,
            profiles: BTreeMap::from([(
                id.clone(),
                GameProfile {
                    id: id.clone(),
                    name: name.to_string(),
                    skin: None,
                },
            )]),
            selected_profile: id,
        };
        self.tokens
            .put(&user, &Uuid::new_v4().simple().to_string())
            .await
            .map_err(UserError::storage)?;
        Ok(user)
    }

    async fn refresh(&self, user: &UserProfile, _cancel: CancelToken) -> Result<UserProfile, UserError> {
        Ok(user.clone())
    }

    async fn set_skin(
        &self,
        user: &UserProfile,
        profile: &GameProfile,
        skin: &SkinUpload,
        _cancel: CancelToken,
    ) -> Result<UserProfile, UserError> {
        Ok(with_skin(user, &profile.id, skin))
    }
}

/// `user` with the skin of one of its profiles replaced.
pub fn with_skin(user: &UserProfile, profile_id: &str, skin: &SkinUpload) -> UserProfile {
    let mut user = user.clone();
    if let Some(profile) = user.profiles.get_mut(profile_id) {
        profile.skin = Some(SkinInfo {
            url: skin.url.clone(),
            slim: skin.slim,
        });
    }
    user
}
