use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::sync::SyncState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkinInfo {
    pub url: String,
    #[serde(default)]
    pub slim: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameProfile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skin: Option<SkinInfo>,
}

/// An account and the game profiles it owns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    /// `offline`, `microsoft`, `mojang`, or the API root of a Yggdrasil server.
    pub auth_service: String,
    pub invalidated: bool,
    /// Unix milliseconds after which the access token must be refreshed.
    pub expired_at: i64,
    pub profiles: BTreeMap<String, GameProfile>,
    pub selected_profile: String,
}

impl UserProfile {
    pub fn selected_game_profile(&self) -> Option<&GameProfile> {
        self.profiles.get(&self.selected_profile)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YggdrasilApi {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserState {
    pub users: BTreeMap<String, UserProfile>,
    pub selected_user: Option<String>,
    pub client_token: String,
    pub yggdrasil_services: Vec<YggdrasilApi>,
}

impl UserState {
    pub fn selected(&self) -> Option<&UserProfile> {
        self.selected_user.as_ref().and_then(|id| self.users.get(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSelection {
    pub user_id: String,
    pub profile_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum UserMutation {
    /// Replaces everything, used when loading `user.json`.
    UserData(UserState),
    UserProfile(UserProfile),
    UserProfileRemove(String),
    UserGameProfileSelect(ProfileSelection),
    UserSelect(String),
    UserInvalidate(String),
    UserYggdrasilServices(Vec<YggdrasilApi>),
}

impl SyncState for UserState {
    const NAME: &'static str = "UserState";
    const MUTATIONS: &'static [&'static str] = &[
        "userData",
        "userProfile",
        "userProfileRemove",
        "userGameProfileSelect",
        "userSelect",
        "userInvalidate",
        "userYggdrasilServices",
    ];
    type Mutation = UserMutation;

    fn apply(&mut self, mutation: &UserMutation) {
        match mutation {
            UserMutation::UserData(data) => *self = data.clone(),
            UserMutation::UserProfile(profile) => {
                self.users.insert(profile.id.clone(), profile.clone());
                if self.selected_user.is_none() {
                    self.selected_user = Some(profile.id.clone());
                }
            }
            UserMutation::UserProfileRemove(id) => {
                self.users.remove(id);
                if self.selected_user.as_ref() == Some(id) {
                    self.selected_user = self.users.keys().next().cloned();
                }
            }
            UserMutation::UserGameProfileSelect(selection) => {
                if let Some(user) = self.users.get_mut(&selection.user_id) {
                    if user.profiles.contains_key(&selection.profile_id) {
                        user.selected_profile = selection.profile_id.clone();
                    }
                }
            }
            UserMutation::UserSelect(id) => {
                if self.users.contains_key(id) {
                    self.selected_user = Some(id.clone());
                }
            }
            UserMutation::UserInvalidate(id) => {
                if let Some(user) = self.users.get_mut(id) {
                    user.invalidated = true;
                }
            }
            UserMutation::UserYggdrasilServices(services) => {
                self.yggdrasil_services = services.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserProfile {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            format!("{id}-p"),
            GameProfile {
                id: format!("{id}-p"),
                name: id.to_uppercase(),
                skin: None,
            },
        );
        UserProfile {
            id: id.into(),
            username: id.into(),
            auth_service: "offline".into(),
            profiles,
            selected_profile: format!("{id}-p"),
            ..Default::default()
        }
    }

    #[test]
    fn removing_selected_user_falls_back_to_another() {
        let mut state = UserState::default();
        state.apply(&UserMutation::UserProfile(user("a")));
        state.apply(&UserMutation::UserProfile(user("b")));
        assert_eq!(state.selected_user.as_deref(), Some("a"));

        state.apply(&UserMutation::UserProfileRemove("a".into()));
        assert_eq!(state.selected_user.as_deref(), Some("b"));
        assert_eq!(state.selected().map(|u| u.username.as_str()), Some("b"));
    }

    #[test]
    fn selecting_unknown_profile_is_ignored() {
        let mut state = UserState::default();
        state.apply(&UserMutation::UserProfile(user("a")));
        state.apply(&UserMutation::UserGameProfileSelect(ProfileSelection {
            user_id: "a".into(),
            profile_id: "missing".into(),
        }));
        assert_eq!(state.users["a"].selected_profile, "a-p");
    }
}
