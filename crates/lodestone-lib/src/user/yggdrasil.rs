//! Accounts on Yggdrasil compatible servers (authlib-injector API).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::account::{with_skin, AccountSystem, LoginOptions, SkinUpload};
use super::cancel::CancelToken;
use super::token::UserTokenStorage;
use super::{classify_request_error, UserError};
use crate::states::{GameProfile, UserProfile};

const TOKEN_LIFETIME_MS: i64 = 86_400_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    access_token: String,
    #[serde(default)]
    available_profiles: Vec<ProfileResponse>,
    selected_profile: Option<ProfileResponse>,
    user: Option<UserResponse>,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorResponse {
    pub error: String,
    pub error_message: String,
}

/// Classify a failed Yggdrasil response. Credential errors are never
/// retried.
pub fn classify_error_response(status: StatusCode, body: &ErrorResponse) -> UserError {
    let message = if body.error_message.is_empty() {
        format!("{} {}", status, body.error)
    } else {
        body.error_message.clone()
    };
    if body.error == "ForbiddenOperationException" || status == StatusCode::FORBIDDEN {
        UserError::InvalidCredentials { message }
    } else if status == StatusCode::UNAUTHORIZED {
        UserError::Authentication { message }
    } else {
        UserError::General { message }
    }
}

pub struct YggdrasilAccountSystem {
    client: Client,
    tokens: Arc<dyn UserTokenStorage>,
    client_token: String,
}

impl YggdrasilAccountSystem {
    pub fn new(client: Client, tokens: Arc<dyn UserTokenStorage>, client_token: impl Into<String>) -> Self {
        Self {
            client,
            tokens,
            client_token: client_token.into(),
        }
    }

    fn endpoint(root: &str, path: &str) -> String {
        format!("{}/{}", root.trim_end_matches('/'), path)
    }

    async fn post(&self, root: &str, path: &str, body: serde_json::Value) -> Result<Response, UserError> {
        let response = self
            .client
            .post(Self::endpoint(root, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;
        check(response).await
    }

    async fn token(&self, user: &UserProfile) -> Result<String, UserError> {
        self.tokens
            .get(user)
            .await
            .map_err(UserError::storage)?
            .ok_or_else(|| UserError::Authentication {
                message: format!("no access token for {}", user.username),
            })
    }

    async fn download_skin(&self, skin: &SkinUpload) -> Result<Vec<u8>, UserError> {
        if skin.url.starts_with("http://") || skin.url.starts_with("https://") {
            let response = self
                .client
                .get(&skin.url)
                .send()
                .await
                .map_err(|e| classify_request_error(&e))?;
            let bytes = check(response)
                .await?
                .bytes()
                .await
                .map_err(|e| classify_request_error(&e))?;
            Ok(bytes.to_vec())
        } else {
            tokio::fs::read(&skin.url)
                .await
                .map_err(|e| UserError::General {
                    message: format!("failed to read skin {}: {}", skin.url, e),
                })
        }
    }
}

async fn check(response: Response) -> Result<Response, UserError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: ErrorResponse = response.json().await.unwrap_or_default();
    Err(classify_error_response(status, &body))
}

fn profile_of(response: ProfileResponse) -> GameProfile {
    GameProfile {
        id: response.id,
        name: response.name,
        skin: None,
    }
}

#[async_trait]
impl AccountSystem for YggdrasilAccountSystem {
    async fn login(&self, options: &LoginOptions, cancel: CancelToken) -> Result<UserProfile, UserError> {
        cancel
            .run("login", async {
                let response = self
                    .post(
                        &options.service,
                        "authserver/authenticate",
                        json!({
                            "agent": { "name": "Minecraft", "version": 1 },
                            "username": options.username,
                            "password": options.password.clone().unwrap_or_default(),
                            "clientToken": self.client_token,
                            "requestUser": true,
                        }),
                    )
                    .await?;
                let auth: AuthResponse = response
                    .json()
                    .await
                    .map_err(|e| classify_request_error(&e))?;

                let selected = auth.selected_profile.as_ref().map(|p| p.id.clone());
                let profiles: BTreeMap<_, _> = auth
                    .available_profiles
                    .into_iter()
                    .map(|p| (p.id.clone(), profile_of(p)))
                    .collect();
                let user = UserProfile {
                    id: auth
                        .user
                        .map(|u| u.id)
                        .unwrap_or_else(|| options.username.clone()),
                    username: options.username.clone(),
                    auth_service: options.service.clone(),
                    invalidated: false,
                    expired_at: chrono::Utc::now().timestamp_millis() + TOKEN_LIFETIME_MS,
                    selected_profile: selected
                        .or_else(|| profiles.keys().next().cloned())
                        .unwrap_or_default(),
                    profiles,
                };
                self.tokens
                    .put(&user, &auth.access_token)
                    .await
                    .map_err(UserError::storage)?;
                Ok(user)
            })
            .await
    }

    async fn refresh(&self, user: &UserProfile, cancel: CancelToken) -> Result<UserProfile, UserError> {
        cancel
            .run("refresh", async {
                let token = self.token(user).await?;
                let valid = self
                    .post(
                        &user.auth_service,
                        "authserver/validate",
                        json!({ "accessToken": token, "clientToken": self.client_token }),
                    )
                    .await;
                match valid {
                    Ok(_) => {
                        log::debug!("[user] Token of {} is valid", user.username);
                        return Ok(UserProfile {
                            invalidated: false,
                            ..user.clone()
                        });
                    }
                    Err(e) if e.invalidates_user() => {
                        log::info!("[user] Token of {} expired, refreshing", user.username);
                    }
                    Err(e) => return Err(e),
                }

                let response = self
                    .post(
                        &user.auth_service,
                        "authserver/refresh",
                        json!({
                            "accessToken": token,
                            "clientToken": self.client_token,
                            "requestUser": true,
                        }),
                    )
                    .await?;
                let auth: AuthResponse = response
                    .json()
                    .await
                    .map_err(|e| classify_request_error(&e))?;
                self.tokens
                    .put(user, &auth.access_token)
                    .await
                    .map_err(UserError::storage)?;

                let mut refreshed = user.clone();
                refreshed.invalidated = false;
                refreshed.expired_at = chrono::Utc::now().timestamp_millis() + TOKEN_LIFETIME_MS;
                if let Some(selected) = auth.selected_profile {
                    refreshed.selected_profile = selected.id.clone();
                    refreshed
                        .profiles
                        .entry(selected.id.clone())
                        .or_insert_with(|| profile_of(selected));
                }
                Ok(refreshed)
            })
            .await
    }

    async fn set_skin(
        &self,
        user: &UserProfile,
        profile: &GameProfile,
        skin: &SkinUpload,
        cancel: CancelToken,
    ) -> Result<UserProfile, UserError> {
        cancel
            .run("uploadSkin", async {
                let token = self.token(user).await?;
                let bytes = self.download_skin(skin).await?;
                let file = reqwest::multipart::Part::bytes(bytes)
                    .file_name("skin.png")
                    .mime_str("image/png")
                    .map_err(|e| classify_request_error(&e))?;
                let form = reqwest::multipart::Form::new()
                    .text("model", if skin.slim { "slim" } else { "" })
                    .part("file", file);
                let url = Self::endpoint(
                    &user.auth_service,
                    &format!("api/user/profile/{}/skin", profile.id),
                );
                let response = self
                    .client
                    .put(url)
                    .bearer_auth(&token)
                    .multipart(form)
                    .send()
                    .await
                    .map_err(|e| classify_request_error(&e))?;
                check(response).await?;
                Ok(with_skin(user, &profile.id, skin))
            })
            .await
    }
}
