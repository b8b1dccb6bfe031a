//! Accounts, login and token storage.

pub mod account;
mod cancel;
mod service;
pub mod token;
pub mod yggdrasil;

pub use account::{AccountSystem, LoginOptions, OfflineAccountSystem, SkinUpload, UploadSkinOptions};
pub use cancel::{CancelGuard, CancelSlot, CancelToken};
pub use service::{UserService, USER_SERVICE};
pub use token::{FileTokenStorage, MemoryTokenStorage, UserTokenStorage};
pub use yggdrasil::YggdrasilAccountSystem;

use std::error::Error as StdError;
use std::io;

use serde_json::{json, Value};
use thiserror::Error;

use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("authentication required: {message}")]
    Authentication { message: String },

    #[error("no internet connection: {message}")]
    InternetNotConnected { message: String },

    #[error("login timed out: {message}")]
    Timeout { message: String },

    #[error("connection reset during login: {message}")]
    Reset { message: String },

    #[error("invalid credentials: {message}")]
    InvalidCredentials { message: String },

    #[error("login failed: {message}")]
    General { message: String },

    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },

    #[error("unknown user {user_id}")]
    UnknownUser { user_id: String },

    #[error("unknown game profile {profile_id} of user {user_id}")]
    UnknownGameProfile { user_id: String, profile_id: String },

    #[error("failed to access account storage")]
    Storage {
        #[source]
        source: anyhow::Error,
    },
}

impl UserError {
    pub fn storage(source: impl Into<anyhow::Error>) -> Self {
        UserError::Storage {
            source: source.into(),
        }
    }

    /// Whether the account's credentials should be considered invalid.
    pub fn invalidates_user(&self) -> bool {
        matches!(
            self,
            UserError::Authentication { .. } | UserError::InvalidCredentials { .. }
        )
    }
}

impl ErrorKind for UserError {
    fn kind(&self) -> &'static str {
        match self {
            UserError::Authentication { .. } => "UserAuthenticationError",
            UserError::InternetNotConnected { .. } => "LoginInternetNotConnected",
            UserError::Timeout { .. } => "LoginTimeout",
            UserError::Reset { .. } => "LoginReset",
            UserError::InvalidCredentials { .. } => "LoginInvalidCredentials",
            UserError::General { .. } => "LoginGeneral",
            UserError::Cancelled { .. } => "Cancelled",
            UserError::UnknownUser { .. } => "UnknownUser",
            UserError::UnknownGameProfile { .. } => "UnknownGameProfile",
            UserError::Storage { .. } => "UserStorageError",
        }
    }

    fn details(&self) -> Value {
        match self {
            UserError::Cancelled { operation } => json!({ "operation": operation }),
            UserError::UnknownUser { user_id } => json!({ "userId": user_id }),
            UserError::UnknownGameProfile {
                user_id,
                profile_id,
            } => json!({ "userId": user_id, "profileId": profile_id }),
            _ => Value::Null,
        }
    }
}

/// Map a failed network request onto the login failure kinds.
pub fn classify_request_error(err: &(dyn StdError + 'static)) -> UserError {
    let message = error_chain(err);
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(req) = e.downcast_ref::<reqwest::Error>() {
            if req.is_timeout() {
                return UserError::Timeout { message };
            }
        }
        if let Some(io) = e.downcast_ref::<io::Error>() {
            match io.kind() {
                io::ErrorKind::TimedOut => return UserError::Timeout { message },
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => return UserError::Reset { message },
                _ => {}
            }
        }
        current = e.source();
    }
    let lower = message.to_lowercase();
    if ["dns error", "failed to lookup address", "name or service not known", "no such host"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return UserError::InternetNotConnected { message };
    }
    UserError::General { message }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("error sending request")]
    struct Wrapped(#[source] io::Error);

    #[test]
    fn io_failures_are_classified() {
        let reset = Wrapped(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        assert_eq!(classify_request_error(&reset).kind(), "LoginReset");

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        assert_eq!(classify_request_error(&timeout).kind(), "LoginTimeout");

        let dns = Wrapped(io::Error::new(
            io::ErrorKind::Other,
            "dns error: failed to lookup address information",
        ));
        let classified = classify_request_error(&dns);
        assert_eq!(classified.kind(), "LoginInternetNotConnected");
        assert!(classified.to_string().contains("error sending request: dns error"));

        let other = io::Error::new(io::ErrorKind::Other, "tls handshake eof");
        assert_eq!(classify_request_error(&other).kind(), "LoginGeneral");
    }

    #[test]
    fn credential_errors_invalidate() {
        assert!(UserError::InvalidCredentials { message: String::new() }.invalidates_user());
        assert!(!UserError::Timeout { message: String::new() }.invalidates_user());
        assert!(!UserError::Cancelled { operation: "login" }.invalidates_user());
    }
}
