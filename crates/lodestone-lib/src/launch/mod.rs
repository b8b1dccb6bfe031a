//! Game launch orchestration.
//!
//! [`LaunchService`] drives the launch state machine
//! `idle → checkingProblems → injectingAuthLib → launching → idle` and
//! supervises the spawned game processes. Everything it depends on sits
//! behind a trait so that each phase can be replaced.

pub mod arguments;
pub mod authlib;
pub mod content;
pub mod diagnose;
pub mod encoding;
mod orchestrator;
pub mod process;
mod registry;
pub mod types;
pub mod version;

pub use orchestrator::{LaunchDependencies, LaunchService, UserStatusRefresher, LAUNCH_SERVICE};
pub use registry::{LaunchSession, ProcessRegistry};
pub use types::{LaunchCommand, LaunchOptions, ServerOptions};

use serde_json::{json, Value};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::user::UserError;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("version {version} is not installed")]
    NoVersionInstalled {
        version: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no usable java was selected")]
    NoProperJava { java_path: String },

    #[error("java executable {java_path} does not exist")]
    InvalidJavaPath { java_path: String },

    #[error("java executable {java_path} is not executable")]
    JavaNoPermission { java_path: String },

    #[error("failed to refresh the status of user {user_id}")]
    UserStatusRefreshFailed {
        user_id: String,
        #[source]
        source: UserError,
    },

    #[error("launch failed: {source}")]
    GeneralException {
        #[source]
        source: anyhow::Error,
    },
}

impl LaunchError {
    pub fn general(source: impl Into<anyhow::Error>) -> Self {
        LaunchError::GeneralException {
            source: source.into(),
        }
    }
}

impl ErrorKind for LaunchError {
    fn kind(&self) -> &'static str {
        match self {
            LaunchError::NoVersionInstalled { .. } => "LaunchNoVersionInstalled",
            LaunchError::NoProperJava { .. } => "LaunchNoProperJava",
            LaunchError::InvalidJavaPath { .. } => "LaunchInvalidJavaPath",
            LaunchError::JavaNoPermission { .. } => "LaunchJavaNoPermission",
            LaunchError::UserStatusRefreshFailed { .. } => "LaunchUserStatusRefreshFailed",
            LaunchError::GeneralException { .. } => "LaunchGeneralException",
        }
    }

    fn details(&self) -> Value {
        match self {
            LaunchError::NoVersionInstalled { version, .. } => json!({ "version": version }),
            LaunchError::NoProperJava { java_path }
            | LaunchError::InvalidJavaPath { java_path }
            | LaunchError::JavaNoPermission { java_path } => json!({ "javaPath": java_path }),
            LaunchError::UserStatusRefreshFailed { user_id, .. } => json!({ "userId": user_id }),
            LaunchError::GeneralException { .. } => Value::Null,
        }
    }
}
