//! Error taxonomy shared by every backend service and the wire form of errors.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::launch::LaunchError;
use crate::sync::SyncError;
use crate::user::UserError;

/// Implemented by every error enum that can reach a frontend.
pub trait ErrorKind: std::error::Error {
    /// Stable identifier frontends match on, e.g. `LaunchNoProperJava`.
    fn kind(&self) -> &'static str;

    /// Structured properties of the error, `null` when there are none.
    fn details(&self) -> Value {
        Value::Null
    }
}

/// The only error shape that crosses the transport.
///
/// Cause chains are flattened into nested plain objects so that the
/// frontend never needs the backend's error types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedError {
    pub kind: String,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_method: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
}

impl SerializedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: "Error".to_string(),
            message: message.into(),
            service_name: None,
            service_method: None,
            details: Value::Null,
            cause: None,
        }
    }

    /// Serializes a classified error. `name` is the taxonomy it belongs to.
    pub fn from_error<E: ErrorKind + ?Sized>(name: &str, err: &E) -> Self {
        Self {
            kind: err.kind().to_string(),
            name: name.to_string(),
            message: err.to_string(),
            service_name: None,
            service_method: None,
            details: err.details(),
            cause: err.source().map(|source| Box::new(Self::from_std(source))),
        }
    }

    /// Serializes an unclassified error and its source chain.
    pub fn from_std(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut serialized = Self::new("Error", err.to_string());
        serialized.cause = err.source().map(|source| Box::new(Self::from_std(source)));
        serialized
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let mut cause = None;
        let chain: Vec<_> = err.chain().skip(1).collect();
        for source in chain.into_iter().rev() {
            let mut link = Self::new("Error", source.to_string());
            link.cause = cause;
            cause = Some(Box::new(link));
        }
        let mut serialized = Self::new("Error", err.to_string());
        serialized.cause = cause;
        serialized
    }

    /// Attaches the service and method the error was raised from.
    pub fn with_context(mut self, service: &str, method: &str) -> Self {
        self.service_name = Some(service.to_string());
        self.service_method = Some(method.to_string());
        self
    }

    /// Messages of this error followed by every cause, outermost first.
    pub fn messages(&self) -> Vec<&str> {
        let mut out = vec![self.message.as_str()];
        let mut next = self.cause.as_deref();
        while let Some(cause) = next {
            out.push(cause.message.as_str());
            next = cause.cause.as_deref();
        }
        out
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SerializedError {}

/// Raised by the dispatcher before or around a service method.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no service is registered under {service}")]
    ServiceNotFound { service: String },

    #[error("service {service} has no method {method}")]
    ServiceMethodNotFound { service: String, method: String },

    #[error("service {service} failed to initialize: {message}")]
    ServiceInitializeFailed { service: String, message: String },

    #[error("argument {index} of {method} is invalid: {message}")]
    InvalidArgument {
        method: String,
        index: usize,
        message: String,
    },

    #[error("service call panicked: {message}")]
    ServicePanicked { message: String },

    #[error("no state session {session}")]
    SessionNotFound { session: String },
}

impl ErrorKind for DispatchError {
    fn kind(&self) -> &'static str {
        match self {
            DispatchError::ServiceNotFound { .. } => "ServiceNotFound",
            DispatchError::ServiceMethodNotFound { .. } => "ServiceMethodNotFound",
            DispatchError::ServiceInitializeFailed { .. } => "ServiceInitializeFailed",
            DispatchError::InvalidArgument { .. } => "InvalidArgument",
            DispatchError::ServicePanicked { .. } => "ServicePanicked",
            DispatchError::SessionNotFound { .. } => "SessionNotFound",
        }
    }

    fn details(&self) -> Value {
        match self {
            DispatchError::ServiceNotFound { service } => json!({ "service": service }),
            DispatchError::ServiceMethodNotFound { service, method } => {
                json!({ "service": service, "method": method })
            }
            DispatchError::InvalidArgument { method, index, .. } => {
                json!({ "method": method, "index": index })
            }
            DispatchError::SessionNotFound { session } => json!({ "session": session }),
            _ => Value::Null,
        }
    }
}

/// Everything a service method can fail with.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    User(#[from] UserError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn serialize(&self) -> SerializedError {
        match self {
            ServiceError::Dispatch(e) => SerializedError::from_error("DispatchError", e),
            ServiceError::Sync(e) => SerializedError::from_error("SyncError", e),
            ServiceError::Launch(e) => SerializedError::from_error("LaunchError", e),
            ServiceError::User(e) => SerializedError::from_error("UserError", e),
            ServiceError::Json(e) => {
                let mut serialized = SerializedError::from_std(e);
                serialized.kind = "SerializationError".to_string();
                serialized
            }
            ServiceError::Internal(e) => SerializedError::from_anyhow(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn dispatch_error_keeps_kind_and_details() {
        let err = DispatchError::ServiceNotFound {
            service: "NoSuchService".into(),
        };
        let serialized = SerializedError::from_error("DispatchError", &err);
        assert_eq!(serialized.kind, "ServiceNotFound");
        assert_eq!(serialized.details["service"], "NoSuchService");
        assert!(serialized.cause.is_none());
    }

    #[test]
    fn anyhow_chain_is_nested_outermost_first() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "disk gone");
        let err = Err::<(), _>(io)
            .context("reading manifest")
            .context("resolving 1.20.1")
            .unwrap_err();

        let serialized = ServiceError::from(err).serialize();
        assert_eq!(
            serialized.messages(),
            vec!["resolving 1.20.1", "reading manifest", "disk gone"]
        );
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let serialized = SerializedError::new("Error", "boom").with_context("LaunchService", "launch");
        let value = serde_json::to_value(&serialized).unwrap();
        assert_eq!(value["serviceName"], "LaunchService");
        assert_eq!(value["serviceMethod"], "launch");
        assert!(value.get("cause").is_none());
        assert!(value.get("details").is_none());
    }
}
