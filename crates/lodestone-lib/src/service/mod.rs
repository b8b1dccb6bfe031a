//! Backend services and how frontend calls reach them.

mod dispatcher;
mod events;

pub use dispatcher::{CallResponse, ServiceDispatcher};
pub use events::{EventHub, EventSink, RecordingSink, ServiceEvent};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::error::{DispatchError, ServiceError};
use crate::sync::{AnyContainer, MutableState, SyncState};

/// Name of a backend service singleton, e.g. `"LaunchService"`.
pub type ServiceKey = &'static str;

/// Positional arguments of a call.
#[derive(Debug, Clone, Default)]
pub struct Args {
    method: String,
    values: Vec<Value>,
}

impl Args {
    pub fn new(method: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            values,
        }
    }

    /// Decodes argument `index`. Missing arguments decode from `null`, so
    /// `Option` parameters may be omitted.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, DispatchError> {
        let value = self.values.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| DispatchError::InvalidArgument {
            method: self.method.clone(),
            index,
            message: e.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of a service method.
pub enum CallOutcome {
    /// Returned to the caller as plain data.
    Value(Value),
    /// Tracked for the caller and returned as a live state envelope.
    State(Arc<dyn AnyContainer>),
}

impl CallOutcome {
    pub fn value<T: Serialize>(value: T) -> Result<Self, ServiceError> {
        Ok(CallOutcome::Value(serde_json::to_value(value)?))
    }

    pub fn unit() -> Self {
        CallOutcome::Value(Value::Null)
    }

    pub fn state<S: SyncState>(state: &MutableState<S>) -> Self {
        CallOutcome::State(state.erased())
    }
}

impl std::fmt::Debug for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallOutcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            CallOutcome::State(c) => f.debug_tuple("State").field(&c.id()).finish(),
        }
    }
}

/// A backend singleton reachable by frontends.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn key(&self) -> ServiceKey;

    /// Method names frontends may call.
    fn methods(&self) -> &'static [&'static str];

    /// Runs once, before the first call is dispatched.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn call(&self, method: &str, args: Args) -> Result<CallOutcome, ServiceError>;

    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct ServiceSlot {
    service: Arc<dyn Service>,
    initialized: OnceCell<()>,
}

/// Services by key, in the order they were constructed.
#[derive(Default)]
pub struct ServiceRegistry {
    slots: HashMap<ServiceKey, ServiceSlot>,
    order: Vec<ServiceKey>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn Service>) {
        let key = service.key();
        if self.slots.contains_key(key) {
            log::warn!("[services] Service {} registered twice, keeping the last", key);
        } else {
            self.order.push(key);
        }
        self.slots.insert(
            key,
            ServiceSlot {
                service,
                initialized: OnceCell::new(),
            },
        );
    }

    pub fn keys(&self) -> &[ServiceKey] {
        &self.order
    }

    /// Finds a service and makes sure its `initialize` has completed.
    ///
    /// Concurrent first calls share one initialization. A failed one is
    /// reported to its callers and attempted again on the next call.
    pub async fn resolve(&self, key: &str) -> Result<Arc<dyn Service>, DispatchError> {
        let slot = self
            .slots
            .get(key)
            .ok_or_else(|| DispatchError::ServiceNotFound {
                service: key.to_string(),
            })?;
        slot.initialized
            .get_or_try_init(|| async {
                log::info!("[services] Initializing {}", key);
                slot.service.initialize().await
            })
            .await
            .map_err(|e| {
                log::error!("[services] {} failed to initialize: {:#}", key, e);
                DispatchError::ServiceInitializeFailed {
                    service: key.to_string(),
                    message: format!("{e:#}"),
                }
            })?;
        Ok(slot.service.clone())
    }

    /// Disposes services in reverse construction order.
    pub async fn dispose_all(&self) {
        for key in self.order.iter().rev() {
            if let Some(slot) = self.slots.get(key) {
                if slot.initialized.initialized() {
                    if let Err(e) = slot.service.dispose().await {
                        log::warn!("[services] Failed to dispose {}: {:#}", key, e);
                    }
                }
            }
        }
    }
}
