//! Frontend half of the state synchronization layer.
//!
//! [`ClientStates`] turns `__state__` envelopes into [`ClientStateProxy`]
//! mirrors and routes pushed commits to them by session id.

mod latest;
mod proxy;

pub use latest::LatestSubscription;
pub use proxy::ClientStateProxy;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;

use crate::error::SerializedError;
use crate::sync::{DescriptorTable, MutationRecord, SyncError};
use crate::transport::{ClientMessage, Requester};
use proxy::ProxyShared;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("backend connection closed")]
    Disconnected,

    #[error(transparent)]
    Remote(#[from] SerializedError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("malformed state payload")]
    Decode(#[from] serde_json::Error),

    #[error("call did not return a state")]
    NotAState,

    #[error("expected a {expected} mirror, this one holds {found}")]
    UnexpectedState {
        expected: &'static str,
        found: &'static str,
    },
}

struct StatesInner {
    descriptors: DescriptorTable,
    requester: Requester,
    proxies: Mutex<HashMap<String, Arc<ProxyShared>>>,
}

/// Every mirror held by one frontend connection.
#[derive(Clone)]
pub struct ClientStates {
    inner: Arc<StatesInner>,
}

impl ClientStates {
    pub(crate) fn new(descriptors: DescriptorTable, requester: Requester) -> Self {
        Self {
            inner: Arc::new(StatesInner {
                descriptors,
                requester,
                proxies: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn proxies(&self) -> MutexGuard<'_, HashMap<String, Arc<ProxyShared>>> {
        self.inner
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn requester(&self) -> &Requester {
        &self.inner.requester
    }

    /// Builds a mirror from a `{__state__, id, length, ...fields}` envelope
    /// and asks the backend to start pushing commits for it.
    ///
    /// A second envelope for a session this client already mirrors returns
    /// another handle to the same mirror.
    pub fn receive(&self, envelope: Value) -> Result<ClientStateProxy, ClientError> {
        let Value::Object(mut fields) = envelope else {
            return Err(ClientError::NotAState);
        };
        let type_name = match fields.remove("__state__") {
            Some(Value::String(name)) => name,
            _ => return Err(ClientError::NotAState),
        };
        let session_id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            _ => return Err(ClientError::NotAState),
        };
        let length = fields.remove("length").and_then(|v| v.as_u64()).unwrap_or(0);
        let descriptor = *self
            .inner
            .descriptors
            .get(&type_name)
            .ok_or(SyncError::UnknownState { name: type_name })?;

        let shared = {
            let mut proxies = self.proxies();
            if let Some(existing) = proxies.get(&session_id) {
                existing.holders.fetch_add(1, Ordering::SeqCst);
                return Ok(ClientStateProxy::new(existing.clone(), self.clone()));
            }
            let state = descriptor.restore(Value::Object(fields))?;
            let shared = Arc::new(ProxyShared::new(session_id.clone(), descriptor, state, length));
            proxies.insert(session_id.clone(), shared.clone());
            shared
        };

        self.inner
            .requester
            .send(ClientMessage::Activate { session_id })?;
        Ok(ClientStateProxy::new(shared, self.clone()))
    }

    /// Routes one pushed commit. Unknown sessions are ignored.
    pub(crate) fn apply_push(&self, session_id: &str, seq: u64, mutation: &MutationRecord) {
        let shared = self.proxies().get(session_id).cloned();
        match shared {
            Some(shared) => shared.apply(seq, mutation),
            None => log::debug!("[client] Dropping commit {} for unknown session {}", seq, session_id),
        }
    }

    /// Forgets a mirror once its last handle is disposed.
    pub(crate) fn release(&self, shared: &Arc<ProxyShared>) {
        {
            let mut proxies = self.proxies();
            if shared.holders.load(Ordering::SeqCst) != 0 {
                return;
            }
            proxies.remove(&shared.session_id);
        }
        shared.mark_disposed();
        let _ = self.inner.requester.send(ClientMessage::Dispose {
            session_id: shared.session_id.clone(),
        });
    }

    pub fn len(&self) -> usize {
        self.proxies().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::{descriptor_table, SettingState};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn states() -> (ClientStates, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientStates::new(descriptor_table(), Requester::new(tx)), rx)
    }

    fn envelope(length: u64) -> Value {
        let mut value = serde_json::to_value(SettingState::default()).unwrap();
        value["__state__"] = json!("SettingState");
        value["id"] = json!("session-1");
        value["length"] = json!(length);
        value
    }

    #[test]
    fn stale_and_foreign_commits_are_ignored() {
        let (states, mut outbound) = states();
        let proxy = states.receive(envelope(2)).unwrap();
        assert!(matches!(
            outbound.try_recv(),
            Ok(ClientMessage::Activate { session_id }) if session_id == "session-1"
        ));

        let locale = |l: &str| MutationRecord::new("localeSet", json!(l));
        states.apply_push("session-1", 2, &locale("stale"));
        states.apply_push("other", 3, &locale("foreign"));
        assert_eq!(proxy.get::<SettingState>().unwrap().locale, "en");

        states.apply_push("session-1", 3, &locale("de"));
        assert_eq!(proxy.get::<SettingState>().unwrap().locale, "de");
        assert_eq!(proxy.checkpoint(), 3);
        states.apply_push("session-1", 3, &locale("replayed"));
        assert_eq!(proxy.get::<SettingState>().unwrap().locale, "de");
    }

    #[test]
    fn shared_mirror_is_released_after_the_last_handle() {
        let (states, mut outbound) = states();
        let first = states.receive(envelope(0)).unwrap();
        let second = states.receive(envelope(0)).unwrap();
        assert_eq!(states.len(), 1);
        let _activate = outbound.try_recv();

        first.dispose();
        first.dispose();
        assert!(!second.is_disposed());
        assert!(outbound.try_recv().is_err());

        second.dispose();
        assert!(states.is_empty());
        assert!(matches!(outbound.try_recv(), Ok(ClientMessage::Dispose { .. })));
        assert!(outbound.try_recv().is_err());

        // pushes for the released session are dropped
        states.apply_push("session-1", 1, &MutationRecord::new("localeSet", json!("x")));
        assert_eq!(second.get::<SettingState>().unwrap().locale, "en");
    }

    #[test]
    fn envelopes_without_a_known_type_are_rejected() {
        let (states, _outbound) = states();
        assert!(matches!(states.receive(json!(3)), Err(ClientError::NotAState)));
        let mut unknown = envelope(0);
        unknown["__state__"] = json!("WeatherState");
        assert!(matches!(
            states.receive(unknown),
            Err(ClientError::Sync(SyncError::UnknownState { .. }))
        ));
    }
}
