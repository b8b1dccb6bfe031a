use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::MutationRecord;

/// Listener invoked with every broadcast record of the kinds it subscribed to.
pub type MutationListener = Arc<dyn Fn(&MutationRecord) + Send + Sync>;

/// Returned by [`MutationBus::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionToken {
    id: u64,
    kinds: Vec<String>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    listeners: HashMap<String, Vec<(u64, MutationListener)>>,
}

/// Process-wide observers keyed by mutation type name.
///
/// Listeners receive a record no matter which container raised it, so two
/// states sharing a mutation name share its listeners.
#[derive(Clone, Default)]
pub struct MutationBus {
    inner: Arc<RwLock<BusInner>>,
}

impl MutationBus {
    pub fn subscribe(
        &self,
        kind: &str,
        listener: impl Fn(&MutationRecord) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.subscribe_all(&[kind], listener)
    }

    /// One listener for several kinds, removed together by the returned token.
    pub fn subscribe_all(
        &self,
        kinds: &[&str],
        listener: impl Fn(&MutationRecord) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let listener: MutationListener = Arc::new(listener);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = inner.next_id;
        for kind in kinds {
            inner
                .listeners
                .entry(kind.to_string())
                .or_default()
                .push((id, listener.clone()));
        }
        SubscriptionToken {
            id,
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Returns `false` if the token was already removed.
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for kind in &token.kinds {
            if let Some(listeners) = inner.listeners.get_mut(kind) {
                let before = listeners.len();
                listeners.retain(|(id, _)| *id != token.id);
                removed |= listeners.len() != before;
                if listeners.is_empty() {
                    inner.listeners.remove(kind);
                }
            }
        }
        removed
    }

    pub(crate) fn emit(&self, record: &MutationRecord) {
        // Listeners run without the lock so they may subscribe or unsubscribe.
        let listeners: Vec<MutationListener> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match inner.listeners.get(&record.kind) {
                Some(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
                None => return,
            }
        };
        for listener in listeners {
            listener(record);
        }
    }

    pub fn listener_count(&self, kind: &str) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .get(kind)
            .map_or(0, Vec::len)
    }
}
