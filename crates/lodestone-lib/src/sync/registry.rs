use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::bus::MutationBus;
use super::container::{AnyContainer, CommitSink, Disposer, MutableState, Snapshot, StateContainer};
use super::{ClientId, MutationRecord, SyncError, SyncState};

/// Cleanup run in the background when a shared container is disposed.
pub type StateDisposer = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub fn no_dispose() -> StateDisposer {
    Box::new(|| async {}.boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifetime {
    /// Owned by a service for the life of the process.
    Permanent,
    /// Created on demand; disposed when its last session is released.
    Shared,
}

struct Entry {
    container: Arc<dyn AnyContainer>,
    disposer: Arc<Disposer>,
    lifetime: Lifetime,
}

impl Entry {
    fn typed<S: SyncState>(&self) -> Result<MutableState<S>, SyncError> {
        let found = self.container.type_name();
        let container = self
            .container
            .clone()
            .into_any()
            .downcast::<StateContainer<S>>()
            .map_err(|_| SyncError::TypeMismatch {
                id: self.container.id().to_string(),
                expected: S::NAME,
                found,
            })?;
        Ok(MutableState::new(container, self.disposer.clone()))
    }
}

#[derive(Default)]
struct Slot {
    cell: OnceCell<Entry>,
}

struct Session {
    client: ClientId,
    state_id: String,
}

#[derive(Default)]
struct RegistryInner {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl RegistryInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops a slot whose supplier failed, unless another caller is still
    /// waiting on it and may retry.
    fn discard_failed(&self, id: &str, slot: &Arc<Slot>) {
        let mut slots = self.slots();
        let idle = match slots.get(id) {
            // one reference in the map, one held by the caller
            Some(current) => Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2,
            None => false,
        };
        if idle && slot.cell.get().is_none() {
            slots.remove(id);
        }
    }

    fn remove(&self, id: &str, slot: &Weak<Slot>) {
        let removed = {
            let mut slots = self.slots();
            match slots.get(id) {
                Some(current) if std::ptr::eq(Arc::as_ptr(current), slot.as_ptr()) => {
                    slots.remove(id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.sessions().retain(|_, session| session.state_id != id);
        }
    }
}

/// What the dispatcher hands back to a frontend for a state-returning call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedState {
    pub session_id: String,
    pub type_name: &'static str,
    pub snapshot: Snapshot,
}

impl TrackedState {
    /// `{__state__, id, length, ...fields}`
    pub fn envelope(&self) -> Value {
        let mut fields = match &self.snapshot.state {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        fields.insert("__state__".to_string(), json!(self.type_name));
        fields.insert("id".to_string(), json!(self.session_id));
        fields.insert("length".to_string(), json!(self.snapshot.length));
        Value::Object(fields)
    }
}

/// Process table of state containers keyed by id.
#[derive(Clone, Default)]
pub struct StateRegistry {
    inner: Arc<RegistryInner>,
    bus: MutationBus,
}

impl StateRegistry {
    pub fn bus(&self) -> &MutationBus {
        &self.bus
    }

    fn lookup(&self, id: &str) -> Option<Arc<Slot>> {
        self.inner.slots().get(id).cloned()
    }

    fn build_entry<S: SyncState>(
        &self,
        id: &str,
        slot: &Arc<Slot>,
        state: S,
        dispose: Option<StateDisposer>,
        lifetime: Lifetime,
    ) -> Entry {
        let container = Arc::new(StateContainer::new(id, state, self.bus.clone()));
        let registry = Arc::downgrade(&self.inner);
        let slot = Arc::downgrade(slot);
        let id = id.to_string();
        let disposer = Disposer::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&id, &slot);
            }
            if let Some(dispose) = dispose {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(dispose());
                    }
                    Err(_) => log::warn!("[sync] No runtime available to dispose state {}", id),
                }
            }
        });
        Entry {
            container,
            disposer: Arc::new(disposer),
            lifetime,
        }
    }

    /// Registers a container owned by a service for the life of the process.
    pub fn register<S: SyncState>(&self, id: &str, state: S) -> Result<MutableState<S>, SyncError> {
        let mut slots = self.inner.slots();
        if slots.contains_key(id) {
            return Err(SyncError::AlreadyRegistered { id: id.to_string() });
        }
        let slot = Arc::new(Slot::default());
        let entry = self.build_entry(id, &slot, state, None, Lifetime::Permanent);
        let handle = entry.typed::<S>()?;
        slot.cell
            .set(entry)
            .map_err(|_| SyncError::AlreadyRegistered { id: id.to_string() })?;
        slots.insert(id.to_string(), slot);
        log::debug!("[sync] Registered state {} ({})", id, S::NAME);
        Ok(handle)
    }

    /// Returns the container for `id`, creating it with `supplier` if absent.
    ///
    /// Concurrent callers for the same id share a single supplier run. If
    /// the supplier fails the error goes to the caller whose supplier ran and
    /// the next call tries again.
    pub async fn register_or_get<S, F, Fut>(
        &self,
        id: &str,
        supplier: F,
    ) -> anyhow::Result<MutableState<S>>
    where
        S: SyncState,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<(S, StateDisposer)>>,
    {
        let slot = {
            let mut slots = self.inner.slots();
            slots
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Slot::default()))
                .clone()
        };
        let created = slot
            .cell
            .get_or_try_init(|| async {
                log::debug!("[sync] Creating state {} ({})", id, S::NAME);
                let (state, dispose) = supplier().await?;
                Ok::<_, anyhow::Error>(self.build_entry(
                    id,
                    &slot,
                    state,
                    Some(dispose),
                    Lifetime::Shared,
                ))
            })
            .await;
        match created {
            Ok(entry) => Ok(entry.typed::<S>()?),
            Err(e) => {
                self.inner.discard_failed(id, &slot);
                Err(e)
            }
        }
    }

    /// Typed lookup that never creates.
    pub fn get<S: SyncState>(&self, id: &str) -> Option<MutableState<S>> {
        let slot = self.lookup(id)?;
        let entry = slot.cell.get()?;
        entry.typed::<S>().ok()
    }

    pub fn get_any(&self, id: &str) -> Option<Arc<dyn AnyContainer>> {
        let slot = self.lookup(id)?;
        slot.cell.get().map(|entry| entry.container.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get_any(id).is_some()
    }

    /// Subscribes `client` to `container` under a new session. Every
    /// subscription owns its session, so disposing one never detaches
    /// another subscription the same client holds on the same container.
    /// Attaching and snapshotting happen together.
    pub fn track(
        &self,
        client: &str,
        container: Arc<dyn AnyContainer>,
        sink: Arc<dyn CommitSink>,
    ) -> Result<TrackedState, SyncError> {
        let session_id = Uuid::new_v4().to_string();
        let snapshot = container.attach(&session_id, sink)?;
        self.inner.sessions().insert(
            session_id.clone(),
            Session {
                client: client.to_string(),
                state_id: container.id().to_string(),
            },
        );
        log::debug!(
            "[sync] Client {} tracks {} as session {}",
            client,
            container.id(),
            session_id
        );

        Ok(TrackedState {
            session_id,
            type_name: container.type_name(),
            snapshot,
        })
    }

    fn session_container(&self, session_id: &str) -> Result<Arc<dyn AnyContainer>, SyncError> {
        let state_id = self
            .inner
            .sessions()
            .get(session_id)
            .map(|s| s.state_id.clone())
            .ok_or_else(|| SyncError::SessionNotFound {
                session: session_id.to_string(),
            })?;
        self.get_any(&state_id).ok_or_else(|| SyncError::SessionNotFound {
            session: session_id.to_string(),
        })
    }

    /// The frontend registered its mirror; start pushing to it.
    pub fn activate(&self, session_id: &str) -> Result<(), SyncError> {
        let container = self.session_container(session_id)?;
        container.activate_session(session_id);
        Ok(())
    }

    /// A mutator call forwarded from a frontend mirror.
    pub fn commit(&self, session_id: &str, record: &MutationRecord) -> Result<(), SyncError> {
        self.session_container(session_id)?.commit_record(record)
    }

    pub fn sync(&self, session_id: &str) -> Result<Snapshot, SyncError> {
        self.session_container(session_id)?.snapshot()
    }

    /// Stops tracking a session. Returns `false` if it was not tracked.
    pub fn release(&self, session_id: &str) -> bool {
        let Some(session) = self.inner.sessions().remove(session_id) else {
            return false;
        };
        let Some(slot) = self.lookup(&session.state_id) else {
            return true;
        };
        if let Some(entry) = slot.cell.get() {
            let remaining = entry.container.detach(session_id);
            if remaining == 0 && entry.lifetime == Lifetime::Shared {
                log::debug!("[sync] Last session of {} released", session.state_id);
                entry.disposer.run();
            }
        }
        true
    }

    /// Drops every session of a disconnected client.
    pub fn release_client(&self, client: &str) -> usize {
        let sessions: Vec<String> = self
            .inner
            .sessions()
            .iter()
            .filter(|(_, s)| s.client == client)
            .map(|(id, _)| id.clone())
            .collect();
        sessions.iter().filter(|id| self.release(id)).count()
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Disposes every container. Used at shutdown.
    pub fn dispose_all(&self) {
        let slots: Vec<Arc<Slot>> = self.inner.slots().values().cloned().collect();
        for slot in slots {
            if let Some(entry) = slot.cell.get() {
                entry.disposer.run();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::{SettingMutation, SettingState};
    use crate::sync::Commit;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NullSink;

    impl CommitSink for NullSink {
        fn push(&self, _session_id: &str, _commit: &Commit) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn concurrent_register_or_get_runs_supplier_once() {
        let registry = StateRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .register_or_get::<SettingState, _, _>("shared", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok((SettingState::default(), no_dispose()))
                    })
                    .await
                    .unwrap()
            }));
        }

        let states: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for state in &states[1..] {
            assert!(Arc::ptr_eq(state.container(), states[0].container()));
        }
    }

    #[tokio::test]
    async fn failed_supplier_is_retried() {
        let registry = StateRegistry::default();
        let first = registry
            .register_or_get::<SettingState, _, _>("flaky", || async {
                Err(anyhow::anyhow!("not yet"))
            })
            .await;
        assert!(first.is_err());
        assert!(registry.get::<SettingState>("flaky").is_none());
        assert_eq!(registry.slot_count(), 0);

        let second = registry
            .register_or_get::<SettingState, _, _>("flaky", || async {
                Ok((SettingState::default(), no_dispose()))
            })
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn waiter_retries_on_the_slot_a_failed_supplier_left() {
        let registry = StateRegistry::default();
        let failing = registry.register_or_get::<SettingState, _, _>("racy", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(anyhow::anyhow!("offline"))
        });
        let waiting = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry
                .register_or_get::<SettingState, _, _>("racy", || async {
                    Ok((SettingState::default(), no_dispose()))
                })
                .await
        };
        let (failed, created) = tokio::join!(failing, waiting);

        assert!(failed.is_err());
        let created = created.unwrap();
        let found = registry.get::<SettingState>("racy").unwrap();
        assert!(Arc::ptr_eq(found.container(), created.container()));
        assert_eq!(registry.slot_count(), 1);
    }

    #[tokio::test]
    async fn dispose_removes_immediately_and_runs_disposer_once() {
        let registry = StateRegistry::default();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let state = registry
            .register_or_get::<SettingState, _, _>("disposable", move || async move {
                let dispose: StateDisposer = Box::new(move || {
                    async move {
                        let _ = tx.send(());
                    }
                    .boxed()
                });
                Ok((SettingState::default(), dispose))
            })
            .await
            .unwrap();

        state.dispose();
        assert!(registry.get::<SettingState>("disposable").is_none());
        state.dispose();
        assert!(state.is_disposed());

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("disposer should run")
            .expect("disposer should signal");
    }

    #[tokio::test]
    async fn releasing_last_session_disposes_shared_state() {
        let registry = StateRegistry::default();
        let state = registry
            .register_or_get::<SettingState, _, _>("per-view", || async {
                Ok((SettingState::default(), no_dispose()))
            })
            .await
            .unwrap();

        let a = registry.track("client-a", state.erased(), Arc::new(NullSink)).unwrap();
        let again = registry.track("client-a", state.erased(), Arc::new(NullSink)).unwrap();
        assert_ne!(a.session_id, again.session_id);
        let b = registry.track("client-b", state.erased(), Arc::new(NullSink)).unwrap();

        assert!(registry.release(&a.session_id));
        assert!(!registry.release(&a.session_id));
        assert!(registry.contains("per-view"));
        assert!(registry.release(&again.session_id));
        assert!(registry.contains("per-view"));

        assert_eq!(registry.release_client("client-b"), 1);
        assert_ne!(a.session_id, b.session_id);
        assert!(!registry.contains("per-view"));
        assert!(state.is_disposed());
    }

    #[test]
    fn permanent_state_survives_release_and_rejects_duplicates() {
        let registry = StateRegistry::default();
        let state = registry.register("settings", SettingState::default()).unwrap();
        assert!(matches!(
            registry.register("settings", SettingState::default()),
            Err(SyncError::AlreadyRegistered { .. })
        ));

        let tracked = registry.track("c", state.erased(), Arc::new(NullSink)).unwrap();
        state.mutate(SettingMutation::LocaleSet("de".into())).unwrap();
        assert_eq!(registry.sync(&tracked.session_id).unwrap().length, 1);

        registry.release(&tracked.session_id);
        assert!(registry.contains("settings"));
        assert!(matches!(
            registry.sync(&tracked.session_id),
            Err(SyncError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn envelope_carries_type_session_and_checkpoint() {
        let tracked = TrackedState {
            session_id: "s-1".into(),
            type_name: "SettingState",
            snapshot: Snapshot {
                state: json!({ "locale": "en" }),
                length: 7,
            },
        };
        let envelope = tracked.envelope();
        assert_eq!(envelope["__state__"], "SettingState");
        assert_eq!(envelope["id"], "s-1");
        assert_eq!(envelope["length"], 7);
        assert_eq!(envelope["locale"], "en");
    }
}
