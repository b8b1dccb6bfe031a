use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bus::MutationBus;
use super::{decode_mutation, Commit, MutationRecord, SyncError, SyncState};

/// Upper bound of commits a container or a session buffers before activation.
pub const MAX_PENDING_COMMITS: usize = 4096;

/// Receives the commits of every session held by one frontend connection.
pub trait CommitSink: Send + Sync {
    /// Returns `false` once the receiving side is gone.
    fn push(&self, session_id: &str, commit: &Commit) -> bool;
}

/// Called with every record a container produces.
pub type OnCommit = Arc<dyn Fn(&MutationRecord) + Send + Sync>;

/// Serialized state plus the `seq` it reflects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: Value,
    pub length: u64,
}

struct Subscriber {
    session_id: String,
    sink: Arc<dyn CommitSink>,
    /// Until the frontend confirms it registered the mirror, commits are held back.
    ready: bool,
    backlog: Vec<Commit>,
}

struct Inner<S> {
    state: S,
    activated: bool,
    pending: VecDeque<Commit>,
    seq: u64,
    subscribers: Vec<Subscriber>,
}

impl<S> Inner<S> {
    fn broadcast(&mut self, id: &str, commit: &Commit) {
        self.subscribers.retain_mut(|sub| {
            if sub.ready {
                let delivered = sub.sink.push(&sub.session_id, commit);
                if !delivered {
                    log::debug!("[sync] Session {} of {} is closed, detaching", sub.session_id, id);
                }
                delivered
            } else if sub.backlog.len() >= MAX_PENDING_COMMITS {
                log::error!(
                    "[sync] Session {} of {} was never activated, dropping it",
                    sub.session_id,
                    id
                );
                false
            } else {
                sub.backlog.push(commit.clone());
                true
            }
        });
    }

    fn flush_pending(&mut self, id: &str) -> Vec<Commit> {
        self.activated = true;
        let flushed: Vec<Commit> = self.pending.drain(..).collect();
        for commit in &flushed {
            self.broadcast(id, commit);
        }
        flushed
    }
}

/// Owns one live state object and records every mutation applied to it.
///
/// Until [`activate`](Self::activate) is called, commits are kept in a
/// bounded pending queue and nothing is broadcast. Afterwards each commit is
/// pushed to every subscribed session and to the [`MutationBus`].
pub struct StateContainer<S: SyncState> {
    id: String,
    bus: MutationBus,
    inner: Mutex<Inner<S>>,
    on_commit: Mutex<Option<OnCommit>>,
}

impl<S: SyncState> StateContainer<S> {
    pub fn new(id: impl Into<String>, state: S, bus: MutationBus) -> Self {
        Self {
            id: id.into(),
            bus,
            inner: Mutex::new(Inner {
                state,
                activated: false,
                pending: VecDeque::new(),
                seq: 0,
                subscribers: Vec::new(),
            }),
            on_commit: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn read(&self) -> S {
        self.lock().state.clone()
    }

    /// Borrows the live state under the container lock.
    pub fn with<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.lock().state)
    }

    pub fn seq(&self) -> u64 {
        self.lock().seq
    }

    pub fn is_activated(&self) -> bool {
        self.lock().activated
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// The hook runs after the commit was queued or broadcast, outside the
    /// container lock.
    pub fn set_on_commit(&self, hook: Option<OnCommit>) {
        *self.on_commit.lock().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// Applies `mutation` and records it.
    pub fn mutate(&self, mutation: S::Mutation) -> Result<(), SyncError> {
        let record = MutationRecord::from_mutation(&mutation).map_err(|source| SyncError::Encode {
            state: S::NAME,
            source,
        })?;

        let broadcast = {
            let mut inner = self.lock();
            if !inner.activated && inner.pending.len() >= MAX_PENDING_COMMITS {
                log::error!(
                    "[sync] State {} rejected {}: {} commits are waiting for activation",
                    self.id,
                    record.kind,
                    MAX_PENDING_COMMITS
                );
                return Err(SyncError::PendingOverflow {
                    id: self.id.clone(),
                    limit: MAX_PENDING_COMMITS,
                });
            }

            inner.state.apply(&mutation);
            inner.seq += 1;
            let commit = Commit {
                seq: inner.seq,
                mutation: record.clone(),
            };
            if inner.activated {
                inner.broadcast(&self.id, &commit);
                true
            } else {
                inner.pending.push_back(commit);
                false
            }
        };

        let hook = self
            .on_commit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(&record);
        }
        if broadcast {
            self.bus.emit(&record);
        }
        Ok(())
    }

    /// Applies a mutation given by name. Unknown names and payloads that do
    /// not decode are logged and leave the state untouched.
    pub fn commit(&self, record: &MutationRecord) -> Result<(), SyncError> {
        match decode_mutation::<S>(record) {
            Ok(mutation) => self.mutate(mutation),
            Err(e) => {
                log::error!("[sync] {} (container {})", e, self.id);
                Err(e)
            }
        }
    }

    /// Starts broadcasting and flushes the pending queue in order. Idempotent.
    pub fn activate(&self) {
        let flushed = {
            let mut inner = self.lock();
            if inner.activated {
                return;
            }
            inner.flush_pending(&self.id)
        };
        for commit in &flushed {
            self.bus.emit(&commit.mutation);
        }
    }

    /// Subscribes a session and snapshots the state in the same critical
    /// section, so the session sees every commit after `length` exactly once.
    pub fn attach(&self, session_id: &str, sink: Arc<dyn CommitSink>) -> Result<Snapshot, SyncError> {
        let mut inner = self.lock();
        let state = serde_json::to_value(&inner.state).map_err(|source| SyncError::Encode {
            state: S::NAME,
            source,
        })?;
        inner.subscribers.retain(|sub| sub.session_id != session_id);
        inner.subscribers.push(Subscriber {
            session_id: session_id.to_string(),
            sink,
            ready: false,
            backlog: Vec::new(),
        });
        Ok(Snapshot {
            state,
            length: inner.seq,
        })
    }

    /// Marks a session ready, replays what it missed and activates the
    /// container. Returns `false` for unknown sessions.
    pub fn activate_session(&self, session_id: &str) -> bool {
        let flushed = {
            let mut inner = self.lock();
            let Some(sub) = inner
                .subscribers
                .iter_mut()
                .find(|sub| sub.session_id == session_id)
            else {
                return false;
            };
            if !sub.ready {
                sub.ready = true;
                let backlog = std::mem::take(&mut sub.backlog);
                let mut open = true;
                for commit in &backlog {
                    if !sub.sink.push(&sub.session_id, commit) {
                        open = false;
                        break;
                    }
                }
                if !open {
                    inner.subscribers.retain(|sub| sub.session_id != session_id);
                }
            }
            if inner.activated {
                Vec::new()
            } else {
                inner.flush_pending(&self.id)
            }
        };
        for commit in &flushed {
            self.bus.emit(&commit.mutation);
        }
        true
    }

    /// Removes a session and returns how many remain.
    pub fn detach(&self, session_id: &str) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|sub| sub.session_id != session_id);
        inner.subscribers.len()
    }

    pub fn snapshot(&self) -> Result<Snapshot, SyncError> {
        let inner = self.lock();
        let state = serde_json::to_value(&inner.state).map_err(|source| SyncError::Encode {
            state: S::NAME,
            source,
        })?;
        Ok(Snapshot {
            state,
            length: inner.seq,
        })
    }
}

/// Object-safe view of a container, used where the state type is not known.
pub trait AnyContainer: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn type_name(&self) -> &'static str;
    fn commit_record(&self, record: &MutationRecord) -> Result<(), SyncError>;
    fn activate(&self);
    fn attach(&self, session_id: &str, sink: Arc<dyn CommitSink>) -> Result<Snapshot, SyncError>;
    fn activate_session(&self, session_id: &str) -> bool;
    fn detach(&self, session_id: &str) -> usize;
    fn snapshot(&self) -> Result<Snapshot, SyncError>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<S: SyncState> AnyContainer for StateContainer<S> {
    fn id(&self) -> &str {
        StateContainer::<S>::id(self)
    }

    fn type_name(&self) -> &'static str {
        S::NAME
    }

    fn commit_record(&self, record: &MutationRecord) -> Result<(), SyncError> {
        StateContainer::<S>::commit(self, record)
    }

    fn activate(&self) {
        StateContainer::<S>::activate(self)
    }

    fn attach(&self, session_id: &str, sink: Arc<dyn CommitSink>) -> Result<Snapshot, SyncError> {
        StateContainer::<S>::attach(self, session_id, sink)
    }

    fn activate_session(&self, session_id: &str) -> bool {
        StateContainer::<S>::activate_session(self, session_id)
    }

    fn detach(&self, session_id: &str) -> usize {
        StateContainer::<S>::detach(self, session_id)
    }

    fn snapshot(&self) -> Result<Snapshot, SyncError> {
        StateContainer::<S>::snapshot(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Runs a container's cleanup once.
pub(crate) struct Disposer {
    disposed: AtomicBool,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Disposer {
    pub(crate) fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disposed: AtomicBool::new(false),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Returns `true` only for the call that actually disposed.
    pub(crate) fn run(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let action = self
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(action) = action {
            action();
        }
        true
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Backend handle to a registered container.
pub struct MutableState<S: SyncState> {
    container: Arc<StateContainer<S>>,
    disposer: Arc<Disposer>,
}

impl<S: SyncState> Clone for MutableState<S> {
    fn clone(&self) -> Self {
        Self {
            container: self.container.clone(),
            disposer: self.disposer.clone(),
        }
    }
}

impl<S: SyncState> MutableState<S> {
    pub(crate) fn new(container: Arc<StateContainer<S>>, disposer: Arc<Disposer>) -> Self {
        Self {
            container,
            disposer,
        }
    }

    pub fn id(&self) -> &str {
        self.container.id()
    }

    pub fn read(&self) -> S {
        self.container.read()
    }

    pub fn with<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        self.container.with(f)
    }

    pub fn mutate(&self, mutation: S::Mutation) -> Result<(), SyncError> {
        self.container.mutate(mutation)
    }

    pub fn commit(&self, kind: &str, payload: Value) -> Result<(), SyncError> {
        self.container.commit(&MutationRecord::new(kind, payload))
    }

    pub fn activate(&self) {
        self.container.activate()
    }

    pub fn set_on_mutated(&self, hook: impl Fn(&MutationRecord) + Send + Sync + 'static) {
        self.container.set_on_commit(Some(Arc::new(hook)));
    }

    pub fn container(&self) -> &Arc<StateContainer<S>> {
        &self.container
    }

    pub fn erased(&self) -> Arc<dyn AnyContainer> {
        self.container.clone()
    }

    /// Removes the container from its registry and runs its disposer in the
    /// background. Later calls do nothing.
    pub fn dispose(&self) {
        if self.disposer.run() {
            log::debug!("[sync] Disposed state {}", self.container.id());
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposer.is_disposed()
    }

    pub fn downgrade(&self) -> WeakState<S> {
        WeakState {
            container: Arc::downgrade(&self.container),
            disposer: Arc::downgrade(&self.disposer),
        }
    }
}

/// Non-owning [`MutableState`], for listeners that must not keep a container alive.
pub struct WeakState<S: SyncState> {
    container: Weak<StateContainer<S>>,
    disposer: Weak<Disposer>,
}

impl<S: SyncState> Clone for WeakState<S> {
    fn clone(&self) -> Self {
        Self {
            container: self.container.clone(),
            disposer: self.disposer.clone(),
        }
    }
}

impl<S: SyncState> WeakState<S> {
    pub fn upgrade(&self) -> Option<MutableState<S>> {
        Some(MutableState::new(
            self.container.upgrade()?,
            self.disposer.upgrade()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::{SettingMutation, SettingState};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<(String, Commit)>>,
    }

    impl CommitSink for RecordingSink {
        fn push(&self, session_id: &str, commit: &Commit) -> bool {
            self.received
                .lock()
                .unwrap()
                .push((session_id.to_string(), commit.clone()));
            true
        }
    }

    impl RecordingSink {
        fn seqs(&self) -> Vec<u64> {
            self.received.lock().unwrap().iter().map(|(_, c)| c.seq).collect()
        }
    }

    fn container() -> StateContainer<SettingState> {
        StateContainer::new("settings", SettingState::default(), MutationBus::default())
    }

    #[test]
    fn pending_commits_flush_in_order_on_activation() {
        let container = container();
        let sink = Arc::new(RecordingSink::default());
        let snapshot = container.attach("s1", sink.clone()).unwrap();
        assert_eq!(snapshot.length, 0);

        container.mutate(SettingMutation::LocaleSet("de".into())).unwrap();
        container.mutate(SettingMutation::LocaleSet("fr".into())).unwrap();
        assert_eq!(container.pending_len(), 2);
        assert!(sink.seqs().is_empty());

        assert!(container.activate_session("s1"));
        assert_eq!(sink.seqs(), vec![1, 2]);
        assert_eq!(container.pending_len(), 0);

        container.mutate(SettingMutation::LocaleSet("ja".into())).unwrap();
        assert_eq!(sink.seqs(), vec![1, 2, 3]);
        assert_eq!(container.read().locale, "ja");
    }

    #[test]
    fn activate_is_idempotent() {
        let container = container();
        container.mutate(SettingMutation::LocaleSet("de".into())).unwrap();
        container.activate();
        container.activate();
        assert!(container.is_activated());
        assert_eq!(container.pending_len(), 0);
        assert_eq!(container.seq(), 1);
    }

    #[test]
    fn unknown_mutation_is_a_no_op() {
        let container = container();
        container.activate();
        let before = container.read();

        let result = container.commit(&MutationRecord::new("doesNotExist", json!(1)));
        assert!(matches!(result, Err(SyncError::UnknownMutation { .. })));
        let result = container.commit(&MutationRecord::new("localeSet", json!({ "not": "a string" })));
        assert!(matches!(result, Err(SyncError::InvalidPayload { .. })));

        assert_eq!(container.read(), before);
        assert_eq!(container.seq(), 0);
    }

    #[test]
    fn pending_overflow_fails_without_mutating() {
        let container = container();
        for i in 0..MAX_PENDING_COMMITS {
            container
                .mutate(SettingMutation::MaxSocketsSet(i as u32))
                .unwrap();
        }
        let result = container.mutate(SettingMutation::LocaleSet("xx".into()));
        assert!(matches!(result, Err(SyncError::PendingOverflow { .. })));
        assert_ne!(container.read().locale, "xx");
        assert_eq!(container.seq(), MAX_PENDING_COMMITS as u64);
    }

    #[test]
    fn session_attached_after_activation_waits_for_its_own_activation() {
        let container = container();
        container.activate();
        container.mutate(SettingMutation::LocaleSet("de".into())).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let snapshot = container.attach("late", sink.clone()).unwrap();
        assert_eq!(snapshot.length, 1);
        assert_eq!(snapshot.state["locale"], "de");

        container.mutate(SettingMutation::LocaleSet("fr".into())).unwrap();
        assert!(sink.seqs().is_empty());

        container.activate_session("late");
        assert_eq!(sink.seqs(), vec![2]);
    }

    #[test]
    fn on_commit_hook_sees_every_record() {
        let container = container();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        container.set_on_commit(Some(Arc::new(move |record: &MutationRecord| {
            sink.lock().unwrap().push(record.kind.clone());
        })));
        container.mutate(SettingMutation::LocaleSet("de".into())).unwrap();
        container.activate();
        container.mutate(SettingMutation::MaxSocketsSet(4)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["localeSet", "maxSocketsSet"]);
    }

    #[test]
    fn disposer_runs_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = count.clone();
        let disposer = Disposer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(disposer.run());
        assert!(!disposer.run());
        assert!(disposer.is_disposed());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
