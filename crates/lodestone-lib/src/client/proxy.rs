use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::{ClientError, ClientStates};
use crate::sync::{MirrorState, MutationRecord, Snapshot, StateDescriptor, SyncError, SyncState};
use crate::transport::ClientMessage;

type MutatedHook = Arc<dyn Fn(&MutationRecord) + Send + Sync>;

struct Mirror {
    state: Box<dyn MirrorState>,
    /// `seq` of the last commit reflected in `state`.
    checkpoint: u64,
    disposed: bool,
}

pub(crate) struct ProxyShared {
    pub(crate) session_id: String,
    descriptor: StateDescriptor,
    mirror: Mutex<Mirror>,
    pub(crate) holders: AtomicUsize,
    on_mutated: Mutex<Option<MutatedHook>>,
}

impl ProxyShared {
    pub(crate) fn new(
        session_id: String,
        descriptor: StateDescriptor,
        state: Box<dyn MirrorState>,
        checkpoint: u64,
    ) -> Self {
        Self {
            session_id,
            descriptor,
            mirror: Mutex::new(Mirror {
                state,
                checkpoint,
                disposed: false,
            }),
            holders: AtomicUsize::new(1),
            on_mutated: Mutex::new(None),
        }
    }

    fn mirror(&self) -> MutexGuard<'_, Mirror> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mark_disposed(&self) {
        self.mirror().disposed = true;
    }

    pub(crate) fn apply(&self, seq: u64, mutation: &MutationRecord) {
        {
            let mut mirror = self.mirror();
            if mirror.disposed || seq <= mirror.checkpoint {
                log::debug!(
                    "[client] Ignoring stale commit {} on {} (checkpoint {})",
                    seq,
                    self.session_id,
                    mirror.checkpoint
                );
                return;
            }
            match mirror.state.apply_record(mutation) {
                Ok(()) => {}
                Err(SyncError::UnknownMutation { .. }) => {
                    self.assign_payload(&mut mirror, mutation)
                }
                Err(e) => log::warn!("[client] {} on {}", e, self.session_id),
            }
            mirror.checkpoint = seq;
        }

        let hook = self
            .on_mutated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(mutation);
        }
    }

    /// Mutations this build does not know about: merge an object payload
    /// into the mirror's fields.
    fn assign_payload(&self, mirror: &mut Mirror, mutation: &MutationRecord) {
        let Value::Object(payload) = &mutation.payload else {
            log::warn!(
                "[client] Cannot apply unknown mutation {} to {}",
                mutation.kind,
                self.descriptor.name
            );
            return;
        };
        let merged = mirror.state.to_value().map(|mut value| {
            if let Value::Object(fields) = &mut value {
                for (key, field) in payload {
                    fields.insert(key.clone(), field.clone());
                }
            }
            value
        });
        match merged.and_then(|value| self.descriptor.restore(value)) {
            Ok(state) => mirror.state = state,
            Err(e) => log::warn!("[client] {} while applying {}", e, mutation.kind),
        }
    }
}

/// A frontend mirror of one backend state.
///
/// Clones share one handle: disposing any of them disposes the handle once.
#[derive(Clone)]
pub struct ClientStateProxy {
    shared: Arc<ProxyShared>,
    states: ClientStates,
    released: Arc<AtomicBool>,
}

impl ClientStateProxy {
    pub(crate) fn new(shared: Arc<ProxyShared>, states: ClientStates) -> Self {
        Self {
            shared,
            states,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn type_name(&self) -> &'static str {
        self.shared.descriptor.name
    }

    pub fn checkpoint(&self) -> u64 {
        self.shared.mirror().checkpoint
    }

    pub fn is_disposed(&self) -> bool {
        self.released.load(Ordering::SeqCst) || self.shared.mirror().disposed
    }

    /// A copy of the mirrored state, `None` if it is not an `S`.
    pub fn get<S: SyncState>(&self) -> Option<S> {
        self.shared
            .mirror()
            .state
            .as_any()
            .downcast_ref::<S>()
            .cloned()
    }

    pub fn to_value(&self) -> Result<Value, ClientError> {
        Ok(self.shared.mirror().state.to_value()?)
    }

    /// Forwards a mutation to the backend. The mirror changes only when the
    /// resulting commit is pushed back.
    pub fn mutate<S: SyncState>(&self, mutation: S::Mutation) -> Result<(), ClientError> {
        if S::NAME != self.type_name() {
            return Err(ClientError::UnexpectedState {
                expected: S::NAME,
                found: self.type_name(),
            });
        }
        let record = MutationRecord::from_mutation(&mutation)?;
        self.commit(&record.kind, record.payload)
    }

    /// Forwards a mutation given by name.
    pub fn commit(&self, kind: &str, payload: Value) -> Result<(), ClientError> {
        if self.is_disposed() {
            return Err(SyncError::Disposed {
                session: self.session_id().to_string(),
            }
            .into());
        }
        if !self.shared.descriptor.has_mutation(kind) {
            return Err(SyncError::UnknownMutation {
                state: self.shared.descriptor.name,
                kind: kind.to_string(),
            }
            .into());
        }
        self.states.requester().send(ClientMessage::Commit {
            session_id: self.session_id().to_string(),
            mutation: MutationRecord::new(kind, payload),
        })
    }

    /// Called after every pushed commit is applied.
    pub fn on_mutated(&self, hook: impl Fn(&MutationRecord) + Send + Sync + 'static) {
        *self
            .shared
            .on_mutated
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Replaces the mirror with the backend's current snapshot.
    pub async fn resync(&self) -> Result<(), ClientError> {
        let session_id = self.session_id().to_string();
        let response = self
            .states
            .requester()
            .request(|request_id| ClientMessage::Sync {
                request_id,
                session_id,
            })
            .await?;
        let snapshot: Snapshot = serde_json::from_value(response.into_result()?)?;
        let state = self.shared.descriptor.restore(snapshot.state)?;

        let mut mirror = self.shared.mirror();
        if mirror.disposed {
            return Err(SyncError::Disposed {
                session: self.session_id().to_string(),
            }
            .into());
        }
        // Commits newer than the snapshot may already have been applied.
        if snapshot.length >= mirror.checkpoint {
            mirror.state = state;
            mirror.checkpoint = snapshot.length;
        }
        Ok(())
    }

    /// Stops mirroring. Only the first call on a handle has an effect.
    pub fn dispose(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.shared.holders.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.states.release(&self.shared);
        }
    }
}

impl std::fmt::Debug for ClientStateProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStateProxy")
            .field("session_id", &self.shared.session_id)
            .field("type", &self.type_name())
            .finish()
    }
}
