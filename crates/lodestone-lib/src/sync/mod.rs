//! Backend half of the state synchronization layer.
//!
//! A [`StateContainer`] owns one live state object and turns every mutation
//! into a numbered [`Commit`]. The [`StateRegistry`] keeps containers by id,
//! tracks which frontend session watches which container, and owns the
//! process-wide [`MutationBus`].

mod bus;
mod container;
mod descriptor;
mod mutation;
mod registry;

pub use bus::{MutationBus, MutationListener, SubscriptionToken};
pub use container::{
    AnyContainer, CommitSink, MutableState, OnCommit, Snapshot, StateContainer, WeakState,
    MAX_PENDING_COMMITS,
};
pub use descriptor::{DescriptorTable, MirrorState, StateDescriptor};
pub use mutation::{Commit, MutationRecord};
pub use registry::{no_dispose, StateDisposer, StateRegistry, TrackedState};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::error::ErrorKind;

/// Identifies one connected frontend.
pub type ClientId = String;

/// A state type that can live in a container and be mirrored by frontends.
///
/// `apply` must be deterministic: the backend and every mirror run the same
/// function over the same ordered commits and end up with equal states.
pub trait SyncState:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Type name carried in the `__state__` field of snapshots.
    const NAME: &'static str;

    /// Every mutation name this state accepts, in declaration order.
    const MUTATIONS: &'static [&'static str];

    /// Adjacently tagged (`{type, payload}`) mutation enum.
    type Mutation: Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static;

    fn apply(&mut self, mutation: &Self::Mutation);
}

/// Decodes a wire record into the typed mutation of `S`.
pub(crate) fn decode_mutation<S: SyncState>(
    record: &MutationRecord,
) -> Result<S::Mutation, SyncError> {
    if !S::MUTATIONS.contains(&record.kind.as_str()) {
        return Err(SyncError::UnknownMutation {
            state: S::NAME,
            kind: record.kind.clone(),
        });
    }
    record
        .to_mutation::<S::Mutation>()
        .map_err(|source| SyncError::InvalidPayload {
            state: S::NAME,
            kind: record.kind.clone(),
            source,
        })
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot find mutation named {kind} in state {state}")]
    UnknownMutation { state: &'static str, kind: String },

    #[error("payload of mutation {kind} does not fit state {state}")]
    InvalidPayload {
        state: &'static str,
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state {state}")]
    Encode {
        state: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("state {id} has {limit} commits waiting for activation")]
    PendingOverflow { id: String, limit: usize },

    #[error("state {id} holds a {found}, not a {expected}")]
    TypeMismatch {
        id: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("state {id} is already registered")]
    AlreadyRegistered { id: String },

    #[error("no state session {session}")]
    SessionNotFound { session: String },

    #[error("no descriptor for state type {name}")]
    UnknownState { name: String },

    #[error("state session {session} is disposed")]
    Disposed { session: String },
}

impl ErrorKind for SyncError {
    fn kind(&self) -> &'static str {
        match self {
            SyncError::UnknownMutation { .. } => "SyncUnknownMutation",
            SyncError::InvalidPayload { .. } => "SyncInvalidPayload",
            SyncError::Encode { .. } => "SyncEncode",
            SyncError::PendingOverflow { .. } => "SyncPendingOverflow",
            SyncError::TypeMismatch { .. } => "SyncTypeMismatch",
            SyncError::AlreadyRegistered { .. } => "SyncAlreadyRegistered",
            SyncError::SessionNotFound { .. } => "SessionNotFound",
            SyncError::UnknownState { .. } => "SyncUnknownState",
            SyncError::Disposed { .. } => "SyncDisposed",
        }
    }

    fn details(&self) -> Value {
        match self {
            SyncError::UnknownMutation { state, kind } => json!({ "state": state, "type": kind }),
            SyncError::PendingOverflow { id, limit } => json!({ "id": id, "limit": limit }),
            SyncError::SessionNotFound { session } | SyncError::Disposed { session } => {
                json!({ "session": session })
            }
            _ => Value::Null,
        }
    }
}
