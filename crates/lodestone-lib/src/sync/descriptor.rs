use std::any::Any;
use std::collections::HashMap;

use serde_json::Value;

use super::{decode_mutation, MutationRecord, SyncError, SyncState};

/// Type-erased view of a state used by frontend mirrors.
pub trait MirrorState: Any + Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Applies a wire record with the same function the backend used.
    fn apply_record(&mut self, record: &MutationRecord) -> Result<(), SyncError>;

    fn to_value(&self) -> Result<Value, SyncError>;

    fn as_any(&self) -> &dyn Any;
}

impl<S: SyncState> MirrorState for S {
    fn type_name(&self) -> &'static str {
        S::NAME
    }

    fn apply_record(&mut self, record: &MutationRecord) -> Result<(), SyncError> {
        let mutation = decode_mutation::<S>(record)?;
        self.apply(&mutation);
        Ok(())
    }

    fn to_value(&self) -> Result<Value, SyncError> {
        serde_json::to_value(self).map_err(|source| SyncError::Encode {
            state: S::NAME,
            source,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Static metadata for one state type, built once at startup.
#[derive(Clone, Copy)]
pub struct StateDescriptor {
    pub name: &'static str,
    pub mutations: &'static [&'static str],
    construct: fn() -> Box<dyn MirrorState>,
    restore: fn(Value) -> Result<Box<dyn MirrorState>, serde_json::Error>,
}

fn construct<S: SyncState>() -> Box<dyn MirrorState> {
    Box::new(S::default())
}

fn restore<S: SyncState>(value: Value) -> Result<Box<dyn MirrorState>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<S>(value)?))
}

impl StateDescriptor {
    pub fn of<S: SyncState>() -> Self {
        Self {
            name: S::NAME,
            mutations: S::MUTATIONS,
            construct: construct::<S>,
            restore: restore::<S>,
        }
    }

    /// A fresh instance from the zero-argument constructor.
    pub fn construct(&self) -> Box<dyn MirrorState> {
        (self.construct)()
    }

    pub fn restore(&self, value: Value) -> Result<Box<dyn MirrorState>, SyncError> {
        (self.restore)(value).map_err(|source| SyncError::Encode {
            state: self.name,
            source,
        })
    }

    pub fn has_mutation(&self, kind: &str) -> bool {
        self.mutations.contains(&kind)
    }
}

impl std::fmt::Debug for StateDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDescriptor")
            .field("name", &self.name)
            .field("mutations", &self.mutations)
            .finish()
    }
}

/// Descriptors keyed by state type name.
#[derive(Debug, Clone, Default)]
pub struct DescriptorTable {
    by_name: HashMap<&'static str, StateDescriptor>,
}

impl DescriptorTable {
    pub fn new(descriptors: impl IntoIterator<Item = StateDescriptor>) -> Self {
        Self {
            by_name: descriptors.into_iter().map(|d| (d.name, d)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&StateDescriptor> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
