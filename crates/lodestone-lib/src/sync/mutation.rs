use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire form of one mutation: `{ "type": <name>, "payload": <value> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl MutationRecord {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Encodes a typed, adjacently tagged mutation.
    pub fn from_mutation<M: Serialize>(mutation: &M) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(mutation)?)
    }

    pub fn to_mutation<M: DeserializeOwned>(&self) -> Result<M, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }
}

/// A mutation as produced by one container, numbered within that container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub seq: u64,
    pub mutation: MutationRecord,
}
