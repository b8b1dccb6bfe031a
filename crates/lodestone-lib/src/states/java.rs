use serde::{Deserialize, Serialize};

use crate::sync::SyncState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavaRecord {
    pub path: String,
    pub version: String,
    pub major_version: u32,
    pub valid: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JavaState {
    pub all: Vec<JavaRecord>,
}

impl JavaState {
    /// Newest valid installation.
    pub fn preferred(&self) -> Option<&JavaRecord> {
        self.all
            .iter()
            .filter(|j| j.valid)
            .max_by_key(|j| j.major_version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum JavaMutation {
    /// Inserts records, replacing those with the same path.
    JavaUpdate(Vec<JavaRecord>),
    JavaRemove(String),
}

impl SyncState for JavaState {
    const NAME: &'static str = "JavaState";
    const MUTATIONS: &'static [&'static str] = &["javaUpdate", "javaRemove"];
    type Mutation = JavaMutation;

    fn apply(&mut self, mutation: &JavaMutation) {
        match mutation {
            JavaMutation::JavaUpdate(records) => {
                for record in records {
                    match self.all.iter_mut().find(|j| j.path == record.path) {
                        Some(existing) => *existing = record.clone(),
                        None => self.all.push(record.clone()),
                    }
                }
            }
            JavaMutation::JavaRemove(path) => self.all.retain(|j| &j.path != path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, major: u32, valid: bool) -> JavaRecord {
        JavaRecord {
            path: path.into(),
            version: format!("{major}.0.1"),
            major_version: major,
            valid,
        }
    }

    #[test]
    fn update_replaces_by_path() {
        let mut state = JavaState::default();
        state.apply(&JavaMutation::JavaUpdate(vec![record("/a", 8, true), record("/b", 17, false)]));
        state.apply(&JavaMutation::JavaUpdate(vec![record("/b", 17, true)]));
        assert_eq!(state.all.len(), 2);
        assert_eq!(state.preferred().map(|j| j.path.as_str()), Some("/b"));

        state.apply(&JavaMutation::JavaRemove("/b".into()));
        assert_eq!(state.preferred().map(|j| j.path.as_str()), Some("/a"));
    }
}
