use serde::{Deserialize, Serialize};

use crate::sync::SyncState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LaunchStatus {
    #[default]
    Idle,
    CheckingProblems,
    InjectingAuthLib,
    Launching,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchState {
    pub status: LaunchStatus,
    /// Number of game processes currently running.
    pub active_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum LaunchMutation {
    LaunchStatus(LaunchStatus),
    LaunchCount(i64),
}

impl SyncState for LaunchState {
    const NAME: &'static str = "LaunchState";
    const MUTATIONS: &'static [&'static str] = &["launchStatus", "launchCount"];
    type Mutation = LaunchMutation;

    fn apply(&mut self, mutation: &LaunchMutation) {
        match mutation {
            LaunchMutation::LaunchStatus(status) => self.status = *status,
            LaunchMutation::LaunchCount(count) => {
                self.active_count = (*count).clamp(0, u32::MAX as i64) as u32
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::MutationRecord;
    use serde_json::json;

    #[test]
    fn active_count_never_goes_negative() {
        let mut state = LaunchState::default();
        state.apply(&LaunchMutation::LaunchCount(-1));
        assert_eq!(state.active_count, 0);
        state.apply(&LaunchMutation::LaunchCount(2));
        assert_eq!(state.active_count, 2);
    }

    #[test]
    fn mutations_use_type_and_payload_on_the_wire() {
        let record =
            MutationRecord::from_mutation(&LaunchMutation::LaunchStatus(LaunchStatus::CheckingProblems))
                .unwrap();
        assert_eq!(record.kind, "launchStatus");
        assert_eq!(record.payload, json!("checkingProblems"));
    }
}
