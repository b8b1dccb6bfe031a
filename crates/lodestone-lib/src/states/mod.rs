//! State types shared by the backend services and frontend mirrors.

mod java;
mod launch;
mod setting;
mod user;

pub use java::{JavaMutation, JavaRecord, JavaState};
pub use launch::{LaunchMutation, LaunchState, LaunchStatus};
pub use setting::{MemoryRange, SettingMutation, SettingState};
pub use user::{
    GameProfile, ProfileSelection, SkinInfo, UserMutation, UserProfile, UserState, YggdrasilApi,
};

use crate::sync::{DescriptorTable, StateDescriptor};

/// Descriptors of every state type a frontend can receive.
pub fn all_descriptors() -> Vec<StateDescriptor> {
    vec![
        StateDescriptor::of::<LaunchState>(),
        StateDescriptor::of::<UserState>(),
        StateDescriptor::of::<JavaState>(),
        StateDescriptor::of::<SettingState>(),
    ]
}

pub fn descriptor_table() -> DescriptorTable {
    DescriptorTable::new(all_descriptors())
}
