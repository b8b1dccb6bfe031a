//! Core library of the Lodestone launcher backend.
//!
//! The crate is split in two halves. The synchronization layer (`sync`,
//! `service`, `transport`, `client`) keeps backend-owned state mirrored into
//! frontends. The domain services (`launch`, `user`, `java`, `setting`) own
//! that state and are wired together by [`launcher::Launcher`].

pub mod client;
pub mod config;
pub mod error;
pub mod java;
pub mod launch;
pub mod launcher;
pub mod service;
pub mod setting;
pub mod states;
pub mod sync;
pub mod transport;
pub mod user;
pub mod utils;

pub use error::{DispatchError, SerializedError, ServiceError};
pub use launcher::{Launcher, LauncherCollaborators};
