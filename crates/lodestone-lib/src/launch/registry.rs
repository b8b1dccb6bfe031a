use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, RwLock};

/// A game process started by this launcher.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSession {
    pub id: u64,
    pub pid: Option<u32>,
    pub version: String,
    pub minecraft: String,
    pub java: String,
    pub game_directory: PathBuf,
    pub started_at: DateTime<Utc>,
}

struct RunningGame {
    session: LaunchSession,
    kill: Option<oneshot::Sender<()>>,
}

/// In-memory registry of running game processes.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    games: Arc<RwLock<HashMap<u64, RunningGame>>>,
    next_id: Arc<AtomicU64>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a running game. Sending on `kill` asks its supervisor to
    /// terminate it.
    pub async fn register(&self, session: LaunchSession, kill: oneshot::Sender<()>) {
        log::info!(
            "[launch] Registering game session {} (PID {:?})",
            session.id,
            session.pid
        );
        self.games.write().await.insert(
            session.id,
            RunningGame {
                session,
                kill: Some(kill),
            },
        );
    }

    pub async fn unregister(&self, id: u64) -> Option<LaunchSession> {
        log::info!("[launch] Unregistering game session {}", id);
        self.games.write().await.remove(&id).map(|game| game.session)
    }

    /// All running sessions, oldest first.
    pub async fn get_all(&self) -> Vec<LaunchSession> {
        let games = self.games.read().await;
        let mut sessions: Vec<_> = games.values().map(|game| game.session.clone()).collect();
        sessions.sort_by_key(|session| session.id);
        sessions
    }

    pub async fn is_running(&self, id: u64) -> bool {
        self.games.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    /// Signal the most recently started game that has not been killed yet.
    pub async fn kill_latest(&self) -> Option<LaunchSession> {
        let mut games = self.games.write().await;
        let latest = games
            .values_mut()
            .filter(|game| game.kill.is_some())
            .max_by_key(|game| game.session.id)?;
        let kill = latest.kill.take()?;
        if kill.send(()).is_err() {
            log::warn!(
                "[launch] Supervisor of session {} is already gone",
                latest.session.id
            );
        }
        Some(latest.session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(registry: &ProcessRegistry) -> LaunchSession {
        LaunchSession {
            id: registry.next_id(),
            pid: Some(42),
            version: "1.20.1".into(),
            minecraft: "1.20.1".into(),
            java: "/usr/bin/java".into(),
            game_directory: PathBuf::from("/games"),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn kill_targets_most_recent_session_once() {
        let registry = ProcessRegistry::new();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        let first = session(&registry);
        let second = session(&registry);
        registry.register(first.clone(), first_tx).await;
        registry.register(second.clone(), second_tx).await;

        assert_eq!(registry.kill_latest().await.map(|s| s.id), Some(second.id));
        assert!(second_rx.try_recv().is_ok());
        assert!(first_rx.try_recv().is_err());

        assert_eq!(registry.kill_latest().await.map(|s| s.id), Some(first.id));
        assert!(registry.kill_latest().await.is_none());
        assert_eq!(registry.len().await, 2);

        registry.unregister(first.id).await;
        assert!(!registry.is_running(first.id).await);
        assert_eq!(registry.get_all().await.len(), 1);
    }
}
