use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;

use super::UserError;

/// Cancellation signal handed to a running account operation.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        CancelToken(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled. Never resolves if the controller went away
    /// without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `operation`, failing with [`UserError::Cancelled`] on cancel.
    pub async fn run<T, F>(&self, name: &'static str, operation: F) -> Result<T, UserError>
    where
        F: Future<Output = Result<T, UserError>>,
    {
        tokio::select! {
            result = operation => result,
            _ = self.cancelled() => Err(UserError::Cancelled { operation: name }),
        }
    }
}

/// One in-flight operation of a kind. Beginning a new one cancels the
/// previous one.
#[derive(Debug, Default)]
pub struct CancelSlot {
    current: Mutex<Option<(u64, watch::Sender<bool>)>>,
    next_id: AtomicU64,
}

impl CancelSlot {
    pub fn begin(&self) -> CancelGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(false);
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((id, tx));
        if let Some((_, previous)) = previous {
            previous.send_replace(true);
        }
        CancelGuard {
            slot: self,
            id,
            token: CancelToken(rx),
        }
    }

    /// Cancel the in-flight operation. Returns `false` if there was none.
    pub fn abort(&self) -> bool {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match current {
            Some((_, tx)) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Clears its slot when the operation ends.
pub struct CancelGuard<'a> {
    slot: &'a CancelSlot,
    id: u64,
    token: CancelToken,
}

impl CancelGuard<'_> {
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        let mut current = self
            .slot
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(&*current, Some((id, _)) if *id == self.id) {
            current.take();
        }
    }
}
