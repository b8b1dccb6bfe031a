use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{ClientError, ClientStateProxy};

/// Holds the newest subscription for one logical key.
///
/// Starting a subscription disposes the previous one. If an older fetch
/// completes after a newer one started, its result is disposed and dropped.
#[derive(Default)]
pub struct LatestSubscription {
    generation: AtomicU64,
    current: Mutex<Option<ClientStateProxy>>,
}

impl LatestSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(None)` when a newer subscription superseded this one.
    pub async fn subscribe<F, Fut>(&self, fetch: F) -> Result<Option<ClientStateProxy>, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ClientStateProxy, ClientError>>,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.dispose();
        }

        let proxy = fetch().await?;

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != generation {
            drop(current);
            proxy.dispose();
            return Ok(None);
        }
        if let Some(stale) = current.replace(proxy.clone()) {
            stale.dispose();
        }
        Ok(Some(proxy))
    }

    pub fn current(&self) -> Option<ClientStateProxy> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Disposes the held subscription and invalidates any in-flight one.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(current) = current {
            current.dispose();
        }
    }
}
