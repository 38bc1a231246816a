//! Cluster-visible cancellation entries and the scopes built on them.

use std::fmt;
use std::sync::Arc;

use stratus_types::CancellationId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::RuntimeFut;
use crate::error::RuntimeError;

/// A cancellation flag shared across the cluster.
///
/// `cancel` is idempotent: only the first call transitions the entry.
pub trait CancellationEntry: Send + Sync {
    fn id(&self) -> CancellationId;
    fn cancel(&self) -> RuntimeFut<'_, Result<(), RuntimeError>>;
    fn is_cancellation_requested(&self) -> RuntimeFut<'_, Result<bool, RuntimeError>>;
    /// Resolves once the entry has been cancelled.
    fn cancelled(&self) -> RuntimeFut<'_, ()>;
}

/// Creates cancellation entries.
pub trait PrimitivesFactory: Send + Sync {
    fn create_cancellation_entry(&self) -> RuntimeFut<'_, Result<CancellationScope, RuntimeError>>;
}

/// Handle to the cancellation entry governing one submission.
#[derive(Clone)]
pub struct CancellationScope {
    entry: Arc<dyn CancellationEntry>,
}

impl fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancellationScope")
            .field(&self.entry.id())
            .finish()
    }
}

impl CancellationScope {
    #[must_use]
    pub fn new(entry: Arc<dyn CancellationEntry>) -> Self {
        Self { entry }
    }

    #[must_use]
    pub fn id(&self) -> CancellationId {
        self.entry.id()
    }

    pub async fn cancel(&self) -> Result<(), RuntimeError> {
        self.entry.cancel().await
    }

    pub async fn is_cancellation_requested(&self) -> Result<bool, RuntimeError> {
        self.entry.is_cancellation_requested().await
    }

    pub async fn cancelled(&self) {
        self.entry.cancelled().await;
    }
}

/// Cancels its scope when released or dropped.
///
/// `release` cancels inline. Dropping an unreleased guard (the submitting
/// future was itself dropped) spawns the cancel onto the current runtime.
pub struct ScopeGuard {
    scope: Option<CancellationScope>,
}

impl ScopeGuard {
    #[must_use]
    pub fn new(scope: CancellationScope) -> Self {
        Self { scope: Some(scope) }
    }

    pub async fn release(mut self) {
        if let Some(scope) = self.scope.take()
            && let Err(e) = scope.cancel().await
        {
            tracing::warn!(scope = %scope.id(), error = %e, "Failed to cancel submission scope");
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(scope) = self.scope.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = scope.cancel().await {
                        tracing::warn!(scope = %scope.id(), error = %e, "Failed to cancel abandoned scope");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(scope = %scope.id(), "No runtime to cancel abandoned scope");
            }
        }
    }
}

/// Forwards an external token's cancellation into a scope while alive.
pub struct CancellationBridge {
    task: JoinHandle<()>,
}

impl CancellationBridge {
    #[must_use]
    pub fn link(external: CancellationToken, scope: CancellationScope) -> Self {
        let task = tokio::spawn(async move {
            external.cancelled().await;
            tracing::debug!(scope = %scope.id(), "External cancellation requested");
            if let Err(e) = scope.cancel().await {
                tracing::warn!(scope = %scope.id(), error = %e, "Failed to propagate cancellation");
            }
        });
        Self { task }
    }
}

impl Drop for CancellationBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::InMemoryPrimitives;

    #[tokio::test]
    async fn guard_release_cancels_once() {
        let primitives = InMemoryPrimitives::new();
        let scope = primitives.create_cancellation_entry().await.unwrap();

        ScopeGuard::new(scope.clone()).release().await;
        assert!(scope.is_cancellation_requested().await.unwrap());

        scope.cancel().await.unwrap();
        assert_eq!(primitives.cancelled_count(), 1);
    }

    #[tokio::test]
    async fn dropped_guard_cancels_in_background() {
        let primitives = InMemoryPrimitives::new();
        let scope = primitives.create_cancellation_entry().await.unwrap();

        drop(ScopeGuard::new(scope.clone()));
        tokio::time::timeout(Duration::from_secs(1), scope.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bridge_forwards_external_cancellation() {
        let primitives = InMemoryPrimitives::new();
        let scope = primitives.create_cancellation_entry().await.unwrap();
        let token = CancellationToken::new();

        let _bridge = CancellationBridge::link(token.clone(), scope.clone());
        assert!(!scope.is_cancellation_requested().await.unwrap());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), scope.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_bridge_stops_forwarding() {
        let primitives = InMemoryPrimitives::new();
        let scope = primitives.create_cancellation_entry().await.unwrap();
        let token = CancellationToken::new();

        drop(CancellationBridge::link(token.clone(), scope.clone()));
        token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!scope.is_cancellation_requested().await.unwrap());
    }
}
