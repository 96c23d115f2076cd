//! Lock Manager (C5): acquire / refresh / release the advisory lease
//! encoded in a control record's `locked_until`.

use composable_rust_core::projection::{ControlRecordStore, Result};
use composable_rust_core::{DateTime, Utc};
use std::sync::Arc;

/// Cooperative lease manager over a shared [`ControlRecordStore`].
///
/// The lease is a future timestamp, not a token: ownership is implied by
/// whoever last wrote a `locked_until` in the future, and there is no
/// fencing. See §5 for the concurrency model this implies.
pub struct LockManager {
    store: Arc<dyn ControlRecordStore>,
    lock_timeout: chrono::Duration,
    update_lock_threshold: chrono::Duration,
    last_lock_update: Option<DateTime<Utc>>,
}

impl LockManager {
    /// Build a lock manager with the given lease timeout and refresh
    /// threshold.
    #[must_use]
    pub fn new(
        store: Arc<dyn ControlRecordStore>,
        lock_timeout: chrono::Duration,
        update_lock_threshold: chrono::Duration,
    ) -> Self {
        Self {
            store,
            lock_timeout,
            update_lock_threshold,
            last_lock_update: None,
        }
    }

    /// Default tunables: 1000ms lease, refresh on every idle poll.
    #[must_use]
    pub fn with_defaults(store: Arc<dyn ControlRecordStore>) -> Self {
        Self::new(
            store,
            chrono::Duration::milliseconds(1000),
            chrono::Duration::zero(),
        )
    }

    /// Conditionally acquire the lease for `name`.
    ///
    /// Per the tightened reading of §4.3/§9, the store implementation itself
    /// verifies the conditional update affected a row and returns
    /// `LockNotAcquired` when it doesn't, rather than this manager proceeding
    /// optimistically. `LockManager` does no additional bookkeeping beyond
    /// recording `last_lock_update` on success — the affected-row check lives
    /// in each `ControlRecordStore` implementation, since only the store
    /// knows how to express "conditional update, zero rows" atomically.
    ///
    /// # Errors
    ///
    /// Propagates [`composable_rust_core::projection::ProjectionError::ProjectionNotFound`]
    /// if the row does not exist, or `LockNotAcquired` if another runner
    /// currently holds an unexpired lease.
    pub async fn acquire(&mut self, name: &str) -> Result<()> {
        let now = Utc::now();
        let locked_until = now + self.lock_timeout;
        self.store.acquire_lock(name, locked_until).await?;
        self.last_lock_update = Some(now);
        Ok(())
    }

    /// Refresh the lease if `should_update_lock` says it's due.
    ///
    /// Called on idle polls (no new events this pass) to keep a live
    /// projector's lease from expiring while it waits.
    ///
    /// # Errors
    ///
    /// Propagates [`composable_rust_core::projection::ProjectionError::ProjectionNotFound`]
    /// if the row does not exist.
    pub async fn maybe_refresh(&mut self, name: &str) -> Result<()> {
        let now = Utc::now();
        if !self.should_update_lock(now) {
            return Ok(());
        }
        self.store.refresh_lock(name, now + self.lock_timeout).await?;
        self.last_lock_update = Some(now);
        Ok(())
    }

    /// Whether a refresh is due at `now`.
    ///
    /// Always due if `update_lock_threshold` is zero or no refresh has
    /// happened yet; otherwise only once the threshold has elapsed since
    /// the last refresh.
    #[must_use]
    pub fn should_update_lock(&self, now: DateTime<Utc>) -> bool {
        match self.last_lock_update {
            None => true,
            Some(_) if self.update_lock_threshold.is_zero() => true,
            Some(last) => now >= last + self.update_lock_threshold,
        }
    }

    /// Release the lease and set status back to idle.
    ///
    /// # Errors
    ///
    /// Propagates [`composable_rust_core::projection::ProjectionError::ProjectionNotFound`]
    /// if the row does not exist.
    pub async fn release(&mut self, name: &str) -> Result<()> {
        self.store
            .clear_lock(name, composable_rust_core::projection::ProjectionStatus::Idle)
            .await?;
        self.last_lock_update = None;
        Ok(())
    }
}
