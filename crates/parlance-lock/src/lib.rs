//! Exclusive per-conversation locks.
//!
//! At most one turn may run against a conversation at a time. A turn takes
//! the lock under `session-lock:{session_id}` with a fresh random token and a
//! time-to-live; release deletes the entry only while it still holds that
//! token, so a holder whose lock expired and was taken over cannot remove the
//! new holder's lock.
//!
//! Acquisition never waits: a held lock fails fast with [`LockError::Busy`].
//! The TTL bounds how long a crashed holder blocks the conversation; a live
//! holder keeps its lock by calling [`LockGuard::renew`] well within the TTL.

mod backend;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use backend::{LockBackend, MemoryLockBackend, SqliteLockBackend};

/// Default lifetime of a lock that is never released.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Errors that can occur while taking or releasing a lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another turn currently holds the conversation.
    #[error("session {0} is busy")]
    Busy(String),

    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Hands out exclusive per-conversation locks from a shared backend.
#[derive(Clone)]
pub struct SessionLock {
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
}

impl SessionLock {
    pub fn new(backend: Arc<dyn LockBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Takes the lock for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Busy` if a live lock exists, or
    /// `LockError::Backend` if the backend could not be reached.
    pub async fn acquire(&self, session_id: &str) -> Result<LockGuard, LockError> {
        let key = lock_key(session_id);
        let token = uuid::Uuid::new_v4().to_string();

        if !self.backend.set_if_absent(&key, &token, self.ttl).await? {
            tracing::debug!(session_id, "session lock busy");
            return Err(LockError::Busy(session_id.to_string()));
        }

        tracing::debug!(session_id, ttl_ms = self.ttl.as_millis() as u64, "session lock acquired");
        Ok(LockGuard {
            backend: Arc::clone(&self.backend),
            key,
            token,
            ttl: self.ttl,
            released: false,
        })
    }
}

/// Storage key of the lock for `session_id`.
pub fn lock_key(session_id: &str) -> String {
    format!("session-lock:{session_id}")
}

/// Proof of holding a conversation lock.
///
/// Call [`LockGuard::release`] on every exit path. A guard dropped without
/// release schedules the release on the current tokio runtime.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    ttl: Duration,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Restarts the TTL of a lock this guard still holds.
    ///
    /// Returns `false` once the lock has expired or been taken over; the
    /// guard no longer protects anything and the holder should stop.
    pub async fn renew(&self) -> Result<bool, LockError> {
        let extended = self.backend.extend(&self.key, &self.token, self.ttl).await?;
        if !extended {
            tracing::warn!(key = %self.key, "lock lost before renewal");
        }
        Ok(extended)
    }

    /// Releases the lock if this guard still holds it.
    ///
    /// Returns `false` when the lock had expired and belongs to someone else
    /// (or nobody); that entry is left untouched.
    pub async fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        let removed = self
            .backend
            .compare_and_delete(&self.key, &self.token)
            .await?;
        if !removed {
            tracing::warn!(key = %self.key, "lock expired before release");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "lock dropped outside a runtime; left to expire");
            return;
        };

        let backend = Arc::clone(&self.backend);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = backend.compare_and_delete(&key, &token).await {
                tracing::warn!(key = %key, error = %e, "deferred lock release failed");
            }
        });
    }
}
