//! Lock storage backends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use parlance_db::DbPool;
use rusqlite::params;

use crate::LockError;

/// Atomic key/token storage with expiry.
#[async_trait::async_trait]
pub trait LockBackend: Send + Sync {
    /// Stores `token` under `key` unless a live entry exists. Returns whether
    /// the entry was written.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// Deletes `key` only if it currently holds `token`. Returns whether an
    /// entry was removed.
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Pushes the expiry of `key` to `ttl` from now if it is live and holds
    /// `token`. Returns whether the entry was extended.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;
}

/// Lock table shared by every process using the same database file.
#[derive(Clone)]
pub struct SqliteLockBackend {
    pool: DbPool,
}

impl SqliteLockBackend {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, LockError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| LockError::Backend(e.to_string()))?;
            op(&*conn).map_err(|e| LockError::Backend(e.to_string()))
        })
        .await
        .map_err(|e| LockError::Backend(format!("lock task failed: {e}")))?
    }
}

#[async_trait::async_trait]
impl LockBackend for SqliteLockBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let key = key.to_string();
        let token = token.to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        self.run(move |conn| {
            let now_ms = chrono::Utc::now().timestamp_millis();
            // An expired row is overwritten in place; a live one leaves
            // `changes()` at zero.
            let changed = conn.execute(
                "INSERT INTO session_locks (lock_key, token, expires_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(lock_key) DO UPDATE SET
                    token = excluded.token,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE session_locks.expires_at_ms <= ?4",
                params![key, token, now_ms.saturating_add(ttl_ms), now_ms],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let key = key.to_string();
        let token = token.to_string();

        self.run(move |conn| {
            let changed = conn.execute(
                "DELETE FROM session_locks WHERE lock_key = ?1 AND token = ?2",
                params![key, token],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let key = key.to_string();
        let token = token.to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        self.run(move |conn| {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let changed = conn.execute(
                "UPDATE session_locks SET expires_at_ms = ?3
                 WHERE lock_key = ?1 AND token = ?2 AND expires_at_ms > ?4",
                params![key, token, now_ms.saturating_add(ttl_ms), now_ms],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

/// Process-local backend for single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryLockBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl LockBackend for MemoryLockBackend {
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries();
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some((held, _)) if held == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get_mut(key) {
            Some((held, expires_at)) if held == token && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::{LockError, SessionLock};

    fn sqlite_backend(dir: &tempfile::TempDir) -> SqliteLockBackend {
        let path = dir.path().join("locks.db");
        let pool = parlance_db::create_pool(
            path.to_str().expect("utf-8 path"),
            parlance_db::DbRuntimeSettings::default(),
        )
        .expect("pool");
        let conn = pool.get().expect("conn");
        parlance_db::run_migrations(&conn).expect("migrations");
        drop(conn);
        SqliteLockBackend::new(pool)
    }

    #[tokio::test]
    async fn sqlite_backend_is_exclusive_until_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = sqlite_backend(&dir);
        let ttl = Duration::from_secs(60);

        assert!(backend.set_if_absent("k", "t1", ttl).await.expect("set"));
        assert!(!backend.set_if_absent("k", "t2", ttl).await.expect("set"));

        assert!(!backend.compare_and_delete("k", "t2").await.expect("cad"));
        assert!(backend.compare_and_delete("k", "t1").await.expect("cad"));
        assert!(backend.set_if_absent("k", "t2", ttl).await.expect("set"));
    }

    #[tokio::test]
    async fn sqlite_backend_takes_over_expired_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = sqlite_backend(&dir);

        assert!(backend
            .set_if_absent("k", "old", Duration::from_millis(20))
            .await
            .expect("set"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend
            .set_if_absent("k", "new", Duration::from_secs(60))
            .await
            .expect("takeover"));

        assert!(!backend.compare_and_delete("k", "old").await.expect("cad"));
        assert!(backend.compare_and_delete("k", "new").await.expect("cad"));
    }

    #[tokio::test]
    async fn sqlite_backend_extends_only_the_live_holder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = sqlite_backend(&dir);

        assert!(backend
            .set_if_absent("k", "t1", Duration::from_millis(40))
            .await
            .expect("set"));
        assert!(!backend
            .extend("k", "t2", Duration::from_secs(60))
            .await
            .expect("extend foreign"));
        assert!(backend
            .extend("k", "t1", Duration::from_secs(60))
            .await
            .expect("extend"));

        // The extended row outlives its original TTL.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!backend
            .set_if_absent("k", "t2", Duration::from_secs(60))
            .await
            .expect("set"));

        assert!(backend.compare_and_delete("k", "t1").await.expect("cad"));
        assert!(!backend
            .extend("k", "t1", Duration::from_secs(60))
            .await
            .expect("extend released"));
    }

    #[tokio::test]
    async fn sqlite_lock_admits_one_of_many_racers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = SessionLock::new(Arc::new(sqlite_backend(&dir)), Duration::from_secs(60));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move { lock.acquire("s1").await }));
        }

        let mut guards = Vec::new();
        let mut busy = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(guard) => guards.push(guard),
                Err(LockError::Busy(_)) => busy += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(guards.len(), 1);
        assert_eq!(busy, 7);

        for guard in guards {
            assert!(guard.release().await.expect("release"));
        }
    }
}
