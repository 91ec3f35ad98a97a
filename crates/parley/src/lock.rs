// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection-scoped advisory locks keyed by session/meeting identifiers.
//!
//! PostgreSQL advisory locks belong to the connection that acquired them, so
//! acquire and release MUST run on the same pinned connection. [`LockGuard`]
//! owns that connection for the whole critical section; every exit path —
//! explicit release, caller error, task cancellation — unlocks before the
//! connection can return to the pool.

use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Keys stay within PostgreSQL's positive bigint range.
const LOCK_KEY_SPACE: u64 = (1 << 63) - 1;

/// Derive a stable 63-bit lock key from an identifier.
///
/// Uses the first 8 bytes of the UUID. A coincidental collision between two
/// identifiers only serializes two unrelated operations briefly; it is not a
/// correctness issue.
pub fn lock_key(id: Uuid) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&id.as_bytes()[..8]);
    #[allow(clippy::cast_possible_wrap)]
    let key = (u64::from_be_bytes(raw) % LOCK_KEY_SPACE) as i64;
    key
}

/// Attempt the non-blocking advisory lock on this connection.
pub async fn try_acquire(conn: &mut PgConnection, key: i64) -> Result<bool> {
    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(key)
        .fetch_one(conn)
        .await?;
    Ok(locked)
}

/// Release an advisory lock previously acquired on this connection.
///
/// Returns false if the lock was not held here (already released, or never
/// acquired on this connection).
pub async fn release(conn: &mut PgConnection, key: i64) -> Result<bool> {
    let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .fetch_one(conn)
        .await?;
    Ok(released)
}

/// Run a cleanup future outside the current (possibly cancelled) task.
pub(crate) fn spawn_cleanup<F>(fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(fut);
    }
}

/// Holds an advisory lock on a pinned pool connection.
pub struct LockGuard {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl LockGuard {
    /// Pin a connection and try to take the lock for `id`.
    ///
    /// Fails with [`Error::LockUnavailable`] when another connection holds it.
    pub async fn acquire(pool: &PgPool, id: Uuid) -> Result<Self> {
        let key = lock_key(id);
        let mut conn = pool.acquire().await?;
        if !try_acquire(conn.as_mut(), key).await? {
            return Err(Error::LockUnavailable(format!(
                "advisory lock {key} for {id} is held elsewhere"
            )));
        }
        Ok(Self { conn: Some(conn), key })
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Release the lock and return the connection to the pool.
    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            let released = release(conn.as_mut(), self.key).await?;
            if !released {
                warn!(key = self.key, "advisory lock was not held at release");
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Fail-safe path: the holding future was cancelled or errored before
        // the explicit release. Unlock on the same pinned connection from a
        // detached task.
        if let Some(mut conn) = self.conn.take() {
            let key = self.key;
            debug!(key, "releasing advisory lock from drop");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = release(conn.as_mut(), key).await {
                            warn!(key, error = %err, "failed to release advisory lock in cleanup");
                        }
                    });
                }
                // No runtime to run the unlock on. Detach and close the
                // pinned connection so the server drops its locks; returning
                // it to the pool would leak the lock to the next borrower.
                Err(_) => drop(conn.detach()),
            }
        }
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
