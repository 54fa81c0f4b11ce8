//! Named job locks
//!
//! A job runs only while its lock is held, so two processes never run the
//! same job at once.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::CoreResult;

#[async_trait]
pub trait JobLock: Send + Sync {
    /// `false` when another holder owns the lock.
    async fn try_acquire(&self, name: &str) -> CoreResult<bool>;

    async fn release(&self, name: &str) -> CoreResult<()>;
}

/// Session-level Postgres advisory locks. The connection that took the lock
/// is parked until release, since the lock lives and dies with it.
pub struct PgJobLock {
    pool: PgPool,
    held: tokio::sync::Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl PgJobLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl JobLock for PgJobLock {
    async fn try_acquire(&self, name: &str) -> CoreResult<bool> {
        let mut held = self.held.lock().await;
        if held.contains_key(name) {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            held.insert(name.to_string(), conn);
        }
        Ok(acquired)
    }

    async fn release(&self, name: &str) -> CoreResult<()> {
        let Some(mut conn) = self.held.lock().await.remove(name) else {
            return Ok(());
        };
        let unlocked = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(name)
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlocked {
            // the session lock goes with the connection; keep it out of the pool
            tracing::warn!(job = name, error = %e, "Advisory unlock failed, closing session");
            if let Err(close_err) = conn.detach().close().await {
                tracing::warn!(job = name, error = %close_err, "Closing lock session failed");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

/// In-process lock for single-instance runs and tests.
#[derive(Default)]
pub struct LocalJobLock {
    held: Mutex<HashSet<String>>,
}

impl LocalJobLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLock for LocalJobLock {
    async fn try_acquire(&self, name: &str) -> CoreResult<bool> {
        Ok(self
            .held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string()))
    }

    async fn release(&self, name: &str) -> CoreResult<()> {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
        Ok(())
    }
}
