//! Test doubles for the backend traits
//!
//! An in-memory pool with a real capacity semaphore, so governor tests
//! exercise genuine exhaustion and wait behavior without a database.
//! Statements issued inside a transaction stay staged until commit.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::{DatabaseConnection, DatabasePool, DatabaseValue, ExecResult};
use crate::error::{DbResult, PoolError};

/// Committed-statement log shared by every connection of a [`FakePool`]
#[derive(Default)]
pub struct FakeStore {
    committed: StdMutex<Vec<String>>,
}

impl FakeStore {
    /// Statements that have been committed (auto-commit or via COMMIT)
    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn push(&self, sql: &str) {
        if let Ok(mut committed) = self.committed.lock() {
            committed.push(sql.to_string());
        }
    }

    fn push_all(&self, statements: Vec<String>) {
        if let Ok(mut committed) = self.committed.lock() {
            committed.extend(statements);
        }
    }
}

/// Bounded in-memory pool; `acquire` waits on a semaphore exactly like
/// a real pool queue, so wait-timeout paths are exercised for real.
pub struct FakePool {
    permits: Arc<Semaphore>,
    store: Arc<FakeStore>,
    canned_rows: Vec<JsonValue>,
    fail_on: Option<String>,
    stall_on: Option<String>,
    fail_commit: bool,
    fail_rollback: bool,
}

impl FakePool {
    pub fn new(limit: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit as usize)),
            store: Arc::new(FakeStore::default()),
            canned_rows: Vec::new(),
            fail_on: None,
            stall_on: None,
            fail_commit: false,
            fail_rollback: false,
        }
    }

    /// Rows every `fetch_all` returns
    pub fn with_rows(mut self, rows: Vec<JsonValue>) -> Self {
        self.canned_rows = rows;
        self
    }

    /// Fail any statement whose SQL contains `needle`
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    /// Stall any statement whose SQL contains `needle` for an hour of
    /// virtual time, holding the connection busy
    pub fn stalling_on(mut self, needle: &str) -> Self {
        self.stall_on = Some(needle.to_string());
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    pub fn store(&self) -> Arc<FakeStore> {
        self.store.clone()
    }

    /// Free capacity in the underlying pool
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl DatabasePool for FakePool {
    async fn acquire(&self) -> DbResult<Box<dyn DatabaseConnection>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PoolError::Acquire(e.to_string()))?;
        Ok(Box::new(FakeConnection {
            _permit: permit,
            store: self.store.clone(),
            rows: self.canned_rows.clone(),
            staged: Vec::new(),
            in_tx: false,
            fail_on: self.fail_on.clone(),
            stall_on: self.stall_on.clone(),
            fail_commit: self.fail_commit,
            fail_rollback: self.fail_rollback,
        }))
    }
}

/// One checked-out fake connection; dropping it frees pool capacity
pub struct FakeConnection {
    _permit: OwnedSemaphorePermit,
    store: Arc<FakeStore>,
    rows: Vec<JsonValue>,
    staged: Vec<String>,
    in_tx: bool,
    fail_on: Option<String>,
    stall_on: Option<String>,
    fail_commit: bool,
    fail_rollback: bool,
}

impl FakeConnection {
    fn check_failure(&self, sql: &str, context: &str) -> DbResult<()> {
        if let Some(needle) = &self.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(PoolError::Query {
                    context: context.to_string(),
                    message: format!("forced failure on '{}'", needle),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnection for FakeConnection {
    async fn execute(&mut self, sql: &str, _params: &[DatabaseValue]) -> DbResult<ExecResult> {
        if let Some(needle) = &self.stall_on {
            if sql.contains(needle.as_str()) {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
        }
        self.check_failure(sql, "execute")?;
        if self.in_tx {
            self.staged.push(sql.to_string());
        } else {
            self.store.push(sql);
        }
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: Some(1),
        })
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        _params: &[DatabaseValue],
    ) -> DbResult<Vec<JsonValue>> {
        self.check_failure(sql, "fetch_all")?;
        Ok(self.rows.clone())
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        if self.fail_commit {
            return Err(PoolError::Query {
                context: "commit".to_string(),
                message: "forced commit failure".to_string(),
            });
        }
        let staged = std::mem::take(&mut self.staged);
        self.store.push_all(staged);
        self.in_tx = false;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if self.fail_rollback {
            return Err(PoolError::Rollback("forced rollback failure".to_string()));
        }
        self.staged.clear();
        self.in_tx = false;
        Ok(())
    }

    async fn ping(&mut self) -> DbResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_pool_capacity_is_released_on_drop() {
        let pool = FakePool::new(1);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(conn);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_staged_statements_only_commit_on_commit() {
        let pool = FakePool::new(1);
        let store = pool.store();
        let mut conn = pool.acquire().await.unwrap();

        conn.begin().await.unwrap();
        conn.execute("INSERT INTO a", &[]).await.unwrap();
        assert!(store.committed().is_empty());

        conn.commit().await.unwrap();
        assert_eq!(store.committed(), vec!["INSERT INTO a".to_string()]);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_statements() {
        let pool = FakePool::new(1);
        let store = pool.store();
        let mut conn = pool.acquire().await.unwrap();

        conn.begin().await.unwrap();
        conn.execute("INSERT INTO a", &[]).await.unwrap();
        conn.rollback().await.unwrap();

        assert!(store.committed().is_empty());
    }
}
