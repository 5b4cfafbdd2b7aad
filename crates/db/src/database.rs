//! Execution helpers
//!
//! Every database operation goes through these helpers: each acquires
//! exactly one governed connection, tags it with the logical operation
//! for diagnostics, and releases it on every exit path. Acquisition
//! failures are normalized to a user-safe error before they reach
//! business code; query failures propagate verbatim after logging.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{error, warn};

use crate::backend::{DatabaseValue, ExecResult};
use crate::connection::{PoolGovernor, PooledConnection};
use crate::error::{DbResult, PoolError};

/// Type alias for boxed futures used at closure seams
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// High-level database access through the pool governor
pub struct Database {
    governor: Arc<PoolGovernor>,
}

impl Database {
    pub fn new(governor: Arc<PoolGovernor>) -> Self {
        Self { governor }
    }

    pub fn governor(&self) -> &Arc<PoolGovernor> {
        &self.governor
    }

    /// Acquire with user-safe normalization: callers only ever see one
    /// generic "unavailable" condition, the detail stays in the logs.
    async fn checkout(&self, context: &str) -> DbResult<PooledConnection> {
        match self.governor.acquire(context).await {
            Ok(conn) => Ok(conn),
            Err(e) if e.is_unavailable() => {
                error!(context, error = %e, "could not obtain a database connection");
                Err(PoolError::Unavailable)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a read query and return its rows
    pub async fn query(
        &self,
        sql: &str,
        params: &[DatabaseValue],
        context: &str,
    ) -> DbResult<Vec<JsonValue>> {
        let conn = self.checkout(&format!("executeQuery({})", context)).await?;
        let result = conn.fetch_all(sql, params).await;
        if let Err(e) = &result {
            error!(
                sql,
                param_count = params.len(),
                context,
                error = %e,
                "query failed"
            );
        }
        conn.release();
        result
    }

    /// Run an insert statement and return its result metadata
    pub async fn insert(
        &self,
        sql: &str,
        params: &[DatabaseValue],
        context: &str,
    ) -> DbResult<ExecResult> {
        self.run_statement(sql, params, &format!("executeInsert({})", context))
            .await
    }

    /// Run an update statement and return its result metadata
    pub async fn update(
        &self,
        sql: &str,
        params: &[DatabaseValue],
        context: &str,
    ) -> DbResult<ExecResult> {
        self.run_statement(sql, params, &format!("executeUpdate({})", context))
            .await
    }

    async fn run_statement(
        &self,
        sql: &str,
        params: &[DatabaseValue],
        context: &str,
    ) -> DbResult<ExecResult> {
        let conn = self.checkout(context).await?;
        let result = conn.execute(sql, params).await;
        if let Err(e) = &result {
            error!(
                sql,
                param_count = params.len(),
                context,
                error = %e,
                "statement failed"
            );
        }
        conn.release();
        result
    }

    /// Run `op` inside a transaction on a single governed connection.
    /// Commits on success; on any failure inside `op` or during commit,
    /// attempts a rollback whose own failure is logged but never masks
    /// the original error. The connection is released on every path.
    pub async fn transaction<T, F>(&self, context: &str, op: F) -> DbResult<T>
    where
        F: FnOnce(Arc<PooledConnection>) -> BoxFuture<'static, DbResult<T>>,
    {
        let conn = Arc::new(
            self.checkout(&format!("executeTransaction({})", context))
                .await?,
        );

        if let Err(e) = conn.begin().await {
            error!(context, error = %e, "failed to begin transaction");
            conn.release();
            return Err(e);
        }

        let result = op(Arc::clone(&conn)).await;

        let outcome = match result {
            Ok(value) => match conn.commit().await {
                Ok(()) => Ok(value),
                Err(commit_err) => {
                    error!(context, error = %commit_err, "commit failed, rolling back");
                    if let Err(rb) = conn.rollback().await {
                        warn!(context, error = %rb, "rollback after failed commit also failed");
                    }
                    Err(commit_err)
                }
            },
            Err(e) => {
                error!(context, error = %e, "transaction operation failed, rolling back");
                if let Err(rb) = conn.rollback().await {
                    warn!(context, error = %rb, "rollback failed");
                }
                Err(e)
            }
        };

        conn.release();
        outcome
    }
}
