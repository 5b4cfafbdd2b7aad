//! Error types for governed database access
//!
//! Acquisition failures are normalized before they reach business code:
//! callers see one generic "database unavailable" condition while the
//! detailed cause stays in the logs. Query failures propagate verbatim
//! so callers can branch on driver-specific codes.

use std::time::Duration;

/// Result type alias for governed database operations
pub type DbResult<T> = Result<T, PoolError>;

/// Error types for the pool governor and execution helpers
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The underlying pool did not yield a connection within the wait timeout
    #[error("connection wait timed out after {waited:?}")]
    AcquireTimeout { waited: Duration },

    /// Any other connection acquisition failure
    #[error("connection acquisition failed: {0}")]
    Acquire(String),

    /// Too many callers already waiting on the pool queue
    #[error("connection queue limit of {queue_limit} reached")]
    QueueFull { queue_limit: u32 },

    /// The stale reaper reclaimed this connection before the operation ran
    #[error("connection {id} was reclaimed as stale")]
    Reclaimed { id: String },

    /// Driver or SQL failure, propagated with the original driver message
    #[error("query failed in {context}: {message}")]
    Query { context: String, message: String },

    /// Secondary failure while rolling back; never masks the primary cause
    #[error("rollback failed: {0}")]
    Rollback(String),

    /// Normalized, user-safe form of an acquisition failure
    #[error("database temporarily unavailable, please try again")]
    Unavailable,
}

impl PoolError {
    /// Whether this error means "could not get a connection at all"
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            PoolError::AcquireTimeout { .. }
                | PoolError::Acquire(_)
                | PoolError::QueueFull { .. }
                | PoolError::Unavailable
        )
    }

    /// User-safe message; acquisition detail is logged, never exposed
    pub fn user_message(&self) -> String {
        if self.is_unavailable() {
            PoolError::Unavailable.to_string()
        } else {
            self.to_string()
        }
    }
}
