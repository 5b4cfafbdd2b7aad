//! Core database backend traits
//!
//! Abstracts the underlying physical pool and its connections so the
//! governor can be exercised against any backend. Rows come back as
//! JSON values; parameters are bound through [`DatabaseValue`].

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::DbResult;

/// Abstract database connection. Exclusively owned by whoever checked
/// it out; dropping it returns the physical connection to its pool.
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Execute a statement and return its result metadata
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DbResult<ExecResult>;

    /// Execute a query and return the result rows
    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue])
        -> DbResult<Vec<JsonValue>>;

    /// Begin a transaction on this connection
    async fn begin(&mut self) -> DbResult<()>;

    /// Commit the open transaction
    async fn commit(&mut self) -> DbResult<()>;

    /// Roll back the open transaction
    async fn rollback(&mut self) -> DbResult<()>;

    /// Liveness check
    async fn ping(&mut self) -> DbResult<()>;
}

/// Abstract bounded connection pool (the underlying pool the governor
/// wraps). `acquire` may wait on the pool's internal queue; the
/// governor layers its own hard wait timeout on top.
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Acquire a connection, waiting if the pool is exhausted
    async fn acquire(&self) -> DbResult<Box<dyn DatabaseConnection>>;
}

/// Result metadata for insert/update statements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Json(JsonValue),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int(value as i64)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::Text(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::Text(value.to_string())
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl From<JsonValue> for DatabaseValue {
    fn from(value: JsonValue) -> Self {
        DatabaseValue::Json(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_value_conversions() {
        assert_eq!(DatabaseValue::from(42i32), DatabaseValue::Int(42));
        assert_eq!(
            DatabaseValue::from("abc"),
            DatabaseValue::Text("abc".to_string())
        );
        assert_eq!(DatabaseValue::from(Option::<i64>::None), DatabaseValue::Null);
        assert!(DatabaseValue::Null.is_null());
        assert!(!DatabaseValue::Bool(false).is_null());
    }
}
