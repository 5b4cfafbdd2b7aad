//! MySQL backend implementation
//!
//! sqlx-based adapter for the backend traits. The business store is
//! MySQL; transactions are driven with explicit statements so the
//! governor can hand a plain connection to transactional closures.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlArguments, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Column, MySql, Row as SqlxRow, TypeInfo};

use super::core::{DatabaseConnection, DatabasePool, DatabaseValue, ExecResult};
use crate::error::{DbResult, PoolError};

/// Connection settings for the underlying sqlx pool
#[derive(Debug, Clone)]
pub struct MySqlPoolConfig {
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: Option<u64>,
}

impl Default for MySqlPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_seconds: 30,
            idle_timeout_seconds: Some(600),
        }
    }
}

/// sqlx-backed MySQL connection pool
pub struct SqlxMySqlPool {
    pool: sqlx::MySqlPool,
}

impl SqlxMySqlPool {
    /// Connect to the database and build the underlying pool
    pub async fn connect(database_url: &str, config: MySqlPoolConfig) -> DbResult<Self> {
        let mut options = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_seconds));

        if let Some(idle_timeout) = config.idle_timeout_seconds {
            options = options.idle_timeout(std::time::Duration::from_secs(idle_timeout));
        }

        let pool = options
            .connect(database_url)
            .await
            .map_err(|e| PoolError::Acquire(format!("failed to create MySQL pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Wrap an already-configured sqlx pool
    pub fn from_pool(pool: sqlx::MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabasePool for SqlxMySqlPool {
    async fn acquire(&self) -> DbResult<Box<dyn DatabaseConnection>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| PoolError::Acquire(e.to_string()))?;
        Ok(Box::new(MySqlConnection { conn }))
    }
}

/// One checked-out sqlx MySQL connection
pub struct MySqlConnection {
    conn: PoolConnection<MySql>,
}

impl MySqlConnection {
    async fn run_statement(&mut self, sql: &str, context: &str) -> DbResult<()> {
        sqlx::query(sql)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| PoolError::Query {
                context: context.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseConnection for MySqlConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> DbResult<ExecResult> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let result = query
            .execute(&mut *self.conn)
            .await
            .map_err(|e| PoolError::Query {
                context: "execute".to_string(),
                message: e.to_string(),
            })?;

        let last_insert_id = match result.last_insert_id() {
            0 => None,
            id => Some(id),
        };

        Ok(ExecResult {
            rows_affected: result.rows_affected(),
            last_insert_id,
        })
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> DbResult<Vec<JsonValue>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }

        let rows = query
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| PoolError::Query {
                context: "fetch_all".to_string(),
                message: e.to_string(),
            })?;

        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.run_statement("START TRANSACTION", "begin").await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.run_statement("COMMIT", "commit").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.run_statement("ROLLBACK", "rollback").await
    }

    async fn ping(&mut self) -> DbResult<()> {
        self.run_statement("SELECT 1", "ping").await
    }
}

/// Bind a [`DatabaseValue`] onto a query
fn bind_database_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q DatabaseValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int(i) => query.bind(*i),
        DatabaseValue::Float(f) => query.bind(*f),
        DatabaseValue::Text(s) => query.bind(s.as_str()),
        DatabaseValue::Uuid(u) => query.bind(u.to_string()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Json(j) => query.bind(j.clone()),
    }
}

/// Decode a MySQL row into a JSON object keyed by column name.
/// Falls back to a string rendering for types without a direct mapping.
fn row_to_json(row: &MySqlRow) -> JsonValue {
    let mut map = serde_json::Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        map.insert(column.name().to_string(), column_to_json(row, idx, column));
    }
    JsonValue::Object(map)
}

fn column_to_json(row: &MySqlRow, idx: usize, column: &sqlx::mysql::MySqlColumn) -> JsonValue {
    let type_name = column.type_info().name();

    if type_name.contains("INT") {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
        }
    }

    match type_name {
        "BOOLEAN" => {
            if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
                return v.map(JsonValue::Bool).unwrap_or(JsonValue::Null);
            }
        }
        "FLOAT" | "DOUBLE" => {
            if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
            }
        }
        "DATETIME" | "TIMESTAMP" => {
            if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
                return v
                    .map(|dt| JsonValue::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                    .unwrap_or(JsonValue::Null);
            }
        }
        "DATE" => {
            if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
                return v
                    .map(|d| JsonValue::String(d.to_string()))
                    .unwrap_or(JsonValue::Null);
            }
        }
        "JSON" => {
            if let Ok(v) = row.try_get::<Option<JsonValue>, _>(idx) {
                return v.unwrap_or(JsonValue::Null);
            }
        }
        _ => {}
    }

    match row.try_get::<Option<String>, _>(idx) {
        Ok(v) => v.map(JsonValue::String).unwrap_or(JsonValue::Null),
        Err(_) => JsonValue::Null,
    }
}
