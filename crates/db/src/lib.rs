//! # medigate-db
//!
//! Governed database access for the medigate backend. Every physical
//! connection the service uses is checked out through a single
//! [`PoolGovernor`], which bounds concurrent usage, tracks each
//! checked-out connection, and reclaims connections that handlers
//! forget to release. The [`Database`] execution helpers guarantee
//! acquire/release pairing on every exit path.

pub mod backend;
pub mod connection;
pub mod database;
pub mod error;
pub mod testing;

pub use backend::{DatabaseConnection, DatabasePool, DatabaseValue, ExecResult, SqlxMySqlPool};
pub use connection::{
    GovernorConfig, GovernorStats, PoolGovernor, PoolStatus, PoolStatusSnapshot, PooledConnection,
};
pub use database::{BoxFuture, Database};
pub use error::{DbResult, PoolError};
