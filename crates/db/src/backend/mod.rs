//! Database Backend Abstraction
//!
//! The governor never talks to a driver directly; it works against the
//! traits defined here. Production uses the sqlx MySQL adapter, tests
//! use the in-crate fakes from [`crate::testing`].

pub mod core;
pub mod mysql;

pub use self::core::*;
pub use mysql::SqlxMySqlPool;
