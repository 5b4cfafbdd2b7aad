//! Connection governance
//!
//! The pool governor, its connection tracker, the stale reaper, and
//! pool statistics.

pub mod governor;
pub mod statistics;

pub use governor::*;
pub use statistics::*;
