//! # medigate-http
//!
//! Request-level resource governance for the medigate backend. Every
//! inbound request passes through the [`RequestGuard`] middleware,
//! which classifies it by path, bounds its client-observable lifetime
//! with a per-class timeout budget, and stamps uniform completion
//! telemetry without the handler's cooperation. The [`StatsCollector`]
//! combines the active-request registry with the connection governor's
//! pool snapshot for operational visibility.

pub mod classify;
pub mod error;
pub mod guard;
pub mod middleware;
pub mod registry;
pub mod stats;

pub use classify::{ApiClassifier, ClassRule, Classification};
pub use error::GuardError;
pub use guard::{RequestGuard, RequestId};
pub use middleware::{Middleware, MiddlewarePipeline, Next, NextFuture};
pub use registry::{RequestRecord, RequestRegistry, RequestStatus};
pub use stats::{ActiveRequestDetail, OpsSnapshot, RequestStatsSnapshot, StatsCollector};
