//! Operational statistics
//!
//! Combines the request registry's counters with the connection
//! governor's pool snapshot into one serializable view for an ops
//! endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use medigate_db::{PoolGovernor, PoolStatusSnapshot};

use crate::registry::{RequestRegistry, RequestStatus};

/// A single in-flight request as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRequestDetail {
    pub id: String,
    pub method: String,
    pub path: String,
    pub api_class: String,
    pub elapsed_ms: u64,
    pub timeout_ms: u64,
}

/// Aggregate request counters
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatsSnapshot {
    pub total_requests: u64,
    pub active_requests: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub success_rate_percent: f64,
    pub per_class_active: HashMap<String, u64>,
    pub active_details: Vec<ActiveRequestDetail>,
}

/// Combined request and pool view
#[derive(Debug, Clone, Serialize)]
pub struct OpsSnapshot {
    pub requests: RequestStatsSnapshot,
    pub pool: PoolStatusSnapshot,
}

/// Builds snapshots from the registry and the connection governor
pub struct StatsCollector {
    registry: Arc<RequestRegistry>,
    governor: Arc<PoolGovernor>,
}

impl StatsCollector {
    pub fn new(registry: Arc<RequestRegistry>, governor: Arc<PoolGovernor>) -> Self {
        Self { registry, governor }
    }

    /// Request-side counters and active-request details
    pub fn request_stats(&self) -> RequestStatsSnapshot {
        let total = self.registry.total();
        let errors = self.registry.errors();
        let timeouts = self.registry.timeouts();
        let failed = errors + timeouts;
        let success_rate_percent = if total == 0 {
            100.0
        } else {
            (total.saturating_sub(failed) as f64 / total as f64) * 100.0
        };

        let active_details: Vec<ActiveRequestDetail> = self
            .registry
            .records()
            .into_iter()
            .filter(|r| r.status == RequestStatus::Active)
            .map(|r| ActiveRequestDetail {
                elapsed_ms: r.elapsed().as_millis() as u64,
                id: r.id,
                method: r.method,
                path: r.path,
                api_class: r.api_class,
                timeout_ms: r.timeout_ms,
            })
            .collect();

        RequestStatsSnapshot {
            total_requests: total,
            active_requests: active_details.len() as u64,
            error_count: errors,
            timeout_count: timeouts,
            success_rate_percent,
            per_class_active: self.registry.per_class_active(),
            active_details,
        }
    }

    /// Requests plus the governor's pool snapshot
    pub fn ops_snapshot(&self) -> OpsSnapshot {
        OpsSnapshot {
            requests: self.request_stats(),
            pool: self.governor.status(),
        }
    }
}
