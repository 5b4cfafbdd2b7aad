//! Pool statistics and status snapshots

use serde::Serialize;
use std::time::Duration;

/// Coarse pool health indicator for operational tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "WARNING")]
    Warning,
}

/// Usage snapshot consumed by operational tooling and the status monitor
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatusSnapshot {
    pub active_connections: u32,
    pub connection_limit: u32,
    pub usage_percentage: f64,
    pub pool_status: PoolStatus,
}

/// Extended governor statistics
#[derive(Debug, Clone)]
pub struct GovernorStats {
    /// Monotonic count of successful acquisitions
    pub acquired_total: u64,
    /// Connections released through the normal path
    pub released_total: u64,
    /// Connections force-released by the stale reaper
    pub reaped_total: u64,
    /// Failed acquisition attempts (timeout, queue full, pool errors)
    pub acquire_errors: u64,
    /// Currently checked-out connections
    pub active_connections: u32,
    pub connection_limit: u32,
    pub uptime: Duration,
}

impl GovernorStats {
    /// Pool utilization as a percentage (active / limit)
    pub fn utilization(&self) -> f64 {
        if self.connection_limit > 0 {
            (self.active_connections as f64 / self.connection_limit as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Acquisition error rate as a percentage
    pub fn error_rate(&self) -> f64 {
        let attempts = self.acquired_total + self.acquire_errors;
        if attempts > 0 {
            (self.acquire_errors as f64 / attempts as f64) * 100.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(active: u32, limit: u32, acquired: u64, errors: u64) -> GovernorStats {
        GovernorStats {
            acquired_total: acquired,
            released_total: 0,
            reaped_total: 0,
            acquire_errors: errors,
            active_connections: active,
            connection_limit: limit,
            uptime: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_utilization() {
        assert_eq!(stats(8, 10, 8, 0).utilization(), 80.0);
        assert_eq!(stats(0, 0, 0, 0).utilization(), 0.0);
    }

    #[test]
    fn test_error_rate() {
        assert_eq!(stats(0, 10, 9, 1).error_rate(), 10.0);
        assert_eq!(stats(0, 10, 0, 0).error_rate(), 0.0);
    }

    #[test]
    fn test_status_snapshot_serializes_with_upper_case_status() {
        let snapshot = PoolStatusSnapshot {
            active_connections: 9,
            connection_limit: 10,
            usage_percentage: 90.0,
            pool_status: PoolStatus::Warning,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["pool_status"], "WARNING");
        assert_eq!(json["active_connections"], 9);
    }
}
