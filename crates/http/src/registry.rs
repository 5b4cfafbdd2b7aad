//! Active-request registry
//!
//! One record per in-flight request. Terminal transitions are
//! first-writer-wins: whichever of {timeout, response, transport close}
//! fires first performs the transition, later signals are no-ops.
//! Terminal records stay visible for a grace window so late-arriving
//! diagnostics can still resolve the request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Active,
    Completed,
    TimedOut,
}

/// One in-flight (or recently finished) request
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: String,
    pub method: String,
    pub path: String,
    pub api_class: String,
    pub timeout_ms: u64,
    #[serde(skip)]
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub status: RequestStatus,
    pub duration_ms: Option<u64>,
    pub response_status: Option<u16>,
}

impl RequestRecord {
    pub fn new(
        id: String,
        method: String,
        path: String,
        api_class: String,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            method,
            path,
            api_class,
            timeout_ms: timeout.as_millis() as u64,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            status: RequestStatus::Active,
            duration_ms: None,
            response_status: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Registry of in-flight requests plus monotonic completion counters.
/// The counters survive record eviction.
pub struct RequestRegistry {
    records: DashMap<String, RequestRecord>,
    total: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    grace: Duration,
}

impl RequestRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            records: DashMap::new(),
            total: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            grace,
        }
    }

    /// Admit a new request; bumps the total counter
    pub fn register(&self, record: RequestRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.records.insert(record.id.clone(), record);
    }

    /// Transition to `completed`. Returns false (and mutates nothing)
    /// if the record is missing or already terminal.
    pub fn complete(&self, id: &str, status_code: Option<u16>, payload_error: bool) -> bool {
        let Some(mut record) = self.records.get_mut(id) else {
            return false;
        };
        if record.status != RequestStatus::Active {
            return false;
        }
        record.status = RequestStatus::Completed;
        record.duration_ms = Some(record.started_at.elapsed().as_millis() as u64);
        record.response_status = status_code;
        if payload_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Transition to `timed_out`. Returns false if the record is
    /// missing or already terminal.
    pub fn time_out(&self, id: &str) -> bool {
        let Some(mut record) = self.records.get_mut(id) else {
            return false;
        };
        if record.status != RequestStatus::Active {
            return false;
        }
        record.status = RequestStatus::TimedOut;
        record.duration_ms = Some(record.started_at.elapsed().as_millis() as u64);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Record the real outcome of a handler that finished after its
    /// request already timed out. Only applies to a timed-out record;
    /// counters are untouched (the timeout already counted).
    pub fn record_late_completion(&self, id: &str, status_code: Option<u16>) -> bool {
        let Some(mut record) = self.records.get_mut(id) else {
            return false;
        };
        if record.status != RequestStatus::TimedOut {
            return false;
        }
        record.status = RequestStatus::Completed;
        record.duration_ms = Some(record.started_at.elapsed().as_millis() as u64);
        record.response_status = status_code;
        true
    }

    /// Remove the record after the grace window so late diagnostics
    /// can still find it in the meantime.
    pub fn schedule_eviction(self: &Arc<Self>, id: &str) {
        let registry = Arc::clone(self);
        let id = id.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if registry.records.remove(&id).is_some() {
                debug!(request_id = %id, "request record evicted");
            }
        });
    }

    pub fn get(&self, id: &str) -> Option<RequestRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Snapshot of every record still in the registry
    pub fn records(&self) -> Vec<RequestRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn active_count(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| r.value().status == RequestStatus::Active)
            .count() as u64
    }

    /// Active requests per API class
    pub fn per_class_active(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for record in self.records.iter() {
            if record.value().status == RequestStatus::Active {
                *counts.entry(record.value().api_class.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
