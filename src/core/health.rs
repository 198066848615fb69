//! Backend health state.
//!
//! A `BackendHealth` entry is produced by one probe and overwritten by the
//! next. Entries age out after the detection cache TTL; a stale entry must
//! never be trusted without a fresh probe.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Capability flags a backend advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendFeatures {
    /// Results can be ranked by semantic similarity.
    pub similarity_search: bool,
    /// Bulk add/delete paths are better than looping single calls.
    pub bulk_operations: bool,
    /// Writes are transactional.
    pub transactions: bool,
}

/// Result of one health probe for one backend.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    /// Backend name.
    pub backend: String,
    /// Whether the probe succeeded.
    pub healthy: bool,
    /// Probe latency in milliseconds. Infinite for probes that timed out
    /// or failed without a measurable response.
    pub response_time_ms: f64,
    /// Error message for unhealthy probes.
    pub error: Option<String>,
    /// Capabilities reported at probe time.
    pub features: BackendFeatures,
    /// When the probe finished.
    pub checked_at: Instant,
    /// Consecutive successful probes, including this one.
    pub consecutive_successes: u32,
    /// Consecutive failed probes, including this one.
    pub consecutive_failures: u32,
}

impl BackendHealth {
    /// Record a healthy probe.
    pub fn healthy(
        backend: impl Into<String>,
        response_time_ms: f64,
        features: BackendFeatures,
    ) -> Self {
        Self {
            backend: backend.into(),
            healthy: true,
            response_time_ms,
            error: None,
            features,
            checked_at: Instant::now(),
            consecutive_successes: 1,
            consecutive_failures: 0,
        }
    }

    /// Record a failed probe.
    pub fn unhealthy(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            healthy: false,
            response_time_ms: f64::INFINITY,
            error: Some(message.into()),
            features: BackendFeatures::default(),
            checked_at: Instant::now(),
            consecutive_successes: 0,
            consecutive_failures: 1,
        }
    }

    /// Check whether this entry is still within its freshness window.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.checked_at.elapsed() < ttl
    }

    /// Carry success/failure streaks over from the entry this one replaces.
    pub fn inherit_streaks(&mut self, previous: &BackendHealth) {
        if self.healthy {
            self.consecutive_successes = previous.consecutive_successes + 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = previous.consecutive_failures + 1;
            self.consecutive_successes = 0;
        }
    }

    /// Summarize for reporting.
    pub fn summary(&self) -> BackendHealthSummary {
        BackendHealthSummary {
            healthy: self.healthy,
            response_time_ms: if self.response_time_ms.is_finite() {
                Some(self.response_time_ms)
            } else {
                None
            },
            error: self.error.clone(),
            age_secs: self.checked_at.elapsed().as_secs_f64(),
            features: self.features,
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Serializable view of one cached health entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealthSummary {
    pub healthy: bool,
    /// Probe latency; absent when the probe never produced a response.
    pub response_time_ms: Option<f64>,
    pub error: Option<String>,
    /// Seconds since the entry was probed.
    pub age_secs: f64,
    pub features: BackendFeatures,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

/// Snapshot of the whole health cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub unhealthy_backends: usize,
    pub backends: BTreeMap<String, BackendHealthSummary>,
}

impl HealthReport {
    /// Build a report from cached entries.
    pub fn from_entries<'a>(entries: impl Iterator<Item = &'a BackendHealth>) -> Self {
        let mut report = HealthReport::default();
        for entry in entries {
            report.total_backends += 1;
            if entry.healthy {
                report.healthy_backends += 1;
            } else {
                report.unhealthy_backends += 1;
            }
            report
                .backends
                .insert(entry.backend.clone(), entry.summary());
        }
        report
    }
}
