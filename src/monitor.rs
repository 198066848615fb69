//! Performance monitoring for backend operations.
//!
//! Each `(backend, operation)` pair accumulates call counts and latency
//! aggregates. Timing is scoped: `start` hands out a guard that records
//! itself when dropped, so the measurement lands on every exit path,
//! including early returns and errors.
//!
//! The monitor never fails the operation it is measuring. Lock poisoning
//! is recovered silently and a disabled monitor records nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Monitoring configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Whether measurements are recorded at all.
    pub enabled: bool,
    /// Seconds an idle metrics entry keeps contributing to summaries.
    pub retention_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_secs: 86_400,
        }
    }
}

/// Latency and outcome aggregates for one `(backend, operation)` pair.
///
/// Created lazily on first call, updated on every call, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
}

impl OperationMetrics {
    fn new() -> Self {
        Self {
            calls: 0,
            successes: 0,
            failures: 0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
            avg_ms: 0.0,
        }
    }

    fn record(&mut self, elapsed_ms: f64, success: bool) {
        self.calls += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.min_ms = self.min_ms.min(elapsed_ms);
        self.max_ms = self.max_ms.max(elapsed_ms);
        // Running average, no sample buffer needed.
        self.avg_ms += (elapsed_ms - self.avg_ms) / self.calls as f64;
    }

    /// Success rate in [0, 1].
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.successes as f64 / self.calls as f64
    }
}

#[derive(Debug)]
struct Entry {
    metrics: OperationMetrics,
    last_recorded: Instant,
}

/// Derived overview across all backends.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSummary {
    /// Backend with the lowest average latency.
    pub fastest_backend: Option<String>,
    /// Backend with the highest success rate.
    pub most_reliable_backend: Option<String>,
    pub total_operations: u64,
}

/// Performance monitor.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl PerformanceMonitor {
    /// Create a monitor with the given configuration.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Begin measuring one operation against one backend.
    ///
    /// The returned guard records the measurement when dropped. Call
    /// `mark_failure` before then to tag the outcome as failed.
    pub fn start(&self, backend: &str, operation: &str) -> Measurement<'_> {
        Measurement {
            monitor: self,
            backend: backend.to_string(),
            operation: operation.to_string(),
            started: Instant::now(),
            failed: false,
        }
    }

    fn record(&self, backend: String, operation: String, elapsed: Duration, success: bool) {
        if !self.config.enabled {
            return;
        }
        let mut entries = self.lock();
        let entry = entries
            .entry((backend, operation))
            .or_insert_with(|| Entry {
                metrics: OperationMetrics::new(),
                last_recorded: Instant::now(),
            });
        entry.metrics.record(elapsed.as_secs_f64() * 1_000.0, success);
        entry.last_recorded = Instant::now();
    }

    /// Metrics for one backend, keyed by operation name.
    pub fn backend_metrics(&self, backend: &str) -> BTreeMap<String, OperationMetrics> {
        let entries = self.lock();
        entries
            .iter()
            .filter(|((b, _), _)| b == backend)
            .map(|((_, op), entry)| (op.clone(), entry.metrics))
            .collect()
    }

    /// Metrics for every backend, keyed by backend then operation.
    pub fn all_metrics(&self) -> BTreeMap<String, BTreeMap<String, OperationMetrics>> {
        let entries = self.lock();
        let mut out: BTreeMap<String, BTreeMap<String, OperationMetrics>> = BTreeMap::new();
        for ((backend, op), entry) in entries.iter() {
            out.entry(backend.clone())
                .or_default()
                .insert(op.clone(), entry.metrics);
        }
        out
    }

    /// Overview naming the fastest and most reliable backends.
    ///
    /// Entries idle past the retention window are left out so a backend
    /// that went quiet long ago cannot win on ancient numbers.
    pub fn summary(&self) -> MonitorSummary {
        let retention = Duration::from_secs(self.config.retention_secs);
        let entries = self.lock();

        let mut per_backend: BTreeMap<String, (f64, u64, u64, u64)> = BTreeMap::new();
        let mut total_operations = 0;
        for ((backend, _), entry) in entries.iter() {
            total_operations += entry.metrics.calls;
            if entry.last_recorded.elapsed() > retention {
                continue;
            }
            let slot = per_backend.entry(backend.clone()).or_insert((0.0, 0, 0, 0));
            slot.0 += entry.metrics.avg_ms * entry.metrics.calls as f64;
            slot.1 += entry.metrics.calls;
            slot.2 += entry.metrics.successes;
            slot.3 += entry.metrics.failures;
        }

        let fastest_backend = per_backend
            .iter()
            .filter(|(_, (_, calls, _, _))| *calls > 0)
            .min_by(|a, b| {
                let avg_a = a.1 .0 / a.1 .1 as f64;
                let avg_b = b.1 .0 / b.1 .1 as f64;
                avg_a.partial_cmp(&avg_b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(name, _)| name.clone());

        let most_reliable_backend = per_backend
            .iter()
            .filter(|(_, (_, calls, _, _))| *calls > 0)
            .max_by(|a, b| {
                let rate_a = a.1 .2 as f64 / a.1 .1 as f64;
                let rate_b = b.1 .2 as f64 / b.1 .1 as f64;
                rate_a.partial_cmp(&rate_b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(name, _)| name.clone());

        MonitorSummary {
            fastest_backend,
            most_reliable_backend,
            total_operations,
        }
    }

    /// Drop all recorded metrics.
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

/// Scoped measurement handle.
///
/// Records itself on drop, tagged as a success unless `mark_failure` was
/// called first.
pub struct Measurement<'a> {
    monitor: &'a PerformanceMonitor,
    backend: String,
    operation: String,
    started: Instant,
    failed: bool,
}

impl Measurement<'_> {
    /// Tag this measurement as a failure.
    pub fn mark_failure(&mut self) {
        self.failed = true;
    }
}

impl Drop for Measurement<'_> {
    fn drop(&mut self) {
        self.monitor.record(
            std::mem::take(&mut self.backend),
            std::mem::take(&mut self.operation),
            self.started.elapsed(),
            !self.failed,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_records_on_drop() {
        let monitor = PerformanceMonitor::default();
        {
            let _m = monitor.start("memory", "add");
        }
        let metrics = monitor.backend_metrics("memory");
        assert_eq!(metrics["add"].calls, 1);
        assert_eq!(metrics["add"].successes, 1);
    }

    #[test]
    fn test_guard_records_on_error_path() {
        let monitor = PerformanceMonitor::default();

        fn failing_op(monitor: &PerformanceMonitor) -> Result<(), &'static str> {
            let mut m = monitor.start("sqlite", "add");
            m.mark_failure();
            Err("backend down")
        }

        assert!(failing_op(&monitor).is_err());
        let metrics = monitor.backend_metrics("sqlite");
        assert_eq!(metrics["add"].calls, 1);
        assert_eq!(metrics["add"].failures, 1);
        assert_eq!(metrics["add"].successes, 0);
    }

    #[test]
    fn test_metrics_accumulate() {
        let monitor = PerformanceMonitor::default();
        for i in 0..4 {
            let mut m = monitor.start("memory", "search");
            if i % 2 == 0 {
                m.mark_failure();
            }
        }

        let metrics = monitor.backend_metrics("memory")["search"];
        assert_eq!(metrics.calls, 4);
        assert_eq!(metrics.successes, 2);
        assert_eq!(metrics.failures, 2);
        assert!((metrics.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!(metrics.min_ms <= metrics.max_ms);
        assert!(metrics.avg_ms >= metrics.min_ms && metrics.avg_ms <= metrics.max_ms);
    }

    #[test]
    fn test_disabled_monitor_records_nothing() {
        let monitor = PerformanceMonitor::new(MonitorConfig {
            enabled: false,
            ..MonitorConfig::default()
        });
        {
            let _m = monitor.start("memory", "add");
        }
        assert!(monitor.backend_metrics("memory").is_empty());
        assert_eq!(monitor.summary().total_operations, 0);
    }

    #[test]
    fn test_all_metrics_grouped_by_backend() {
        let monitor = PerformanceMonitor::default();
        drop(monitor.start("memory", "add"));
        drop(monitor.start("memory", "search"));
        drop(monitor.start("sqlite", "add"));

        let all = monitor.all_metrics();
        assert_eq!(all.len(), 2);
        assert_eq!(all["memory"].len(), 2);
        assert_eq!(all["sqlite"].len(), 1);
    }

    #[test]
    fn test_summary_names_fastest_and_most_reliable() {
        let monitor = PerformanceMonitor::default();

        // "fast" records two quick successes, "flaky" one slow failure.
        monitor.record(
            "fast".to_string(),
            "add".to_string(),
            Duration::from_millis(1),
            true,
        );
        monitor.record(
            "fast".to_string(),
            "add".to_string(),
            Duration::from_millis(2),
            true,
        );
        monitor.record(
            "flaky".to_string(),
            "add".to_string(),
            Duration::from_millis(200),
            false,
        );

        let summary = monitor.summary();
        assert_eq!(summary.fastest_backend.as_deref(), Some("fast"));
        assert_eq!(summary.most_reliable_backend.as_deref(), Some("fast"));
        assert_eq!(summary.total_operations, 3);
    }

    #[test]
    fn test_summary_ignores_entries_past_retention() {
        let monitor = PerformanceMonitor::new(MonitorConfig {
            enabled: true,
            retention_secs: 0,
        });
        monitor.record(
            "old".to_string(),
            "add".to_string(),
            Duration::from_millis(1),
            true,
        );

        let summary = monitor.summary();
        // Calls still count, but the stale entry cannot win a ranking.
        assert_eq!(summary.total_operations, 1);
        assert!(summary.fastest_backend.is_none());
    }

    #[test]
    fn test_reset_clears_metrics() {
        let monitor = PerformanceMonitor::default();
        drop(monitor.start("memory", "add"));
        monitor.reset();
        assert!(monitor.all_metrics().is_empty());
    }

    #[test]
    fn test_success_rate_zero_when_unused() {
        let metrics = OperationMetrics::new();
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn test_metrics_serialize() {
        let monitor = PerformanceMonitor::default();
        drop(monitor.start("memory", "add"));
        let json = serde_json::to_string(&monitor.all_metrics()).unwrap();
        assert!(json.contains("\"memory\""));
    }
}
