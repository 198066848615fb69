//! Backend auto-detection.
//!
//! The engine probes every registered backend concurrently, records the
//! verdicts in a TTL-bounded health cache it exclusively owns, and picks
//! the first healthy backend in the configured priority order.
//!
//! Probing synchronously inside every user call would add a worst-case
//! N-times-timeout latency to every operation; the cache bounds that cost
//! to once per TTL window while still noticing an outage within one
//! window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backends::MemoryStore;
use crate::core::{BackendHealth, HealthReport};

/// Detection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Hard per-probe timeout in milliseconds.
    pub timeout_ms: u64,
    /// Probe attempts per backend per cycle.
    pub retries: u32,
    /// Seconds a cached verdict stays trustworthy.
    pub cache_ttl_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            retries: 3,
            cache_ttl_secs: 300,
        }
    }
}

impl DetectionConfig {
    /// Probe timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Cache TTL as a duration.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Auto-detection engine.
///
/// Owns the health cache exclusively; every other component reads health
/// through the accessors here and never mutates it.
pub struct AutoDetectionEngine {
    config: DetectionConfig,
    cache: Mutex<HashMap<String, BackendHealth>>,
}

impl AutoDetectionEngine {
    /// Create an engine with the given tuning.
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Run one detection cycle and select a backend.
    ///
    /// Backends with a fresh cached verdict are not re-probed. Stale or
    /// unknown backends are probed concurrently; one probe timing out
    /// never delays another. Returns the first healthy name in priority
    /// order, or `None` when nothing is available. "Nothing available" is
    /// a value, not an error: callers decide what to do about it.
    pub async fn detect(
        &self,
        backends: &HashMap<String, Arc<dyn MemoryStore>>,
        priority: &[String],
    ) -> Option<String> {
        if backends.is_empty() {
            warn!("no backends registered for detection");
            return None;
        }

        let stale: Vec<(String, Arc<dyn MemoryStore>)> = {
            let cache = self.lock();
            backends
                .iter()
                .filter(|(name, _)| {
                    !cache
                        .get(*name)
                        .is_some_and(|entry| entry.is_fresh(self.config.cache_ttl()))
                })
                .map(|(name, backend)| (name.clone(), backend.clone()))
                .collect()
        };

        if !stale.is_empty() {
            let config = self.config;
            let probes = stale.into_iter().map(|(name, backend)| {
                tokio::spawn(async move { probe_backend(name, backend, config).await })
            });

            for joined in join_all(probes).await {
                let health = match joined {
                    Ok(health) => health,
                    Err(e) => {
                        warn!("health probe task failed: {e}");
                        continue;
                    }
                };
                let mut cache = self.lock();
                let mut health = health;
                if let Some(previous) = cache.get(&health.backend) {
                    health.inherit_streaks(previous);
                }
                debug!(
                    "probed {}: healthy={} latency={:.1}ms",
                    health.backend, health.healthy, health.response_time_ms
                );
                cache.insert(health.backend.clone(), health);
            }
        }

        // Walk the priority order; registered backends missing from it are
        // considered last, in name order, so nothing silently disappears.
        let cache = self.lock();
        let mut order: Vec<&String> = priority
            .iter()
            .filter(|name| backends.contains_key(*name))
            .collect();
        let mut extras: Vec<&String> = backends
            .keys()
            .filter(|name| !priority.contains(*name))
            .collect();
        extras.sort();
        order.extend(extras);

        for name in order {
            if cache.get(name).is_some_and(|entry| entry.healthy) {
                info!("selected backend {name}");
                return Some(name.clone());
            }
        }
        warn!("no healthy backend available");
        None
    }

    /// Fresh cached verdict for one backend. `None` when the entry is
    /// missing or has aged past the TTL.
    pub fn cached_verdict(&self, name: &str) -> Option<bool> {
        let cache = self.lock();
        cache
            .get(name)
            .filter(|entry| entry.is_fresh(self.config.cache_ttl()))
            .map(|entry| entry.healthy)
    }

    /// Fresh cached entry for one backend.
    pub fn cached_health(&self, name: &str) -> Option<BackendHealth> {
        let cache = self.lock();
        cache
            .get(name)
            .filter(|entry| entry.is_fresh(self.config.cache_ttl()))
            .cloned()
    }

    /// Drop one cached entry, or all of them, forcing a re-probe on the
    /// next cycle.
    pub fn invalidate(&self, name: Option<&str>) {
        let mut cache = self.lock();
        match name {
            Some(name) => {
                cache.remove(name);
            }
            None => cache.clear(),
        }
    }

    /// Summarize every cached entry, fresh or not.
    pub fn health_report(&self) -> HealthReport {
        let cache = self.lock();
        HealthReport::from_entries(cache.values())
    }

    /// The probe timeout, shared with callers that probe directly.
    pub fn probe_timeout(&self) -> Duration {
        self.config.timeout()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BackendHealth>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AutoDetectionEngine {
    fn default() -> Self {
        Self::new(DetectionConfig::default())
    }
}

/// Probe one backend with a hard timeout, retrying errors with a linear
/// backoff. A verdict, healthy or not, ends the attempts; only errors and
/// timeouts are retried.
async fn probe_backend(
    name: String,
    backend: Arc<dyn MemoryStore>,
    config: DetectionConfig,
) -> BackendHealth {
    let attempts = config.retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let started = Instant::now();
        let outcome = tokio::time::timeout(config.timeout(), async {
            backend.initialize().await?;
            backend.health_check().await
        })
        .await;

        match outcome {
            Ok(Ok(true)) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                return BackendHealth::healthy(&name, elapsed_ms, backend.features());
            }
            Ok(Ok(false)) => {
                return BackendHealth::unhealthy(&name, "health check reported unhealthy");
            }
            Ok(Err(e)) => {
                last_error = e.to_string();
                debug!("probe attempt {attempt} for {name} failed: {last_error}");
            }
            Err(_) => {
                last_error = format!("timed out after {}ms", config.timeout_ms);
                debug!("probe attempt {attempt} for {name} timed out");
            }
        }

        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(100) * attempt).await;
        }
    }

    BackendHealth::unhealthy(&name, last_error)
}
