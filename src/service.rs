//! Unified memory service.
//!
//! Single entry point over the registered backends. Every public operation
//! runs under the shared circuit breaker and, inside the breaker call,
//! walks the fallback chain in order: skip unregistered names, skip
//! backends that look unhealthy, try the operation, and return the first
//! success. Per-backend failures are logged and turn into "try the next
//! entry"; only chain exhaustion and breaker rejection reach the caller.
//!
//! The chain walk is strictly sequential. Trying two backends at once
//! could land the same logical write twice, so the second backend is only
//! consulted after the first one failed outright.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backends::{
    InMemoryBackend, JsonFileBackend, MemoryStore, RestBackend, SqliteBackend,
};
use crate::breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::config::Config;
use crate::core::{
    HealthReport, MemoryCategory, MemoryDraft, MemoryItem, MemoryPatch, MemoryQuery, MemoryStats,
};
use crate::detect::{AutoDetectionEngine, DetectionConfig};
use crate::error::{Result, StratumError};
use crate::monitor::{MonitorConfig, MonitorSummary, PerformanceMonitor};

/// Service-level counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ServiceMetrics {
    /// Operations accepted by the facade (admitted or not).
    pub operations: u64,
    /// Times the serving backend changed from the previous one.
    pub backend_switches: u64,
}

/// Combined health view of the service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub initialized: bool,
    pub active_backend: Option<String>,
    pub fallback_chain: Vec<String>,
    pub circuit_breaker: BreakerSnapshot,
    pub backends: HealthReport,
    pub performance: MonitorSummary,
    pub metrics: ServiceMetrics,
}

/// Unified memory service with auto-detection and failover.
pub struct MemoryService {
    backends: HashMap<String, Arc<dyn MemoryStore>>,
    chain: Vec<String>,
    preferred: Option<String>,
    auto_detect: bool,
    breaker: CircuitBreaker,
    detection: AutoDetectionEngine,
    monitor: PerformanceMonitor,
    active: Mutex<Option<String>>,
    metrics: Mutex<ServiceMetrics>,
    initialized: AtomicBool,
}

impl MemoryService {
    /// Build the service from configuration, registering every enabled
    /// backend.
    pub fn new(config: &Config) -> Self {
        let enabled = |name: &str| {
            config
                .backends
                .overrides
                .get(name)
                .copied()
                .unwrap_or(true)
        };

        let mut backends: HashMap<String, Arc<dyn MemoryStore>> = HashMap::new();
        if enabled("rest") {
            backends.insert(
                "rest".to_string(),
                Arc::new(RestBackend::new(config.rest_options())),
            );
        }
        if enabled("sqlite") {
            backends.insert(
                "sqlite".to_string(),
                Arc::new(SqliteBackend::new(config.sqlite_options())),
            );
        }
        if enabled("jsonfile") {
            backends.insert(
                "jsonfile".to_string(),
                Arc::new(
                    JsonFileBackend::new(&config.jsonfile.path).with_pretty(config.jsonfile.pretty),
                ),
            );
        }
        if enabled("memory") {
            backends.insert("memory".to_string(), Arc::new(InMemoryBackend::new()));
        }

        Self::from_parts(
            backends,
            config.backends.fallback_chain.clone(),
            config.backends.preferred.clone(),
            config.backends.auto_detection,
            config.circuit_breaker,
            config.detection,
            config.monitoring,
        )
    }

    /// Build the service from explicit parts. This is the seam tests and
    /// embedders use to register their own stores.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        backends: HashMap<String, Arc<dyn MemoryStore>>,
        fallback_chain: Vec<String>,
        preferred: Option<String>,
        auto_detect: bool,
        breaker: CircuitBreakerConfig,
        detection: DetectionConfig,
        monitoring: MonitorConfig,
    ) -> Self {
        let chain: Vec<String> = fallback_chain
            .into_iter()
            .filter(|name| {
                let known = backends.contains_key(name);
                if !known {
                    debug!("dropping unregistered backend {name} from fallback chain");
                }
                known
            })
            .collect();

        Self {
            backends,
            chain,
            preferred,
            auto_detect,
            breaker: CircuitBreaker::new(breaker),
            detection: AutoDetectionEngine::new(detection),
            monitor: PerformanceMonitor::new(monitoring),
            active: Mutex::new(None),
            metrics: Mutex::new(ServiceMetrics::default()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Selection order for detection: the preferred backend first, then
    /// the chain.
    fn selection_priority(&self) -> Vec<String> {
        let mut order = Vec::new();
        if let Some(preferred) = &self.preferred {
            if self.backends.contains_key(preferred) {
                order.push(preferred.clone());
            }
        }
        for name in &self.chain {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    /// Initialize the service.
    ///
    /// With auto-detection on, one detection cycle runs and its pick
    /// becomes the active backend. A fully-down chain still initializes
    /// successfully; the first operation will then fail with
    /// `AllBackendsFailed`. An empty chain is a configuration error.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.chain.is_empty() {
            return Err(StratumError::config(
                "fallback chain is empty, no registered backend to serve from",
            ));
        }

        let active = if self.auto_detect {
            let priority = self.selection_priority();
            self.detection.detect(&self.backends, &priority).await
        } else {
            self.selection_priority().into_iter().next()
        };

        match &active {
            Some(name) => info!("memory service initialized, serving from {name}"),
            None => warn!("memory service initialized with no healthy backend"),
        }
        *self.lock_active() = active;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Store a new record, returning the id assigned by whichever backend
    /// accepted the write. The id is only valid against that backend; the
    /// same logical write is never retried elsewhere after a success.
    pub async fn add_memory(&self, project_name: &str, draft: MemoryDraft) -> Result<String> {
        self.ensure_initialized()?;
        let project = project_name.to_string();
        self.execute("add", move |backend| {
            let project = project.clone();
            let draft = draft.clone();
            Box::pin(async move { backend.add(&project, draft).await })
        })
        .await
    }

    /// Search one project's records. Only the first healthy backend's
    /// results are returned; result sets are never merged across backends.
    pub async fn search_memories(
        &self,
        project_name: &str,
        query: &MemoryQuery,
    ) -> Result<Vec<MemoryItem>> {
        self.ensure_initialized()?;
        let project = project_name.to_string();
        let query = query.normalized();
        self.execute("search", move |backend| {
            let project = project.clone();
            let query = query.clone();
            Box::pin(async move { backend.search(&project, &query).await })
        })
        .await
    }

    /// Fetch one record by id.
    pub async fn get_memory(
        &self,
        project_name: &str,
        memory_id: &str,
    ) -> Result<Option<MemoryItem>> {
        self.ensure_initialized()?;
        let project = project_name.to_string();
        let id = memory_id.to_string();
        self.execute("get", move |backend| {
            let project = project.clone();
            let id = id.clone();
            Box::pin(async move { backend.get(&project, &id).await })
        })
        .await
    }

    /// Patch an existing record. `Ok(false)` when no backend knows the id.
    pub async fn update_memory(
        &self,
        project_name: &str,
        memory_id: &str,
        patch: MemoryPatch,
    ) -> Result<bool> {
        self.ensure_initialized()?;
        let project = project_name.to_string();
        let id = memory_id.to_string();
        self.execute("update", move |backend| {
            let project = project.clone();
            let id = id.clone();
            let patch = patch.clone();
            Box::pin(async move { backend.update(&project, &id, patch).await })
        })
        .await
    }

    /// Delete a record. `Ok(false)` when no backend knows the id.
    pub async fn delete_memory(&self, project_name: &str, memory_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let project = project_name.to_string();
        let id = memory_id.to_string();
        self.execute("delete", move |backend| {
            let project = project.clone();
            let id = id.clone();
            Box::pin(async move { backend.delete(&project, &id).await })
        })
        .await
    }

    /// List one project's records, most recent first.
    pub async fn list_project_memories(
        &self,
        project_name: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        self.ensure_initialized()?;
        let project = project_name.to_string();
        self.execute("list", move |backend| {
            let project = project.clone();
            Box::pin(async move { backend.list_project(&project, category, limit).await })
        })
        .await
    }

    /// Per-project statistics from the first healthy backend.
    pub async fn get_stats(&self, project_name: &str) -> Result<MemoryStats> {
        self.ensure_initialized()?;
        let project = project_name.to_string();
        self.execute("stats", move |backend| {
            let project = project.clone();
            Box::pin(async move { backend.stats(&project).await })
        })
        .await
    }

    /// Run one operation through the breaker and the fallback chain.
    async fn execute<T: Send>(
        &self,
        operation: &str,
        run: impl Fn(Arc<dyn MemoryStore>) -> BoxFuture<'static, Result<T>> + Send + Sync,
    ) -> Result<T> {
        {
            let mut metrics = self.lock_metrics();
            metrics.operations += 1;
        }

        self.breaker
            .call(|| async {
                let mut tried = Vec::new();
                let mut errors = Vec::new();

                for name in &self.chain {
                    let Some(backend) = self.backends.get(name) else {
                        continue;
                    };
                    tried.push(name.clone());

                    if let Err(e) = backend.initialize().await {
                        debug!("{operation}: skipping {name}: {e}");
                        errors.push(e.to_string());
                        continue;
                    }
                    if !self.backend_usable(name, backend).await {
                        debug!("{operation}: skipping unhealthy backend {name}");
                        errors.push(format!("{name}: unhealthy"));
                        continue;
                    }

                    let mut measurement = self.monitor.start(name, operation);
                    match run(backend.clone()).await {
                        Ok(value) => {
                            self.note_active(name);
                            return Ok(value);
                        }
                        Err(e) => {
                            measurement.mark_failure();
                            warn!("{operation} failed on {name}, trying next backend: {e}");
                            errors.push(e.to_string());
                        }
                    }
                }

                Err(StratumError::all_backends_failed(tried, errors))
            })
            .await
    }

    /// Health gate for one chain entry. A fresh cached verdict from the
    /// detection engine is reused; otherwise the backend is asked
    /// directly, bounded by the probe timeout.
    async fn backend_usable(&self, name: &str, backend: &Arc<dyn MemoryStore>) -> bool {
        if let Some(verdict) = self.detection.cached_verdict(name) {
            return verdict;
        }
        match tokio::time::timeout(self.detection.probe_timeout(), backend.health_check()).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                debug!("direct health check for {name} failed: {e}");
                false
            }
            Err(_) => {
                debug!("direct health check for {name} timed out");
                false
            }
        }
    }

    fn note_active(&self, name: &str) {
        let mut active = self.lock_active();
        if active.as_deref() != Some(name) {
            if let Some(previous) = active.as_deref() {
                info!("switching active backend from {previous} to {name}");
            }
            *active = Some(name.to_string());
            self.lock_metrics().backend_switches += 1;
        }
    }

    /// Force a specific backend to become active. It must be registered,
    /// initializable and healthy.
    pub async fn switch_backend(&self, name: &str) -> Result<()> {
        let backend = self
            .backends
            .get(name)
            .ok_or_else(|| StratumError::config(format!("backend {name} is not registered")))?;

        backend.initialize().await?;
        if !backend.health_check().await? {
            return Err(StratumError::initialization(
                name,
                "backend is not healthy",
            ));
        }
        self.note_active(name);
        Ok(())
    }

    /// Run a detection cycle now and return the selected backend.
    pub async fn detect_backend(&self) -> Option<String> {
        let priority = self.selection_priority();
        let selected = self.detection.detect(&self.backends, &priority).await;
        if let Some(name) = &selected {
            self.note_active(name);
        }
        selected
    }

    /// Drop cached health state, forcing fresh probes.
    pub fn invalidate_health(&self, name: Option<&str>) {
        self.detection.invalidate(name);
    }

    /// Manually close the circuit breaker.
    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    /// Combined health view: breaker state, cached backend health,
    /// performance summary and service counters.
    pub fn service_health(&self) -> ServiceHealth {
        ServiceHealth {
            initialized: self.initialized.load(Ordering::SeqCst),
            active_backend: self.lock_active().clone(),
            fallback_chain: self.chain.clone(),
            circuit_breaker: self.breaker.state(),
            backends: self.detection.health_report(),
            performance: self.monitor.summary(),
            metrics: *self.lock_metrics(),
        }
    }

    /// Currently active backend name, if any operation has succeeded or
    /// detection has selected one.
    pub fn active_backend(&self) -> Option<String> {
        self.lock_active().clone()
    }

    /// The fallback chain actually in effect.
    pub fn fallback_chain(&self) -> &[String] {
        &self.chain
    }

    /// Names of all registered backends.
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// A registered backend by name, for direct use by tooling such as
    /// the migrator.
    pub fn backend(&self, name: &str) -> Option<Arc<dyn MemoryStore>> {
        self.backends.get(name).cloned()
    }

    /// The performance monitor.
    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    /// Release every backend's resources. Safe to call repeatedly; the
    /// service needs another `initialize` before further use.
    pub async fn cleanup(&self) {
        for (name, backend) in &self.backends {
            if let Err(e) = backend.cleanup().await {
                warn!("cleanup of backend {name} failed: {e}");
            }
        }
        *self.lock_active() = None;
        self.initialized.store(false, Ordering::SeqCst);
        info!("memory service cleaned up");
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StratumError::config(
                "memory service not initialized, call initialize() first",
            ))
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, ServiceMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Scriptable store: health and failure mode can be flipped, data
    /// operations are counted and optionally delegated to a real
    /// in-memory store.
    struct ScriptedStore {
        name: String,
        healthy: AtomicBool,
        failing: AtomicBool,
        op_calls: AtomicU32,
        inner: InMemoryBackend,
    }

    impl ScriptedStore {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                healthy: AtomicBool::new(true),
                failing: AtomicBool::new(false),
                op_calls: AtomicU32::new(0),
                inner: InMemoryBackend::new(),
            })
        }

        fn down(name: &str) -> Arc<Self> {
            let store = Self::new(name);
            store.healthy.store(false, Ordering::SeqCst);
            store
        }

        fn failing(name: &str) -> Arc<Self> {
            let store = Self::new(name);
            store.failing.store(true, Ordering::SeqCst);
            store
        }

        fn op_count(&self) -> u32 {
            self.op_calls.load(Ordering::SeqCst)
        }

        fn note_op(&self) -> Result<()> {
            self.op_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(StratumError::write(&self.name, "scripted failure"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl MemoryStore for ScriptedStore {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> Result<bool> {
            Ok(self.healthy.load(Ordering::SeqCst))
        }
        async fn add(&self, project: &str, draft: MemoryDraft) -> Result<String> {
            self.note_op()?;
            self.inner.add(project, draft).await
        }
        async fn search(&self, project: &str, query: &MemoryQuery) -> Result<Vec<MemoryItem>> {
            self.note_op()?;
            self.inner.search(project, query).await
        }
        async fn get(&self, project: &str, id: &str) -> Result<Option<MemoryItem>> {
            self.note_op()?;
            self.inner.get(project, id).await
        }
        async fn update(&self, project: &str, id: &str, patch: MemoryPatch) -> Result<bool> {
            self.note_op()?;
            self.inner.update(project, id, patch).await
        }
        async fn delete(&self, project: &str, id: &str) -> Result<bool> {
            self.note_op()?;
            self.inner.delete(project, id).await
        }
        async fn list_project(
            &self,
            project: &str,
            category: Option<MemoryCategory>,
            limit: usize,
        ) -> Result<Vec<MemoryItem>> {
            self.note_op()?;
            self.inner.list_project(project, category, limit).await
        }
        async fn stats(&self, project: &str) -> Result<MemoryStats> {
            self.note_op()?;
            self.inner.stats(project).await
        }
        async fn cleanup(&self) -> Result<()> {
            self.inner.cleanup().await
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn supports_similarity_search(&self) -> bool {
            false
        }
    }

    fn service_over(stores: Vec<Arc<ScriptedStore>>) -> MemoryService {
        let chain: Vec<String> = stores.iter().map(|s| s.name.clone()).collect();
        let backends: HashMap<String, Arc<dyn MemoryStore>> = stores
            .into_iter()
            .map(|s| (s.name.clone(), s as Arc<dyn MemoryStore>))
            .collect();
        MemoryService::from_parts(
            backends,
            chain,
            None,
            true,
            CircuitBreakerConfig::default(),
            DetectionConfig::default(),
            MonitorConfig::default(),
        )
    }

    fn draft(content: &str) -> MemoryDraft {
        MemoryDraft::new(content, MemoryCategory::Pattern)
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let service = service_over(vec![ScriptedStore::new("a")]);
        let err = service.add_memory("demo", draft("x")).await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn test_initialize_empty_chain_is_config_error() {
        let service = MemoryService::from_parts(
            HashMap::new(),
            vec!["ghost".to_string()],
            None,
            true,
            CircuitBreakerConfig::default(),
            DetectionConfig::default(),
            MonitorConfig::default(),
        );
        let err = service.initialize().await.unwrap_err();
        assert!(matches!(err, StratumError::Config { .. }));
    }

    #[tokio::test]
    async fn test_first_healthy_backend_wins_and_rest_untouched() {
        let a = ScriptedStore::down("a");
        let b = ScriptedStore::new("b");
        let c = ScriptedStore::new("c");
        let service = service_over(vec![a.clone(), b.clone(), c.clone()]);
        service.initialize().await.unwrap();

        let id = service.add_memory("demo", draft("landed on b")).await.unwrap();

        assert_eq!(a.op_count(), 0);
        assert_eq!(b.op_count(), 1);
        assert_eq!(c.op_count(), 0, "later chain entries must not be invoked");
        assert_eq!(service.active_backend().as_deref(), Some("b"));

        let item = service.get_memory("demo", &id).await.unwrap().unwrap();
        assert_eq!(item.content, "landed on b");
    }

    #[tokio::test]
    async fn test_failing_backend_falls_through_to_next() {
        let a = ScriptedStore::failing("a");
        let b = ScriptedStore::new("b");
        let service = service_over(vec![a.clone(), b.clone()]);
        service.initialize().await.unwrap();

        let id = service.add_memory("demo", draft("recovered")).await.unwrap();

        // a was tried (healthy but failing), then b served the write.
        assert_eq!(a.op_count(), 1);
        assert_eq!(b.op_count(), 1);
        assert!(service.get_memory("demo", &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_write_succeeds_on_terminal_backend_when_others_down() {
        // Mirrors the deployment shape: remote and relational engines are
        // down, the in-memory terminal entry still accepts writes.
        let rest = ScriptedStore::down("rest");
        let sqlite = ScriptedStore::down("sqlite");
        let memory = ScriptedStore::new("memory");
        let service = service_over(vec![rest, sqlite, memory]);
        service.initialize().await.unwrap();

        let id = service.add_memory("demo", draft("still alive")).await.unwrap();
        let item = service.get_memory("demo", &id).await.unwrap().unwrap();
        assert_eq!(item.content, "still alive");
        assert_eq!(service.active_backend().as_deref(), Some("memory"));
    }

    #[tokio::test]
    async fn test_exhausted_chain_reports_all_backends_failed() {
        let a = ScriptedStore::down("a");
        let b = ScriptedStore::failing("b");
        let service = service_over(vec![a, b]);
        service.initialize().await.unwrap();

        let err = service.add_memory("demo", draft("nope")).await.unwrap_err();
        match err {
            StratumError::AllBackendsFailed { chain, errors } => {
                assert_eq!(chain, vec!["a", "b"]);
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("unhealthy"));
                assert!(errors[1].contains("scripted failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_repeated_exhaustion_opens_breaker() {
        let a = ScriptedStore::failing("a");
        let service = MemoryService::from_parts(
            [("a".to_string(), a as Arc<dyn MemoryStore>)].into(),
            vec!["a".to_string()],
            None,
            true,
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout_secs: 3600,
                ..CircuitBreakerConfig::default()
            },
            DetectionConfig::default(),
            MonitorConfig::default(),
        );
        service.initialize().await.unwrap();

        service.add_memory("demo", draft("1")).await.unwrap_err();
        service.add_memory("demo", draft("2")).await.unwrap_err();

        let err = service.add_memory("demo", draft("3")).await.unwrap_err();
        assert!(matches!(err, StratumError::CircuitOpen { .. }));

        service.reset_circuit_breaker();
        let err = service.add_memory("demo", draft("4")).await.unwrap_err();
        assert!(matches!(err, StratumError::AllBackendsFailed { .. }));
    }

    #[tokio::test]
    async fn test_search_returns_single_backend_results() {
        let a = ScriptedStore::new("a");
        let b = ScriptedStore::new("b");
        let service = service_over(vec![a.clone(), b.clone()]);
        service.initialize().await.unwrap();

        // Seed both stores directly; the facade must only surface a's.
        a.inner.add("demo", draft("from a")).await.unwrap();
        b.inner.add("demo", draft("from b")).await.unwrap();

        let results = service
            .search_memories("demo", &MemoryQuery::new(""))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "from a");
    }

    #[tokio::test]
    async fn test_update_delete_missing_return_false() {
        let service = service_over(vec![ScriptedStore::new("a")]);
        service.initialize().await.unwrap();

        assert!(!service
            .update_memory("demo", "ghost", MemoryPatch::new().content("x"))
            .await
            .unwrap());
        assert!(!service.delete_memory("demo", "ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_stats_flow() {
        let service = service_over(vec![ScriptedStore::new("a")]);
        service.initialize().await.unwrap();

        service.add_memory("demo", draft("one")).await.unwrap();
        service
            .add_memory("demo", MemoryDraft::new("two", MemoryCategory::Error))
            .await
            .unwrap();

        let all = service.list_project_memories("demo", None, 10).await.unwrap();
        assert_eq!(all.len(), 2);

        let errors = service
            .list_project_memories("demo", Some(MemoryCategory::Error), 10)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);

        let stats = service.get_stats("demo").await.unwrap();
        assert_eq!(stats.total, 2);
    }

    #[tokio::test]
    async fn test_switch_backend() {
        let a = ScriptedStore::new("a");
        let b = ScriptedStore::new("b");
        let service = service_over(vec![a, b]);
        service.initialize().await.unwrap();

        service.switch_backend("b").await.unwrap();
        assert_eq!(service.active_backend().as_deref(), Some("b"));

        let err = service.switch_backend("ghost").await.unwrap_err();
        assert!(matches!(err, StratumError::Config { .. }));
    }

    #[tokio::test]
    async fn test_switch_to_unhealthy_backend_fails() {
        let a = ScriptedStore::new("a");
        let b = ScriptedStore::down("b");
        let service = service_over(vec![a, b]);
        service.initialize().await.unwrap();

        let err = service.switch_backend("b").await.unwrap_err();
        assert!(matches!(err, StratumError::Initialization { .. }));
    }

    #[tokio::test]
    async fn test_service_health_snapshot() {
        let a = ScriptedStore::new("a");
        let service = service_over(vec![a]);
        service.initialize().await.unwrap();
        service.add_memory("demo", draft("x")).await.unwrap();

        let health = service.service_health();
        assert!(health.initialized);
        assert_eq!(health.active_backend.as_deref(), Some("a"));
        assert_eq!(health.fallback_chain, vec!["a"]);
        assert_eq!(health.metrics.operations, 1);
        assert!(health.backends.total_backends >= 1);

        // The whole view serializes for status endpoints and logs.
        let json = serde_json::to_string(&health).unwrap();
        assert!(json.contains("\"active_backend\""));
    }

    #[tokio::test]
    async fn test_monitor_records_per_backend_operations() {
        let a = ScriptedStore::new("a");
        let service = service_over(vec![a]);
        service.initialize().await.unwrap();

        service.add_memory("demo", draft("x")).await.unwrap();
        service
            .search_memories("demo", &MemoryQuery::new(""))
            .await
            .unwrap();

        let metrics = service.monitor().backend_metrics("a");
        assert_eq!(metrics["add"].calls, 1);
        assert_eq!(metrics["search"].calls, 1);
    }

    #[tokio::test]
    async fn test_detection_cache_skips_down_backend_without_reprobing() {
        let a = ScriptedStore::down("a");
        let b = ScriptedStore::new("b");
        let service = service_over(vec![a.clone(), b]);
        service.initialize().await.unwrap();

        for _ in 0..3 {
            service.add_memory("demo", draft("x")).await.unwrap();
        }
        // The cached verdict from initialization keeps a out of the data
        // path entirely.
        assert_eq!(a.op_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_resets_state() {
        let service = service_over(vec![ScriptedStore::new("a")]);
        service.initialize().await.unwrap();
        service.cleanup().await;

        assert!(service.active_backend().is_none());
        assert!(service.add_memory("demo", draft("x")).await.is_err());

        // A fresh initialize brings the service back.
        service.initialize().await.unwrap();
        service.add_memory("demo", draft("again")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_chain_entries_are_dropped() {
        let a = ScriptedStore::new("a");
        let backends: HashMap<String, Arc<dyn MemoryStore>> =
            [("a".to_string(), a as Arc<dyn MemoryStore>)].into();
        let service = MemoryService::from_parts(
            backends,
            vec!["ghost".to_string(), "a".to_string()],
            None,
            true,
            CircuitBreakerConfig::default(),
            DetectionConfig::default(),
            MonitorConfig::default(),
        );
        assert_eq!(service.fallback_chain(), &["a".to_string()]);
    }

    #[tokio::test]
    async fn test_preferred_backend_selected_first() {
        let a = ScriptedStore::new("a");
        let b = ScriptedStore::new("b");
        let chain = vec!["a".to_string(), "b".to_string()];
        let backends: HashMap<String, Arc<dyn MemoryStore>> = [
            ("a".to_string(), a as Arc<dyn MemoryStore>),
            ("b".to_string(), b as Arc<dyn MemoryStore>),
        ]
        .into();
        let service = MemoryService::from_parts(
            backends,
            chain,
            Some("b".to_string()),
            true,
            CircuitBreakerConfig::default(),
            DetectionConfig::default(),
            MonitorConfig::default(),
        );
        service.initialize().await.unwrap();
        assert_eq!(service.active_backend().as_deref(), Some("b"));
    }
}
