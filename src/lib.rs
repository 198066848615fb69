//! Stratum - flexible memory storage with automatic backend failover.
//!
//! Stratum stores note-like records ("memories") behind a single service
//! facade over interchangeable storage backends. Backends are probed
//! concurrently and ranked by health, operations walk a configured
//! fallback chain protected by a circuit breaker, and a migration engine
//! moves records between backends with backup and progress reporting.

pub mod backends;
pub mod breaker;
pub mod config;
pub mod core;
pub mod detect;
pub mod error;
pub mod migrate;
pub mod monitor;
pub mod service;

pub use backends::{
    InMemoryBackend, JsonFileBackend, MemoryStore, RestBackend, RestOptions, SqliteBackend,
    SqliteOptions,
};
pub use breaker::{
    BreakerMetrics, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use config::{stratum_home, BackendsConfig, Config, ConfigCache};
pub use core::{
    BackendFeatures, BackendHealth, HealthReport, MemoryCategory, MemoryDraft, MemoryItem,
    MemoryPatch, MemoryQuery, MemoryStats,
};
pub use detect::{AutoDetectionEngine, DetectionConfig};
pub use error::{Result, StratumError};
pub use migrate::{MigrationConfig, MigrationPlan, MigrationReport, Migrator};
pub use monitor::{MonitorConfig, OperationMetrics, PerformanceMonitor};
pub use service::{MemoryService, ServiceHealth, ServiceMetrics};
