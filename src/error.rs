//! Unified error types for stratum.
//!
//! Errors are split into two tiers. Backend-level failures (initialization,
//! read, write) are recoverable: the service catches them, logs a warning,
//! and moves on to the next entry in the fallback chain. Only chain
//! exhaustion and circuit-breaker rejection are surfaced to callers.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for stratum operations.
#[derive(Error, Debug)]
pub enum StratumError {
    /// A backend could not be brought up. Fatal for that backend only;
    /// the fallback chain simply skips it.
    #[error("{backend}: initialization failed: {message}")]
    Initialization { backend: String, message: String },

    /// A single backend write failed. The caller must not assume the
    /// record was partially written.
    #[error("{backend}: write failed: {message}")]
    Write { backend: String, message: String },

    /// A single backend read failed.
    #[error("{backend}: read failed: {message}")]
    Read { backend: String, message: String },

    /// The circuit breaker is rejecting calls while the fallback operation
    /// cools down.
    #[error("circuit breaker is open, retry in {retry_in_secs}s")]
    CircuitOpen { retry_in_secs: u64 },

    /// Every entry in the fallback chain failed or was unhealthy.
    #[error("all backends failed (chain: {})", chain.join(" -> "))]
    AllBackendsFailed {
        /// Backend names in the order they were tried.
        chain: Vec<String>,
        /// Last error recorded per tried backend, for diagnosis.
        errors: Vec<String>,
    },

    /// Migration failed before or during execution.
    #[error("migration error: {message}")]
    Migration { message: String },

    /// Configuration loading errors.
    #[error("config error: {message}")]
    Config { message: String },

    /// I/O errors from store files and backup artifacts.
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// JSON or TOML parsing/serialization errors.
    #[error("serialization error: {message}")]
    Serde { message: String },
}

/// A specialized Result type for stratum operations.
pub type Result<T> = std::result::Result<T, StratumError>;

impl StratumError {
    /// Create an initialization error for a backend.
    pub fn initialization(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Initialization {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a write error for a backend.
    pub fn write(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Write {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a read error for a backend.
    pub fn read(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Read {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a circuit-open rejection.
    pub fn circuit_open(retry_in_secs: u64) -> Self {
        Self::CircuitOpen { retry_in_secs }
    }

    /// Create a chain-exhaustion error.
    pub fn all_backends_failed(chain: Vec<String>, errors: Vec<String>) -> Self {
        Self::AllBackendsFailed { chain, errors }
    }

    /// Create a migration error.
    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a storage error from an I/O error.
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Create a serialization error.
    pub fn serde(message: impl Into<String>) -> Self {
        Self::Serde {
            message: message.into(),
        }
    }

    /// Check whether this error is scoped to a single backend.
    ///
    /// Backend-scoped errors are recovered by trying the next entry in the
    /// fallback chain. Everything else propagates to the caller.
    pub fn is_backend_error(&self) -> bool {
        matches!(
            self,
            Self::Initialization { .. } | Self::Write { .. } | Self::Read { .. }
        )
    }
}

impl From<io::Error> for StratumError {
    fn from(err: io::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for StratumError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde {
            message: err.to_string(),
        }
    }
}
