//! Storage backends for stratum.
//!
//! This module provides the trait every storage engine implements and the
//! four concrete engines:
//!
//! - **rest**: remote memory service, JSON over HTTP
//! - **sqlite**: relational store with optional full-text indexing
//! - **jsonfile**: single-file JSON document store
//! - **memory**: process-lifetime map, the terminal fallback

pub mod jsonfile;
pub mod memory;
pub mod rest;
pub mod sqlite;
pub mod traits;

pub use jsonfile::JsonFileBackend;
pub use memory::InMemoryBackend;
pub use rest::{RestBackend, RestOptions};
pub use sqlite::{SqliteBackend, SqliteOptions};
pub use traits::MemoryStore;
