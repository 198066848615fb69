//! Storage backend contract.
//!
//! Every storage engine implements `MemoryStore`. The service layer only
//! ever talks to this trait, so new backends plug in without touching the
//! fallback or detection machinery.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{
    BackendFeatures, MemoryCategory, MemoryDraft, MemoryItem, MemoryPatch, MemoryQuery,
    MemoryStats,
};
use crate::error::Result;

/// Contract implemented by every storage backend.
///
/// Guarantees the rest of the system relies on:
///
/// - `initialize` is idempotent and must run before any other operation;
///   it fails when the underlying resource is unreachable.
/// - `add` assigns a fresh unique id and never mutates caller data. On a
///   write error the caller must not assume a partial write happened.
/// - `search` returns an empty list for "no results", ordered
///   most-recent-first unless the backend ranks by relevance, honoring
///   `limit` and `offset`.
/// - `update` and `delete` return `Ok(false)` for unknown ids rather than
///   erroring.
/// - `cleanup` releases held resources and is safe to call repeatedly.
///
/// Implementations must be safe for concurrent reuse across calls.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Bring up the backend (open connections, create schema, load files).
    async fn initialize(&self) -> Result<()>;

    /// Check whether the backend is currently reachable and responsive.
    async fn health_check(&self) -> Result<bool>;

    /// Store a new record, returning its assigned id.
    async fn add(&self, project_name: &str, draft: MemoryDraft) -> Result<String>;

    /// Search records within one project.
    async fn search(&self, project_name: &str, query: &MemoryQuery) -> Result<Vec<MemoryItem>>;

    /// Fetch one record by id. `Ok(None)` when it does not exist.
    async fn get(&self, project_name: &str, memory_id: &str) -> Result<Option<MemoryItem>>;

    /// Apply a patch to a record. `Ok(false)` when the id does not exist.
    async fn update(&self, project_name: &str, memory_id: &str, patch: MemoryPatch)
        -> Result<bool>;

    /// Delete a record. `Ok(false)` when the id does not exist.
    async fn delete(&self, project_name: &str, memory_id: &str) -> Result<bool>;

    /// List a project's records, most recent first.
    async fn list_project(
        &self,
        project_name: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>>;

    /// Per-project statistics.
    async fn stats(&self, project_name: &str) -> Result<MemoryStats>;

    /// Names of projects that currently hold records.
    ///
    /// Default implementation reports none; backends that can enumerate
    /// projects cheaply should override.
    async fn list_projects(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Release held resources.
    async fn cleanup(&self) -> Result<()>;

    /// Stable backend name, used as the fallback-chain key.
    fn name(&self) -> &str;

    /// Whether search results are ranked by semantic similarity.
    fn supports_similarity_search(&self) -> bool;

    /// Capability flags for health reporting and detection.
    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            similarity_search: self.supports_similarity_search(),
            ..BackendFeatures::default()
        }
    }
}

/// Blanket implementation for Arc-wrapped stores.
///
/// The facade, detection engine and migrator all share backends behind
/// `Arc`, so delegation here keeps call sites uniform.
#[async_trait]
impl<T: MemoryStore + ?Sized> MemoryStore for Arc<T> {
    async fn initialize(&self) -> Result<()> {
        (**self).initialize().await
    }

    async fn health_check(&self) -> Result<bool> {
        (**self).health_check().await
    }

    async fn add(&self, project_name: &str, draft: MemoryDraft) -> Result<String> {
        (**self).add(project_name, draft).await
    }

    async fn search(&self, project_name: &str, query: &MemoryQuery) -> Result<Vec<MemoryItem>> {
        (**self).search(project_name, query).await
    }

    async fn get(&self, project_name: &str, memory_id: &str) -> Result<Option<MemoryItem>> {
        (**self).get(project_name, memory_id).await
    }

    async fn update(
        &self,
        project_name: &str,
        memory_id: &str,
        patch: MemoryPatch,
    ) -> Result<bool> {
        (**self).update(project_name, memory_id, patch).await
    }

    async fn delete(&self, project_name: &str, memory_id: &str) -> Result<bool> {
        (**self).delete(project_name, memory_id).await
    }

    async fn list_project(
        &self,
        project_name: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        (**self).list_project(project_name, category, limit).await
    }

    async fn stats(&self, project_name: &str) -> Result<MemoryStats> {
        (**self).stats(project_name).await
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        (**self).list_projects().await
    }

    async fn cleanup(&self) -> Result<()> {
        (**self).cleanup().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn supports_similarity_search(&self) -> bool {
        (**self).supports_similarity_search()
    }

    fn features(&self) -> BackendFeatures {
        (**self).features()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBackend;

    #[tokio::test]
    async fn test_arc_backend_delegates() {
        let backend: Arc<dyn MemoryStore> = Arc::new(InMemoryBackend::new());
        backend.initialize().await.unwrap();

        assert_eq!(backend.name(), "memory");
        assert!(backend.health_check().await.unwrap());

        let id = backend
            .add(
                "demo",
                MemoryDraft::new("delegated write", MemoryCategory::Project),
            )
            .await
            .unwrap();

        let item = backend.get("demo", &id).await.unwrap().unwrap();
        assert_eq!(item.content, "delegated write");
    }

    #[tokio::test]
    async fn test_default_features_follow_similarity_flag() {
        let backend = InMemoryBackend::new();
        let features = backend.features();
        assert_eq!(features.similarity_search, backend.supports_similarity_search());
    }

    #[tokio::test]
    async fn test_default_list_projects_is_empty() {
        struct Minimal;

        #[async_trait]
        impl MemoryStore for Minimal {
            async fn initialize(&self) -> Result<()> {
                Ok(())
            }
            async fn health_check(&self) -> Result<bool> {
                Ok(true)
            }
            async fn add(&self, _: &str, _: MemoryDraft) -> Result<String> {
                Ok("id".to_string())
            }
            async fn search(&self, _: &str, _: &MemoryQuery) -> Result<Vec<MemoryItem>> {
                Ok(Vec::new())
            }
            async fn get(&self, _: &str, _: &str) -> Result<Option<MemoryItem>> {
                Ok(None)
            }
            async fn update(&self, _: &str, _: &str, _: MemoryPatch) -> Result<bool> {
                Ok(false)
            }
            async fn delete(&self, _: &str, _: &str) -> Result<bool> {
                Ok(false)
            }
            async fn list_project(
                &self,
                _: &str,
                _: Option<MemoryCategory>,
                _: usize,
            ) -> Result<Vec<MemoryItem>> {
                Ok(Vec::new())
            }
            async fn stats(&self, _: &str) -> Result<MemoryStats> {
                Ok(MemoryStats::default())
            }
            async fn cleanup(&self) -> Result<()> {
                Ok(())
            }
            fn name(&self) -> &str {
                "minimal"
            }
            fn supports_similarity_search(&self) -> bool {
                false
            }
        }

        let projects = Minimal.list_projects().await.unwrap();
        assert!(projects.is_empty());
    }
}
