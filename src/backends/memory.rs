//! In-memory storage backend.
//!
//! Process-lifetime map keyed by record id. Nothing survives a restart.
//! This is the terminal entry of the default fallback chain and the
//! workhorse for unit tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::backends::MemoryStore;
use crate::core::{
    sort_most_recent_first, BackendFeatures, MemoryCategory, MemoryDraft, MemoryItem, MemoryPatch,
    MemoryQuery, MemoryStats,
};
use crate::error::Result;

/// In-memory backend.
///
/// Thread-safe via `RwLock<HashMap>`. Always healthy; `initialize` is a
/// no-op because there is no external resource to reach.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    items: RwLock<HashMap<String, MemoryItem>>,
}

impl InMemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held, across all projects.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the backend holds no records.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, MemoryItem>> {
        self.items.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, MemoryItem>> {
        self.items.write().unwrap_or_else(|e| e.into_inner())
    }

    fn project_items(&self, project_name: &str) -> Vec<MemoryItem> {
        self.read()
            .values()
            .filter(|item| item.project_name == project_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MemoryStore for InMemoryBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn add(&self, project_name: &str, draft: MemoryDraft) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let item = MemoryItem::new(&id, project_name, draft.content, draft.category)
            .with_tags(draft.tags)
            .with_metadata(draft.metadata);
        self.write().insert(id.clone(), item);
        Ok(id)
    }

    async fn search(&self, project_name: &str, query: &MemoryQuery) -> Result<Vec<MemoryItem>> {
        let query = query.normalized();
        let mut matches: Vec<MemoryItem> = self
            .project_items(project_name)
            .into_iter()
            .filter(|item| query.matches(item))
            .map(|mut item| {
                if !query.include_metadata {
                    item.metadata.clear();
                }
                item
            })
            .collect();
        sort_most_recent_first(&mut matches);
        Ok(query.window(matches))
    }

    async fn get(&self, project_name: &str, memory_id: &str) -> Result<Option<MemoryItem>> {
        Ok(self
            .read()
            .get(memory_id)
            .filter(|item| item.project_name == project_name)
            .cloned())
    }

    async fn update(
        &self,
        project_name: &str,
        memory_id: &str,
        patch: MemoryPatch,
    ) -> Result<bool> {
        let mut items = self.write();
        match items
            .get_mut(memory_id)
            .filter(|item| item.project_name == project_name)
        {
            Some(item) => {
                item.apply(&patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, project_name: &str, memory_id: &str) -> Result<bool> {
        let mut items = self.write();
        let exists = items
            .get(memory_id)
            .is_some_and(|item| item.project_name == project_name);
        if exists {
            items.remove(memory_id);
        }
        Ok(exists)
    }

    async fn list_project(
        &self,
        project_name: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let mut items: Vec<MemoryItem> = self
            .project_items(project_name)
            .into_iter()
            .filter(|item| category.is_none_or(|c| item.category == c))
            .collect();
        sort_most_recent_first(&mut items);
        items.truncate(limit);
        Ok(items)
    }

    async fn stats(&self, project_name: &str) -> Result<MemoryStats> {
        Ok(MemoryStats::from_items(&self.project_items(project_name)))
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        let mut projects: Vec<String> = self
            .read()
            .values()
            .map(|item| item.project_name.clone())
            .collect();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }

    async fn cleanup(&self) -> Result<()> {
        self.write().clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }

    fn supports_similarity_search(&self) -> bool {
        false
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            similarity_search: false,
            bulk_operations: true,
            transactions: false,
        }
    }
}
