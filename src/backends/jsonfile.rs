//! Document-file storage backend.
//!
//! One JSON document store per deployment. Records are flat documents keyed
//! by id; the whole store is loaded into memory on initialization and
//! rewritten atomically (temp file, then rename) on every mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backends::MemoryStore;
use crate::core::{
    sort_most_recent_first, BackendFeatures, MemoryCategory, MemoryDraft, MemoryItem, MemoryPatch,
    MemoryQuery, MemoryStats,
};
use crate::error::{Result, StratumError};

/// Maximum store file size read into memory (10 MB).
///
/// A store past this limit is refused rather than silently truncated.
const MAX_STORE_SIZE: u64 = 10 * 1024 * 1024;

/// Current store file schema version.
const STORE_VERSION: u8 = 1;

/// On-disk store layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u8,
    memories: HashMap<String, MemoryItem>,
}

/// Document-file backend.
pub struct JsonFileBackend {
    path: PathBuf,
    pretty: bool,
    // None until initialize() loads the store.
    store: RwLock<Option<HashMap<String, MemoryItem>>>,
}

impl JsonFileBackend {
    /// Create a backend for the given store file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pretty: false,
            store: RwLock::new(None),
        }
    }

    /// Write the store with pretty-printed JSON (easier to diff and inspect).
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_store(path: &Path) -> Result<HashMap<String, MemoryItem>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > MAX_STORE_SIZE => Err(StratumError::initialization(
                "jsonfile",
                format!(
                    "store {} is {} bytes, over the {} byte limit",
                    path.display(),
                    meta.len(),
                    MAX_STORE_SIZE
                ),
            )),
            Ok(_) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| StratumError::storage(path, e))?;
                let file: StoreFile = serde_json::from_str(&raw).map_err(|e| {
                    StratumError::initialization(
                        "jsonfile",
                        format!("store {} is not valid JSON: {e}", path.display()),
                    )
                })?;
                Ok(file.memories)
            }
            // A missing store is an empty store; it is created on first write.
            Err(_) => Ok(HashMap::new()),
        }
    }

    async fn persist(&self, memories: &HashMap<String, MemoryItem>) -> Result<()> {
        let file = StoreFile {
            version: STORE_VERSION,
            memories: memories.clone(),
        };
        let content = if self.pretty {
            serde_json::to_string_pretty(&file)?
        } else {
            serde_json::to_string(&file)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StratumError::storage(parent, e))?;
            }
        }

        // Atomic write: temp file in the same directory, then rename.
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| StratumError::storage(&temp_path, e))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| StratumError::storage(&self.path, e))?;

        Ok(())
    }

    fn not_initialized() -> StratumError {
        StratumError::read("jsonfile", "store not initialized, call initialize() first")
    }
}

#[async_trait]
impl MemoryStore for JsonFileBackend {
    async fn initialize(&self) -> Result<()> {
        let mut guard = self.store.write().await;
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(Self::load_store(&self.path).await?);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        if self.store.read().await.is_none() {
            return Ok(false);
        }
        // The store directory must remain writable for mutations to land.
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.exists()),
            _ => Ok(true),
        }
    }

    async fn add(&self, project_name: &str, draft: MemoryDraft) -> Result<String> {
        let mut guard = self.store.write().await;
        let memories = guard.as_mut().ok_or_else(Self::not_initialized)?;

        let id = Uuid::new_v4().to_string();
        let item = MemoryItem::new(&id, project_name, draft.content, draft.category)
            .with_tags(draft.tags)
            .with_metadata(draft.metadata);
        memories.insert(id.clone(), item);

        let snapshot = memories.clone();
        drop(guard);

        // Roll the insert back if the store cannot be persisted, so a failed
        // write does not report success on the next read.
        if let Err(e) = self.persist(&snapshot).await {
            let mut guard = self.store.write().await;
            if let Some(memories) = guard.as_mut() {
                memories.remove(&id);
            }
            return Err(StratumError::write("jsonfile", e.to_string()));
        }
        Ok(id)
    }

    async fn search(&self, project_name: &str, query: &MemoryQuery) -> Result<Vec<MemoryItem>> {
        let query = query.normalized();
        let guard = self.store.read().await;
        let memories = guard.as_ref().ok_or_else(Self::not_initialized)?;

        let mut matches: Vec<MemoryItem> = memories
            .values()
            .filter(|item| item.project_name == project_name && query.matches(item))
            .cloned()
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
        let guard = self.store.read().await;
        let memories = guard.as_ref().ok_or_else(Self::not_initialized)?;
        Ok(memories
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
        let mut guard = self.store.write().await;
        let memories = guard.as_mut().ok_or_else(Self::not_initialized)?;

        let Some(item) = memories
            .get_mut(memory_id)
            .filter(|item| item.project_name == project_name)
        else {
            return Ok(false);
        };
        item.apply(&patch);

        let snapshot = memories.clone();
        drop(guard);
        self.persist(&snapshot)
            .await
            .map_err(|e| StratumError::write("jsonfile", e.to_string()))?;
        Ok(true)
    }

    async fn delete(&self, project_name: &str, memory_id: &str) -> Result<bool> {
        let mut guard = self.store.write().await;
        let memories = guard.as_mut().ok_or_else(Self::not_initialized)?;

        let exists = memories
            .get(memory_id)
            .is_some_and(|item| item.project_name == project_name);
        if !exists {
            return Ok(false);
        }
        memories.remove(memory_id);

        let snapshot = memories.clone();
        drop(guard);
        self.persist(&snapshot)
            .await
            .map_err(|e| StratumError::write("jsonfile", e.to_string()))?;
        Ok(true)
    }

    async fn list_project(
        &self,
        project_name: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let guard = self.store.read().await;
        let memories = guard.as_ref().ok_or_else(Self::not_initialized)?;

        let mut items: Vec<MemoryItem> = memories
            .values()
            .filter(|item| {
                item.project_name == project_name && category.is_none_or(|c| item.category == c)
            })
            .cloned()
            .collect();
        sort_most_recent_first(&mut items);
        items.truncate(limit);
        Ok(items)
    }

    async fn stats(&self, project_name: &str) -> Result<MemoryStats> {
        let guard = self.store.read().await;
        let memories = guard.as_ref().ok_or_else(Self::not_initialized)?;
        let items: Vec<MemoryItem> = memories
            .values()
            .filter(|item| item.project_name == project_name)
            .cloned()
            .collect();
        Ok(MemoryStats::from_items(&items))
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        let guard = self.store.read().await;
        let memories = guard.as_ref().ok_or_else(Self::not_initialized)?;
        let mut projects: Vec<String> = memories
            .values()
            .map(|item| item.project_name.clone())
            .collect();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }

    async fn cleanup(&self) -> Result<()> {
        // Drop the in-memory copy; the file stays on disk.
        *self.store.write().await = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonfile"
    }

    fn supports_similarity_search(&self) -> bool {
        false
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            similarity_search: false,
            bulk_operations: false,
            transactions: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn draft(content: &str) -> MemoryDraft {
        MemoryDraft::new(content, MemoryCategory::Team)
    }

    async fn backend_in(dir: &TempDir) -> JsonFileBackend {
        let backend = JsonFileBackend::new(dir.path().join("memories.json"));
        backend.initialize().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_initialize_missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir).await;
        assert!(backend.health_check().await.unwrap());
        assert!(backend.list_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir).await;
        backend.add("demo", draft("kept")).await.unwrap();

        // A second initialize must not clobber the loaded store.
        backend.initialize().await.unwrap();
        assert_eq!(backend.stats("demo").await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_ops_before_initialize_error() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("memories.json"));

        let err = backend.add("demo", draft("early")).await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
        assert!(!backend.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memories.json");

        let backend = JsonFileBackend::new(&path);
        backend.initialize().await.unwrap();
        let id = backend
            .add("demo", draft("durable").with_tags(vec!["disk".to_string()]))
            .await
            .unwrap();
        backend.cleanup().await.unwrap();

        let reopened = JsonFileBackend::new(&path);
        reopened.initialize().await.unwrap();
        let item = reopened.get("demo", &id).await.unwrap().unwrap();
        assert_eq!(item.content, "durable");
        assert_eq!(item.tags, vec!["disk"]);
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir).await;
        backend.add("demo", draft("x")).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_store_fails_initialize() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memories.json");
        std::fs::write(&path, "this is not json {{{").unwrap();

        let backend = JsonFileBackend::new(&path);
        let err = backend.initialize().await.unwrap_err();
        assert!(matches!(err, StratumError::Initialization { .. }));
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_return_false() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir).await;

        assert!(!backend
            .update("demo", "ghost", MemoryPatch::new().content("x"))
            .await
            .unwrap());
        assert!(!backend.delete("demo", "ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_persists_to_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memories.json");

        let backend = JsonFileBackend::new(&path);
        backend.initialize().await.unwrap();
        let id = backend.add("demo", draft("before")).await.unwrap();
        backend
            .update("demo", &id, MemoryPatch::new().content("after"))
            .await
            .unwrap();

        let reopened = JsonFileBackend::new(&path);
        reopened.initialize().await.unwrap();
        let item = reopened.get("demo", &id).await.unwrap().unwrap();
        assert_eq!(item.content, "after");
    }

    #[tokio::test]
    async fn test_search_orders_and_windows() {
        let dir = TempDir::new().unwrap();
        let backend = backend_in(&dir).await;
        for i in 0..6 {
            backend.add("demo", draft(&format!("note {i}"))).await.unwrap();
        }

        let page = backend
            .search("demo", &MemoryQuery::new("note").limit(4).offset(3))
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
    }

    #[tokio::test]
    async fn test_pretty_output_is_valid_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memories.json");

        let backend = JsonFileBackend::new(&path).with_pretty(true);
        backend.initialize().await.unwrap();
        backend.add("demo", draft("pretty")).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains('\n'));
        let parsed: StoreFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.version, STORE_VERSION);
        assert_eq!(parsed.memories.len(), 1);
    }
}
