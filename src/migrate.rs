//! Bulk migration between backends.
//!
//! Two phases: `plan` sizes the work from the source backend's statistics,
//! `migrate` executes it in batches after an optional backup of every
//! in-scope record. A failed backup aborts before the target is touched;
//! a failed record never aborts its batch or project.
//!
//! Re-running a plan is not idempotent: the target assigns fresh ids on
//! every `add`, so a second run duplicates records. Callers that need
//! exactly-once migration must de-duplicate by content or metadata first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::backends::MemoryStore;
use crate::core::{MemoryDraft, MemoryItem};
use crate::error::{Result, StratumError};

/// Floor for duration estimates; trivially small migrations still get a
/// minute of scheduled window.
const MIN_ESTIMATED_SECS: u64 = 60;

/// Migration tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory for backup artifacts.
    pub backup_dir: PathBuf,
    /// Whether a backup is taken before the first target write.
    pub backup_required: bool,
    /// Per-record transfer estimate used by `plan`.
    pub seconds_per_record: f64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from(".stratum/backups"),
            backup_required: true,
            seconds_per_record: 0.05,
        }
    }
}

/// Record count for one project in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCount {
    pub name: String,
    pub records: u64,
}

/// Sized migration work, produced by `plan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Source backend name.
    pub source: String,
    /// Projects in scope, with their record counts at planning time.
    pub projects: Vec<ProjectCount>,
    pub total_records: u64,
    /// Rough wall-clock estimate.
    pub estimated_duration: Duration,
    pub backup_required: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// True only when every record copied.
    pub success: bool,
    pub migrated: u64,
    pub failed: u64,
    /// One entry per failed record.
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Backup artifact, when one was taken.
    pub backup_path: Option<PathBuf>,
}

/// Progress callback: project name, records migrated for that project so
/// far, total records for that project. Invoked after every batch.
pub type ProgressFn = dyn Fn(&str, u64, u64) + Send + Sync;

/// Serialized backup artifact layout.
#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    source: String,
    created_at: DateTime<Utc>,
    projects: Vec<BackupProject>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupProject {
    name: String,
    records: Vec<MemoryItem>,
}

/// Migration engine.
pub struct Migrator {
    config: MigrationConfig,
}

impl Migrator {
    /// Create a migrator with the given tuning.
    pub fn new(config: MigrationConfig) -> Self {
        Self { config }
    }

    /// Size a migration against the source backend.
    ///
    /// When `projects` is `None` every project the source reports is in
    /// scope. Counts come from the source's per-project statistics.
    pub async fn plan(
        &self,
        source: &dyn MemoryStore,
        projects: Option<&[String]>,
    ) -> Result<MigrationPlan> {
        source.initialize().await?;

        let names: Vec<String> = match projects {
            Some(names) => names.to_vec(),
            None => source.list_projects().await?,
        };

        let mut counts = Vec::with_capacity(names.len());
        let mut total_records = 0;
        for name in names {
            let stats = source.stats(&name).await?;
            total_records += stats.total;
            counts.push(ProjectCount {
                name,
                records: stats.total,
            });
        }

        let estimated_secs =
            (total_records as f64 * self.config.seconds_per_record).ceil() as u64;
        let plan = MigrationPlan {
            source: source.name().to_string(),
            projects: counts,
            total_records,
            estimated_duration: Duration::from_secs(estimated_secs.max(MIN_ESTIMATED_SECS)),
            backup_required: self.config.backup_required,
            created_at: Utc::now(),
        };
        info!(
            "planned migration of {} records across {} projects from {}",
            plan.total_records,
            plan.projects.len(),
            plan.source
        );
        Ok(plan)
    }

    /// Execute a plan against a target backend.
    ///
    /// Records are copied per project in `batch_size` chunks. Individual
    /// record failures are collected, not fatal. `on_progress` fires
    /// after every batch with cumulative per-project counts.
    pub async fn migrate(
        &self,
        source: &dyn MemoryStore,
        target: &dyn MemoryStore,
        plan: &MigrationPlan,
        batch_size: usize,
        on_progress: Option<&ProgressFn>,
    ) -> Result<MigrationReport> {
        let batch_size = batch_size.max(1);
        let started_at = Utc::now();

        source.initialize().await?;

        // Backup comes first; nothing touches the target until the
        // in-scope records are safely on disk.
        let backup_path = if plan.backup_required {
            Some(self.backup(source, plan).await?)
        } else {
            None
        };

        target
            .initialize()
            .await
            .map_err(|e| StratumError::migration(format!("target initialization failed: {e}")))?;

        let mut migrated = 0;
        let mut failed = 0;
        let mut errors = Vec::new();

        for project in &plan.projects {
            let records = self.fetch_all(source, &project.name).await?;
            let total = records.len() as u64;
            let mut done = 0;

            for batch in records.chunks(batch_size) {
                for record in batch {
                    match target.add(&project.name, draft_from(record)).await {
                        Ok(_) => migrated += 1,
                        Err(e) => {
                            failed += 1;
                            let message =
                                format!("{}: record {}: {e}", project.name, record.id);
                            warn!("migration error: {message}");
                            errors.push(message);
                        }
                    }
                    done += 1;
                }
                if let Some(callback) = on_progress {
                    callback(&project.name, done, total);
                }
            }
        }

        let report = MigrationReport {
            success: failed == 0,
            migrated,
            failed,
            errors,
            started_at,
            finished_at: Utc::now(),
            backup_path,
        };
        info!(
            "migration finished: {} migrated, {} failed",
            report.migrated, report.failed
        );
        Ok(report)
    }

    /// Serialize every in-scope record to one timestamped artifact.
    async fn backup(&self, source: &dyn MemoryStore, plan: &MigrationPlan) -> Result<PathBuf> {
        let mut projects = Vec::with_capacity(plan.projects.len());
        for project in &plan.projects {
            let records = self
                .fetch_all(source, &project.name)
                .await
                .map_err(|e| StratumError::migration(format!("backup read failed: {e}")))?;
            projects.push(BackupProject {
                name: project.name.clone(),
                records,
            });
        }

        let backup = BackupFile {
            source: plan.source.clone(),
            created_at: Utc::now(),
            projects,
        };

        tokio::fs::create_dir_all(&self.config.backup_dir)
            .await
            .map_err(|e| StratumError::migration(format!("backup dir: {e}")))?;

        let filename = format!(
            "stratum-backup-{}.json",
            backup.created_at.format("%Y%m%d%H%M%S")
        );
        let path = self.config.backup_dir.join(filename);
        let content = serde_json::to_string_pretty(&backup)
            .map_err(|e| StratumError::migration(format!("backup serialization: {e}")))?;

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| StratumError::migration(format!("backup write: {e}")))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StratumError::migration(format!("backup rename: {e}")))?;

        info!("backed up {} projects to {}", backup.projects.len(), path.display());
        Ok(path)
    }

    /// Fetch every record of one project from the source.
    async fn fetch_all(&self, source: &dyn MemoryStore, project: &str) -> Result<Vec<MemoryItem>> {
        source.list_project(project, None, usize::MAX).await
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new(MigrationConfig::default())
    }
}

/// Turn a source record into a draft for the target.
///
/// The target assigns a fresh id; the source id and creation time ride
/// along in metadata so provenance survives the copy.
fn draft_from(record: &MemoryItem) -> MemoryDraft {
    let mut metadata = record.metadata.clone();
    metadata.insert("migrated_from".to_string(), json!(record.id));
    metadata.insert(
        "original_created_at".to_string(),
        json!(record.created_at.to_rfc3339()),
    );
    MemoryDraft::new(record.content.clone(), record.category)
        .with_tags(record.tags.clone())
        .with_metadata(metadata)
}

/// Restore helper: parse a backup artifact back into records.
pub fn read_backup(path: &Path) -> Result<Vec<(String, Vec<MemoryItem>)>> {
    let raw = std::fs::read_to_string(path).map_err(|e| StratumError::storage(path, e))?;
    let backup: BackupFile = serde_json::from_str(&raw)?;
    Ok(backup
        .projects
        .into_iter()
        .map(|p| (p.name, p.records))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBackend;
    use crate::core::MemoryCategory;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn migrator_in(dir: &TempDir) -> Migrator {
        Migrator::new(MigrationConfig {
            backup_dir: dir.path().join("backups"),
            ..MigrationConfig::default()
        })
    }

    async fn seed(source: &InMemoryBackend, project: &str, count: usize) {
        for i in 0..count {
            source
                .add(
                    project,
                    MemoryDraft::new(format!("record {i}"), MemoryCategory::Pattern)
                        .with_tags(vec!["seed".to_string()]),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_plan_counts_all_projects() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        seed(&source, "alpha", 3).await;
        seed(&source, "beta", 2).await;

        let plan = migrator_in(&dir).plan(&source, None).await.unwrap();

        assert_eq!(plan.total_records, 5);
        assert_eq!(plan.projects.len(), 2);
        assert!(plan.backup_required);
        assert_eq!(plan.source, "memory");
    }

    #[tokio::test]
    async fn test_plan_scoped_to_requested_projects() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        seed(&source, "alpha", 3).await;
        seed(&source, "beta", 2).await;

        let plan = migrator_in(&dir)
            .plan(&source, Some(&["beta".to_string()]))
            .await
            .unwrap();

        assert_eq!(plan.total_records, 2);
        assert_eq!(plan.projects[0].name, "beta");
    }

    #[tokio::test]
    async fn test_plan_estimate_is_floored() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        seed(&source, "tiny", 1).await;

        let plan = migrator_in(&dir).plan(&source, None).await.unwrap();
        assert_eq!(plan.estimated_duration, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_plan_estimate_scales_with_records() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        seed(&source, "big", 10).await;

        let migrator = Migrator::new(MigrationConfig {
            backup_dir: dir.path().join("backups"),
            seconds_per_record: 30.0,
            ..MigrationConfig::default()
        });
        let plan = migrator.plan(&source, None).await.unwrap();
        assert_eq!(plan.estimated_duration, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_migrate_copies_all_records() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        let target = InMemoryBackend::new();
        seed(&source, "alpha", 7).await;

        let migrator = migrator_in(&dir);
        let plan = migrator.plan(&source, None).await.unwrap();
        let report = migrator
            .migrate(&source, &target, &plan, 3, None)
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.migrated, 7);
        assert_eq!(report.failed, 0);
        assert_eq!(target.stats("alpha").await.unwrap().total, 7);
        assert!(report.finished_at >= report.started_at);
    }

    #[tokio::test]
    async fn test_migrated_records_carry_provenance() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        let target = InMemoryBackend::new();
        let original_id = source
            .add("alpha", MemoryDraft::new("tracked", MemoryCategory::Team))
            .await
            .unwrap();

        let migrator = migrator_in(&dir);
        let plan = migrator.plan(&source, None).await.unwrap();
        migrator.migrate(&source, &target, &plan, 100, None).await.unwrap();

        let copied = target.list_project("alpha", None, 10).await.unwrap();
        assert_eq!(copied.len(), 1);
        assert_ne!(copied[0].id, original_id);
        assert_eq!(copied[0].metadata["migrated_from"], json!(original_id));
    }

    #[tokio::test]
    async fn test_progress_callback_cumulative_counts() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        let target = InMemoryBackend::new();
        seed(&source, "p", 250).await;

        let migrator = migrator_in(&dir);
        let plan = migrator.plan(&source, None).await.unwrap();

        let calls: Arc<Mutex<Vec<(String, u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let calls_cb = Arc::clone(&calls);
        let progress = move |project: &str, done: u64, total: u64| {
            calls_cb.lock().unwrap().push((project.to_string(), done, total));
        };

        migrator
            .migrate(&source, &target, &plan, 100, Some(&progress))
            .await
            .unwrap();

        drop(progress);
        let calls = Arc::try_unwrap(calls).unwrap().into_inner().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], ("p".to_string(), 100, 250));
        assert_eq!(calls[1], ("p".to_string(), 200, 250));
        assert_eq!(calls[2], ("p".to_string(), 250, 250));
    }

    #[tokio::test]
    async fn test_backup_artifact_written_and_readable() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        let target = InMemoryBackend::new();
        seed(&source, "alpha", 4).await;

        let migrator = migrator_in(&dir);
        let plan = migrator.plan(&source, None).await.unwrap();
        let report = migrator
            .migrate(&source, &target, &plan, 100, None)
            .await
            .unwrap();

        let path = report.backup_path.unwrap();
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("stratum-backup-"));

        let restored = read_backup(&path).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].0, "alpha");
        assert_eq!(restored[0].1.len(), 4);
    }

    #[tokio::test]
    async fn test_backup_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        let target = InMemoryBackend::new();
        seed(&source, "alpha", 1).await;

        let migrator = Migrator::new(MigrationConfig {
            backup_dir: dir.path().join("backups"),
            backup_required: false,
            ..MigrationConfig::default()
        });
        let plan = migrator.plan(&source, None).await.unwrap();
        assert!(!plan.backup_required);

        let report = migrator
            .migrate(&source, &target, &plan, 100, None)
            .await
            .unwrap();
        assert!(report.backup_path.is_none());
        assert!(!dir.path().join("backups").exists());
    }

    /// Target that refuses every write.
    struct RejectingTarget {
        inner: InMemoryBackend,
        rejected: AtomicU64,
    }

    #[async_trait::async_trait]
    impl MemoryStore for RejectingTarget {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
        async fn add(&self, _: &str, _: MemoryDraft) -> Result<String> {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            Err(StratumError::write("rejecting", "disk full"))
        }
        async fn search(
            &self,
            p: &str,
            q: &crate::core::MemoryQuery,
        ) -> Result<Vec<MemoryItem>> {
            self.inner.search(p, q).await
        }
        async fn get(&self, p: &str, id: &str) -> Result<Option<MemoryItem>> {
            self.inner.get(p, id).await
        }
        async fn update(
            &self,
            p: &str,
            id: &str,
            patch: crate::core::MemoryPatch,
        ) -> Result<bool> {
            self.inner.update(p, id, patch).await
        }
        async fn delete(&self, p: &str, id: &str) -> Result<bool> {
            self.inner.delete(p, id).await
        }
        async fn list_project(
            &self,
            p: &str,
            c: Option<MemoryCategory>,
            l: usize,
        ) -> Result<Vec<MemoryItem>> {
            self.inner.list_project(p, c, l).await
        }
        async fn stats(&self, p: &str) -> Result<crate::core::MemoryStats> {
            self.inner.stats(p).await
        }
        async fn cleanup(&self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "rejecting"
        }
        fn supports_similarity_search(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_record_failures_do_not_abort_migration() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        seed(&source, "alpha", 5).await;
        let target = RejectingTarget {
            inner: InMemoryBackend::new(),
            rejected: AtomicU64::new(0),
        };

        let migrator = migrator_in(&dir);
        let plan = migrator.plan(&source, None).await.unwrap();
        let report = migrator
            .migrate(&source, &target, &plan, 2, None)
            .await
            .unwrap();

        // Every record was attempted despite each one failing.
        assert_eq!(target.rejected.load(Ordering::SeqCst), 5);
        assert!(!report.success);
        assert_eq!(report.failed, 5);
        assert_eq!(report.migrated, 0);
        assert_eq!(report.errors.len(), 5);
    }

    #[tokio::test]
    async fn test_backup_failure_aborts_before_target_writes() {
        let source = InMemoryBackend::new();
        seed(&source, "alpha", 2).await;
        let target = InMemoryBackend::new();

        // An unwritable backup directory path (a file stands in the way).
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "not a directory").unwrap();

        let migrator = Migrator::new(MigrationConfig {
            backup_dir: blocker.join("backups"),
            ..MigrationConfig::default()
        });
        let plan = migrator.plan(&source, None).await.unwrap();
        let err = migrator
            .migrate(&source, &target, &plan, 100, None)
            .await
            .unwrap_err();

        assert!(matches!(err, StratumError::Migration { .. }));
        assert_eq!(target.stats("alpha").await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_rerun_duplicates_records() {
        // Running the same plan twice doubles the target: ids are freshly
        // assigned on add and nothing de-duplicates. This is the current
        // contract, callers own de-duplication.
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        let target = InMemoryBackend::new();
        seed(&source, "alpha", 6).await;

        let migrator = migrator_in(&dir);
        let plan = migrator.plan(&source, None).await.unwrap();

        migrator.migrate(&source, &target, &plan, 4, None).await.unwrap();
        assert_eq!(target.stats("alpha").await.unwrap().total, 6);

        migrator.migrate(&source, &target, &plan, 4, None).await.unwrap();
        assert_eq!(target.stats("alpha").await.unwrap().total, 12);
    }

    #[tokio::test]
    async fn test_plan_serializes() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryBackend::new();
        seed(&source, "alpha", 1).await;

        let plan = migrator_in(&dir).plan(&source, None).await.unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: MigrationPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, parsed);
    }
}
