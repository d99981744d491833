use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::paths::{BackupPaths, SCHEME_BY_TYPE, classify};
use super::{RetentionReport, StorageBackend, expiring_types, soft_delete_found};
use crate::config::{AppConfig, BackupTypeConfig, DestinationConfig, LocalStorageConfig};
use crate::errors::{BackupError, Result};
use crate::metadata::{BackupRecord, MetadataStore};
use crate::metrics::{MetricEvent, Metrics};

const BACKEND: &str = "local";

fn local_destination(config: &BackupTypeConfig) -> &DestinationConfig {
    &config.local
}

#[derive(Debug)]
struct Artifact {
    path: PathBuf,
    backup_type: String,
    modified: SystemTime,
}

/// Dumps on the local filesystem under `<backup_dir>/by-server/...` and,
/// when `organize_by_type` is set, a copy under `<backup_dir>/by-type/...`.
pub struct LocalStorage {
    config: LocalStorageConfig,
    metadata: Arc<dyn MetadataStore>,
    metrics: Arc<dyn Metrics>,
}

impl LocalStorage {
    pub fn new(
        config: LocalStorageConfig,
        metadata: Arc<dyn MetadataStore>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            config,
            metadata,
            metrics,
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.backup_dir
    }

    pub fn organize_by_type(&self) -> bool {
        self.config.organize_by_type
    }

    /// Creates the parent directories of the artifact's path under `scheme`.
    pub async fn prepare(&self, paths: &BackupPaths, scheme: &str) -> Result<PathBuf> {
        let path = paths.local(self.root(), scheme);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BackupError::StorageWrite(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        Ok(path)
    }

    /// Copies the primary artifact to its by-type location.
    pub async fn copy_secondary(&self, primary: &Path, paths: &BackupPaths) -> Result<PathBuf> {
        let target = self.prepare(paths, SCHEME_BY_TYPE).await?;
        tokio::fs::copy(primary, &target).await.map_err(|e| {
            BackupError::StorageWrite(format!(
                "failed to copy {} to {}: {}",
                primary.display(),
                target.display(),
                e
            ))
        })?;
        Ok(target)
    }
}

/// First local copy of `record` that is still on disk. An unreadable path
/// counts as present.
async fn remaining_copy(record: &BackupRecord) -> Option<&str> {
    for path in record.local_paths.values() {
        if !matches!(tokio::fs::try_exists(path).await, Ok(false)) {
            return Some(path);
        }
    }
    None
}

fn scan_artifacts(root: &Path) -> Vec<Artifact> {
    if !root.exists() {
        return Vec::new();
    }
    let mut artifacts = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry during retention scan");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let Some((_, backup_type)) = classify(&relative) else {
            continue;
        };
        let modified = match entry.metadata().map(|m| m.modified()) {
            Ok(Ok(modified)) => modified,
            _ => {
                warn!(path = %entry.path().display(), "Cannot read modification time");
                continue;
            }
        };
        artifacts.push(Artifact {
            path: entry.path().to_path_buf(),
            backup_type: backup_type.to_string(),
            modified,
        });
    }
    artifacts
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn enforce_retention(&self, config: &AppConfig) -> Result<RetentionReport> {
        let mut report = RetentionReport {
            backend: BACKEND,
            ..Default::default()
        };
        let types = expiring_types(config, BACKEND, local_destination);
        if types.is_empty() {
            return Ok(report);
        }

        let root = self.root().to_path_buf();
        let artifacts = tokio::task::spawn_blocking(move || scan_artifacts(&root))
            .await
            .map_err(|e| BackupError::StorageWrite(format!("retention scan failed: {}", e)))?;

        let now = SystemTime::now();
        let mut deleted_by_type: BTreeMap<String, u64> = BTreeMap::new();
        for artifact in artifacts {
            let Some(max_age) = types.get(&artifact.backup_type) else {
                continue;
            };
            report.examined += 1;
            let max_age = max_age.to_std().unwrap_or(Duration::MAX);
            let age = now.duration_since(artifact.modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }

            let location = artifact.path.to_string_lossy().into_owned();
            if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
                report.failed += 1;
                warn!(path = %location, error = %e, "Failed to delete expired backup");
                continue;
            }
            report.deleted += 1;
            *deleted_by_type.entry(artifact.backup_type.clone()).or_default() += 1;
            info!(path = %location, backup_type = %artifact.backup_type, age_secs = age.as_secs(), "Deleted expired backup");

            let lookup = match self.metadata.find_by_local_path(&location).await {
                Ok(Some(record)) => {
                    if let Some(remaining) = remaining_copy(&record).await {
                        debug!(id = %record.id, remaining, "Backup still has a local copy, record kept");
                        continue;
                    }
                    Ok(Some(record))
                }
                other => other,
            };
            if soft_delete_found(self.metadata.as_ref(), lookup, &location).await {
                report.records_deleted += 1;
            }
        }

        for (backup_type, count) in deleted_by_type {
            self.metrics.record(MetricEvent::RetentionDeleted {
                backup_type,
                storage: BACKEND,
                count,
            });
        }
        Ok(report)
    }
}
