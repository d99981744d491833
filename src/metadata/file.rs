// db-backup-manager/src/metadata/file.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    BackupFilter, BackupPage, BackupQuery, BackupRecord, BackupStats, BackupStatus,
    MetadataStore, S3UploadStatus, SortField, aggregate_sizes, ensure_transition, now,
};
use crate::errors::{BackupError, Result};

pub const METADATA_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataDocument {
    version: u32,
    last_updated: DateTime<Utc>,
    backups: Vec<BackupRecord>,
    total_local_size: u64,
    total_s3_size: u64,
}

impl MetadataDocument {
    fn empty() -> Self {
        Self {
            version: METADATA_SCHEMA_VERSION,
            last_updated: now(),
            backups: Vec::new(),
            total_local_size: 0,
            total_s3_size: 0,
        }
    }

    fn refresh_aggregates(&mut self) {
        let (local, s3) = aggregate_sizes(&self.backups);
        self.total_local_size = local;
        self.total_s3_size = s3;
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut BackupRecord> {
        self.backups
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }
}

/// Metadata kept in one JSON document that is rewritten whole on every change.
///
/// Each save first copies the previous document to `<file>.bak`; that copy is
/// the manual recovery path if the main file is ever found corrupted.
pub struct FileMetadataStore {
    path: PathBuf,
    state: RwLock<MetadataDocument>,
}

impl FileMetadataStore {
    /// Opens the document at `path`, creating an empty one if it does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if tokio::fs::try_exists(&path).await? {
            return Self::load(&path).await;
        }

        info!(path = %path.display(), "Creating new metadata file");
        let store = Self {
            path,
            state: RwLock::new(MetadataDocument::empty()),
        };
        store.save().await?;
        Ok(store)
    }

    /// Loads an existing document. An empty, truncated or malformed file is an
    /// error; the store is never silently reset.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            BackupError::Metadata(format!(
                "Failed to read metadata file {}: {}",
                path.display(),
                e
            ))
        })?;
        let document = parse_document(&path, &bytes)?;
        info!(
            path = %path.display(),
            records = document.backups.len(),
            "Loaded metadata file"
        );
        Ok(Self {
            path,
            state: RwLock::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_copy_path(&self) -> PathBuf {
        sidecar_path(&self.path)
    }

    /// Writes the current in-memory document to disk.
    pub async fn save(&self) -> Result<()> {
        let document = self.state.read().await;
        write_document(&self.path, &document).await
    }

    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut MetadataDocument) -> Result<T>,
    {
        let mut guard = self.state.write().await;
        // Work on a copy so a failed write leaves memory matching disk.
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.refresh_aggregates();
        next.last_updated = now();
        write_document(&self.path, &next).await?;
        *guard = next;
        Ok(out)
    }

    async fn find_by<P>(&self, predicate: P) -> Option<BackupRecord>
    where
        P: Fn(&BackupRecord) -> bool,
    {
        let state = self.state.read().await;
        state.backups.iter().find(|r| predicate(r)).cloned()
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

fn parse_document(path: &Path, bytes: &[u8]) -> Result<MetadataDocument> {
    let recovery_hint = format!(
        "restore it from {} or move it aside to start a new store",
        sidecar_path(path).display()
    );

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(BackupError::Metadata(format!(
            "Metadata file {} is empty; {}",
            path.display(),
            recovery_hint
        )));
    }

    let mut document: MetadataDocument = serde_json::from_slice(bytes).map_err(|e| {
        BackupError::Metadata(format!(
            "Metadata file {} is corrupted ({}); {}",
            path.display(),
            e,
            recovery_hint
        ))
    })?;

    if document.version != METADATA_SCHEMA_VERSION {
        return Err(BackupError::Metadata(format!(
            "Metadata file {} has unsupported schema version {} (expected {})",
            path.display(),
            document.version,
            METADATA_SCHEMA_VERSION
        )));
    }

    let (stored_local, stored_s3) = (document.total_local_size, document.total_s3_size);
    document.refresh_aggregates();
    if stored_local != document.total_local_size || stored_s3 != document.total_s3_size {
        warn!(
            path = %path.display(),
            stored_local,
            stored_s3,
            local = document.total_local_size,
            s3 = document.total_s3_size,
            "Stored aggregate totals did not match records; using recomputed values"
        );
    }
    Ok(document)
}

async fn write_document(path: &Path, document: &MetadataDocument) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(document)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
        .await
        .map_err(|e| BackupError::Metadata(format!("metadata writer task failed: {}", e)))?
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    if path.exists() {
        if let Err(e) = std::fs::copy(path, sidecar_path(path)) {
            warn!(path = %path.display(), "Failed to refresh metadata backup copy: {}", e);
        }
    }

    temp.persist(path).map_err(|e| {
        BackupError::Metadata(format!(
            "Failed to replace metadata file {}: {}",
            path.display(),
            e.error
        ))
    })?;
    debug!(path = %path.display(), bytes = bytes.len(), "Metadata file written");
    Ok(())
}

pub(crate) fn sort_records(records: &mut [BackupRecord], sort_by: SortField, descending: bool) {
    records.sort_by(|a, b| {
        let ordering = match sort_by {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::Size => a.size.cmp(&b.size),
            SortField::DatabaseName => a.database_name.cmp(&b.database_name),
            SortField::ServerName => a.server_name.cmp(&b.server_name),
        }
        .then_with(|| a.id.cmp(&b.id));
        if descending { ordering.reverse() } else { ordering }
    });
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn create_backup_meta(
        &self,
        server: &str,
        engine: &str,
        database: &str,
        backup_type: &str,
    ) -> Result<BackupRecord> {
        let record = BackupRecord::new_pending(server, engine, database, backup_type);
        let created = record.clone();
        self.mutate(move |doc| {
            doc.backups.push(record);
            Ok(())
        })
        .await?;
        debug!(id = %created.id, server, database, backup_type, "Created backup record");
        Ok(created)
    }

    async fn update_backup_status(
        &self,
        id: &str,
        status: BackupStatus,
        local_paths: BTreeMap<String, String>,
        size: u64,
        error_message: Option<String>,
    ) -> Result<()> {
        self.mutate(|doc| {
            doc.find_mut(id)?
                .apply_status(status, local_paths, size, error_message, now())
        })
        .await
    }

    async fn update_s3_upload_status(
        &self,
        id: &str,
        status: S3UploadStatus,
        s3_keys: BTreeMap<String, String>,
        error_message: Option<String>,
    ) -> Result<()> {
        self.mutate(|doc| doc.find_mut(id)?.apply_s3_status(status, s3_keys, error_message))
            .await
    }

    async fn set_log_file_path(&self, id: &str, path: &str) -> Result<()> {
        self.mutate(|doc| {
            doc.find_mut(id)?.log_file_path = Some(path.to_string());
            Ok(())
        })
        .await
    }

    async fn mark_backup_deleted(&self, id: &str) -> Result<()> {
        self.mutate(|doc| {
            doc.find_mut(id)?.mark_deleted(now());
            Ok(())
        })
        .await
    }

    async fn purge_deleted_backups(&self, older_than: Duration) -> Result<u64> {
        let cutoff = now() - older_than;
        {
            let state = self.state.read().await;
            let any = state
                .backups
                .iter()
                .any(|r| r.deleted_since().is_some_and(|at| at <= cutoff));
            if !any {
                return Ok(0);
            }
        }
        let removed = self
            .mutate(|doc| {
                let before = doc.backups.len();
                doc.backups
                    .retain(|r| !r.deleted_since().is_some_and(|at| at <= cutoff));
                Ok((before - doc.backups.len()) as u64)
            })
            .await?;
        info!(removed, "Purged soft-deleted backup records");
        Ok(removed)
    }

    async fn get_backup(&self, id: &str) -> Result<BackupRecord> {
        self.find_by(|r| r.id == id)
            .await
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }

    async fn get_backups_filtered(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<BackupRecord> = state
            .backups
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_records(&mut records, SortField::CreatedAt, true);
        Ok(records)
    }

    async fn query_backups(&self, query: &BackupQuery) -> Result<BackupPage> {
        let state = self.state.read().await;
        let mut records: Vec<BackupRecord> = state
            .backups
            .iter()
            .filter(|r| query.filter.matches(r))
            .filter(|r| query.status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        drop(state);

        sort_records(&mut records, query.sort_by, query.descending);
        let total = records.len() as u64;
        let records = records
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.page_size as usize)
            .collect();

        Ok(BackupPage {
            records,
            total,
            page: query.page.max(1),
            page_size: query.page_size,
        })
    }

    async fn find_by_local_path(&self, path: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .find_by(|r| r.local_paths.values().any(|p| p == path))
            .await)
    }

    async fn find_by_s3_key(&self, key: &str) -> Result<Option<BackupRecord>> {
        Ok(self.find_by(|r| r.s3_keys.values().any(|k| k == key)).await)
    }

    async fn bulk_update_status(&self, ids: &[String], status: BackupStatus) -> Result<u64> {
        self.mutate(|doc| {
            let at = now();
            // Validate everything first so a bad id changes nothing.
            for id in ids {
                let record = doc.find_mut(id)?;
                ensure_transition(id, record.status, status)?;
            }
            for id in ids {
                let record = doc.find_mut(id)?;
                if status == BackupStatus::Deleted {
                    record.mark_deleted(at);
                } else {
                    record.status = status;
                    record.completed_at = Some(at);
                }
            }
            Ok(ids.len() as u64)
        })
        .await
    }

    async fn get_stats(&self) -> Result<BackupStats> {
        let state = self.state.read().await;
        Ok(BackupStats::from_records(&state.backups, now()))
    }
}
