//! Backup destinations and their retention sweeps.

mod local;
pub mod paths;
mod s3;

pub use local::LocalStorage;
pub use paths::{BackupPaths, SCHEME_BY_SERVER, SCHEME_BY_TYPE};
pub use s3::{AwsObjectStore, ObjectInfo, ObjectStore, S3Storage, S3UploadOutcome};

#[cfg(test)]
pub(crate) use s3::MemoryObjectStore;

use async_trait::async_trait;
use chrono::Duration;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::{AppConfig, BackupTypeConfig, DestinationConfig};
use crate::errors::Result;
use crate::metadata::{BackupRecord, BackupStatus, MetadataStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub backend: &'static str,
    pub examined: u64,
    pub deleted: u64,
    /// Expired artifacts whose physical delete failed.
    pub failed: u64,
    pub records_deleted: u64,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deletes this backend's artifacts older than their type's retention
    /// duration and soft-deletes the matching records.
    async fn enforce_retention(&self, config: &AppConfig) -> Result<RetentionReport>;
}

/// Backup types enabled on a destination with a usable, finite retention.
/// Invalid durations are logged and the type is left alone.
pub(crate) fn expiring_types(
    config: &AppConfig,
    backend: &str,
    destination: fn(&BackupTypeConfig) -> &DestinationConfig,
) -> BTreeMap<String, Duration> {
    let mut types = BTreeMap::new();
    for (backup_type, type_config) in &config.backup_types {
        let dest = destination(type_config);
        if !dest.enabled {
            continue;
        }
        if dest.retention.keep_forever {
            debug!(backup_type, backend, "Retention skipped, keep_forever is set");
            continue;
        }
        if dest.retention.duration.trim().is_empty() {
            debug!(backup_type, backend, "No retention duration configured");
            continue;
        }
        match dest.retention.max_age() {
            Ok(max_age) => {
                types.insert(backup_type.clone(), max_age);
            }
            Err(e) => warn!(backup_type, backend, error = %e, "Skipping retention for backup type"),
        }
    }
    types
}

/// Soft-deletes the record found for a physically removed artifact.
/// Metadata failures are logged; the artifact is already gone.
pub(crate) async fn soft_delete_found(
    metadata: &dyn MetadataStore,
    lookup: Result<Option<BackupRecord>>,
    location: &str,
) -> bool {
    match lookup {
        Ok(Some(record)) if record.status != BackupStatus::Deleted => {
            match metadata.mark_backup_deleted(&record.id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(id = %record.id, location, error = %e, "Failed to soft-delete backup record");
                    false
                }
            }
        }
        Ok(Some(_)) => false,
        Ok(None) => {
            debug!(location, "No backup record for expired artifact");
            false
        }
        Err(e) => {
            warn!(location, error = %e, "Failed to look up backup record for expired artifact");
            false
        }
    }
}
