use async_trait::async_trait;
use aws_sdk_s3 as s3;
use aws_sdk_s3::error::DisplayErrorContext;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::primitives::ByteStream;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::paths::{BackupPaths, classify, normalize_prefix};
use super::{RetentionReport, StorageBackend, expiring_types, soft_delete_found};
use crate::config::{AppConfig, BackupTypeConfig, DestinationConfig, SpacesConfig};
use crate::errors::{BackupError, Result};
use crate::metadata::{MetadataStore, S3UploadStatus};
use crate::metrics::{MetricEvent, Metrics};

const BACKEND: &str = "s3";

fn s3_destination(config: &BackupTypeConfig) -> &DestinationConfig {
    &config.s3
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// The object-storage operations backups need.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;
    /// Every object under `prefix`, following continuation tokens.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// S3-compatible storage (AWS, DigitalOcean Spaces, MinIO) via the AWS SDK.
pub struct AwsObjectStore {
    client: s3::Client,
    bucket: String,
}

impl AwsObjectStore {
    pub async fn from_config(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None,
                None,
                "Static",
            ))
            .load()
            .await;
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(spaces_config.force_path_style)
            .build();

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: spaces_config.bucket_name.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for AwsObjectStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path).await.map_err(|e| {
            BackupError::Upload(format!("cannot read {}: {}", path.display(), e))
        })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                BackupError::Upload(format!(
                    "failed to upload {} to bucket {} with key {}: {}",
                    path.display(),
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    BackupError::Upload(format!(
                        "failed to list bucket {} under '{}': {}",
                        self.bucket,
                        prefix,
                        DisplayErrorContext(&e)
                    ))
                })?;

            for object in response.contents() {
                let (Some(key), Some(modified)) = (object.key(), object.last_modified()) else {
                    continue;
                };
                let Some(last_modified) = DateTime::from_timestamp(modified.secs(), modified.subsec_nanos()) else {
                    continue;
                };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    last_modified,
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }

            if response.is_truncated() != Some(true) {
                break;
            }
            continuation = response.next_continuation_token().map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                BackupError::Upload(format!(
                    "failed to delete {} from bucket {}: {}",
                    key,
                    self.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}

/// Result of uploading one artifact under every key variant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3UploadOutcome {
    /// Scheme -> key, for the uploads that succeeded.
    pub keys: BTreeMap<String, String>,
    pub errors: Vec<String>,
}

impl S3UploadOutcome {
    /// Any failed key fails the whole upload.
    pub fn status(&self) -> S3UploadStatus {
        if self.errors.is_empty() {
            S3UploadStatus::Success
        } else {
            S3UploadStatus::Error
        }
    }

    pub fn error_message(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }
}

pub struct S3Storage {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    metadata: Arc<dyn MetadataStore>,
    metrics: Arc<dyn Metrics>,
}

impl S3Storage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        folder_prefix: Option<&str>,
        metadata: Arc<dyn MetadataStore>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            store,
            prefix: normalize_prefix(folder_prefix),
            metadata,
            metrics,
        }
    }

    pub fn key_for(&self, relative: &str) -> String {
        format!("{}{}", self.prefix, relative)
    }

    /// Uploads `file` under both key variants. Every variant is attempted
    /// even after a failure so the diagnostics cover all of them.
    pub async fn upload_all(&self, file: &Path, paths: &BackupPaths) -> S3UploadOutcome {
        let mut outcome = S3UploadOutcome::default();
        for (scheme, relative) in paths.variants() {
            let key = self.key_for(&relative);
            match self.store.put_file(&key, file).await {
                Ok(()) => {
                    debug!(key = %key, "Uploaded backup to S3");
                    outcome.keys.insert(scheme.to_string(), key);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "S3 upload failed");
                    outcome.errors.push(e.to_string());
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn enforce_retention(&self, config: &AppConfig) -> Result<RetentionReport> {
        let mut report = RetentionReport {
            backend: BACKEND,
            ..Default::default()
        };
        let types = expiring_types(config, BACKEND, s3_destination);
        if types.is_empty() {
            return Ok(report);
        }

        let objects = self.store.list(&self.prefix).await?;
        let now = Utc::now();
        let mut deleted_by_type: BTreeMap<String, u64> = BTreeMap::new();
        for object in objects {
            let Some(relative) = object.key.strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            let Some((_, backup_type)) = classify(relative) else {
                continue;
            };
            let Some(max_age) = types.get(backup_type) else {
                continue;
            };
            report.examined += 1;
            if now - object.last_modified <= *max_age {
                continue;
            }

            if let Err(e) = self.store.delete(&object.key).await {
                report.failed += 1;
                warn!(key = %object.key, error = %e, "Failed to delete expired S3 backup");
                continue;
            }
            report.deleted += 1;
            *deleted_by_type.entry(backup_type.to_string()).or_default() += 1;
            info!(key = %object.key, backup_type, "Deleted expired S3 backup");

            let lookup = self.metadata.find_by_s3_key(&object.key).await;
            if soft_delete_found(self.metadata.as_ref(), lookup, &object.key).await {
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

/// In-memory bucket with injectable per-key failures.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryObjectStore {
    objects: parking_lot::Mutex<BTreeMap<String, ObjectInfo>>,
    failing_puts: parking_lot::Mutex<std::collections::HashSet<String>>,
    failing_deletes: parking_lot::Mutex<std::collections::HashSet<String>>,
}

#[cfg(test)]
impl MemoryObjectStore {
    pub fn fail_put(&self, key_fragment: &str) {
        self.failing_puts.lock().insert(key_fragment.to_string());
    }

    pub fn fail_delete(&self, key: &str) {
        self.failing_deletes.lock().insert(key.to_string());
    }

    pub fn insert(&self, key: &str, last_modified: DateTime<Utc>) {
        self.objects.lock().insert(
            key.to_string(),
            ObjectInfo {
                key: key.to_string(),
                last_modified,
                size: 1,
            },
        );
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        if self.failing_puts.lock().iter().any(|f| key.contains(f.as_str())) {
            return Err(BackupError::Upload(format!("access denied for {}", key)));
        }
        let size = tokio::fs::metadata(path).await?.len();
        self.objects.lock().insert(
            key.to_string(),
            ObjectInfo {
                key: key.to_string(),
                last_modified: Utc::now(),
                size,
            },
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .values()
            .filter(|o| o.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.failing_deletes.lock().contains(key) {
            return Err(BackupError::Upload(format!("cannot delete {}", key)));
        }
        self.objects.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BackupStatus, FileMetadataStore};
    use crate::metrics::NoopMetrics;
    use chrono::Duration;

    async fn setup() -> (tempfile::TempDir, Arc<MemoryObjectStore>, Arc<dyn MetadataStore>, S3Storage) {
        let dir = tempfile::tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(FileMetadataStore::open(dir.path().join("metadata.json")).await.unwrap());
        let store = Arc::new(MemoryObjectStore::default());
        let storage = S3Storage::new(store.clone(), Some("prod/"), metadata.clone(), Arc::new(NoopMetrics));
        (dir, store, metadata, storage)
    }

    #[tokio::test]
    async fn test_upload_all_is_all_or_nothing() {
        let (dir, store, _metadata, storage) = setup().await;
        let file = dir.path().join("dump.sql.gz");
        std::fs::write(&file, b"data").unwrap();
        let paths = BackupPaths::new("srv1", "daily", "app_db", "2024-01-02-03-04-05");

        let ok = storage.upload_all(&file, &paths).await;
        assert_eq!(ok.status(), S3UploadStatus::Success);
        assert_eq!(
            ok.keys.get("by-server").map(String::as_str),
            Some("prod/by-server/srv1/daily/app_db-2024-01-02-03-04-05.sql.gz")
        );

        store.fail_put("by-type/");
        let partial = storage.upload_all(&file, &paths).await;
        assert_eq!(partial.status(), S3UploadStatus::Error);
        assert_eq!(partial.keys.len(), 1);
        assert!(partial.error_message().unwrap().contains("access denied"));
    }

    #[tokio::test]
    async fn test_retention_deletes_expired_objects_and_soft_deletes() {
        let (_dir, store, metadata, storage) = setup().await;
        let config = AppConfig::from_json_str(
            r#"{
                "backup_types": {
                    "daily": { "schedule": "0 2 * * *", "s3": { "enabled": true, "retention": { "duration": "24h" } } }
                },
                "s3_storage": {
                    "bucket_name": "b", "region": "r", "access_key_id": "k",
                    "secret_access_key": "s", "endpoint_url": "http://localhost:9000"
                }
            }"#,
        )
        .unwrap();

        let old_key = "prod/by-server/srv1/daily/old-2024-01-01-00-00-00.sql.gz";
        let stuck_key = "prod/by-type/daily/srv1_stuck-2024-01-01-00-00-00.sql.gz";
        let fresh_key = "prod/by-server/srv1/daily/fresh-2024-01-03-00-00-00.sql.gz";
        store.insert(old_key, Utc::now() - Duration::hours(30));
        store.insert(stuck_key, Utc::now() - Duration::hours(30));
        store.insert(fresh_key, Utc::now() - Duration::hours(2));
        store.insert("other/by-server/srv1/daily/x-2024-01-01-00-00-00.sql.gz", Utc::now() - Duration::days(9));
        store.fail_delete(stuck_key);

        let mut ids = Vec::new();
        for key in [old_key, stuck_key] {
            let record = metadata.create_backup_meta("srv1", "postgres", "db", "daily").await.unwrap();
            metadata
                .update_backup_status(&record.id, BackupStatus::Success, BTreeMap::new(), 1, None)
                .await
                .unwrap();
            metadata
                .update_s3_upload_status(
                    &record.id,
                    S3UploadStatus::Success,
                    BTreeMap::from([("by-server".to_string(), key.to_string())]),
                    None,
                )
                .await
                .unwrap();
            ids.push(record.id);
        }

        let report = storage.enforce_retention(&config).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.records_deleted, 1);

        let keys = store.keys();
        assert!(!keys.contains(&old_key.to_string()));
        assert!(keys.contains(&stuck_key.to_string()));
        assert!(keys.contains(&fresh_key.to_string()));

        assert_eq!(metadata.get_backup(&ids[0]).await.unwrap().status, BackupStatus::Deleted);
        // The physical delete failed, so the record stays live.
        assert_eq!(metadata.get_backup(&ids[1]).await.unwrap().status, BackupStatus::Success);
    }
}
