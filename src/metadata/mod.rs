//! Backup lifecycle records and the stores that persist them.
//!
//! Two interchangeable backends implement [`MetadataStore`]: a single JSON
//! document ([`FileMetadataStore`]) and a SQLite database
//! ([`SqlMetadataStore`]). Both produce identical [`BackupStats`] for the same
//! records.

mod file;
mod sql;

pub use file::{FileMetadataStore, METADATA_SCHEMA_VERSION};
pub use sql::SqlMetadataStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::config::{MetadataConfig, RetentionPolicy};
use crate::errors::{BackupError, Result};

/// Soft-deleted records are physically removed after this long.
pub const DELETED_RECORD_GRACE_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Success,
    Error,
    Deleted,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Success => "success",
            BackupStatus::Error => "error",
            BackupStatus::Deleted => "deleted",
        }
    }

    /// Pending -> Success|Error -> Deleted. Deleted -> Deleted is a no-op.
    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        use BackupStatus::*;
        matches!(
            (*self, next),
            (Pending, Success) | (Pending, Error) | (Pending | Success | Error, Deleted) | (Deleted, Deleted)
        )
    }

    /// The only moves an attempt itself may make: Pending -> Success|Error.
    pub fn can_complete_to(&self, next: BackupStatus) -> bool {
        *self == BackupStatus::Pending && matches!(next, BackupStatus::Success | BackupStatus::Error)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "success" => Ok(BackupStatus::Success),
            "error" => Ok(BackupStatus::Error),
            "deleted" => Ok(BackupStatus::Deleted),
            other => Err(BackupError::Metadata(format!("unknown backup status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum S3UploadStatus {
    Pending,
    Success,
    Error,
}

impl S3UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            S3UploadStatus::Pending => "pending",
            S3UploadStatus::Success => "success",
            S3UploadStatus::Error => "error",
        }
    }
}

impl fmt::Display for S3UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for S3UploadStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(S3UploadStatus::Pending),
            "success" => Ok(S3UploadStatus::Success),
            "error" => Ok(S3UploadStatus::Error),
            other => Err(BackupError::Metadata(format!(
                "unknown S3 upload status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub server_name: String,
    pub database_engine: String,
    pub database_name: String,
    pub backup_type: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    pub status: BackupStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub size: u64,
    /// Organization scheme (`by-server`, `by-type`) -> local path.
    #[serde(default)]
    pub local_paths: BTreeMap<String, String>,
    /// Organization scheme -> object key.
    #[serde(default)]
    pub s3_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub s3_upload_status: Option<S3UploadStatus>,
    #[serde(default)]
    pub s3_error_message: Option<String>,
    #[serde(default)]
    pub log_file_path: Option<String>,
}

impl BackupRecord {
    pub fn new_pending(server: &str, engine: &str, database: &str, backup_type: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            server_name: server.to_string(),
            database_engine: engine.to_string(),
            database_name: database.to_string(),
            backup_type: backup_type.to_string(),
            created_at: now(),
            completed_at: None,
            deleted_at: None,
            status: BackupStatus::Pending,
            error_message: None,
            size: 0,
            local_paths: BTreeMap::new(),
            s3_keys: BTreeMap::new(),
            s3_upload_status: None,
            s3_error_message: None,
            log_file_path: None,
        }
    }

    /// Applies a status change in memory, enforcing the lifecycle order.
    pub fn apply_status(
        &mut self,
        status: BackupStatus,
        local_paths: BTreeMap<String, String>,
        size: u64,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        ensure_completion(&self.id, self.status, status)?;
        self.status = status;
        self.local_paths = local_paths;
        self.size = size;
        self.error_message = error_message;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn apply_s3_status(
        &mut self,
        status: S3UploadStatus,
        s3_keys: BTreeMap<String, String>,
        error_message: Option<String>,
    ) -> Result<()> {
        ensure_s3_allowed(&self.id, self.status)?;
        self.s3_upload_status = Some(status);
        self.s3_keys = s3_keys;
        self.s3_error_message = error_message;
        Ok(())
    }

    pub fn mark_deleted(&mut self, at: DateTime<Utc>) {
        if self.status != BackupStatus::Deleted {
            self.status = BackupStatus::Deleted;
            self.deleted_at = Some(at);
        }
    }

    /// When this record became eligible for purge, if it is deleted.
    pub fn deleted_since(&self) -> Option<DateTime<Utc>> {
        if self.status != BackupStatus::Deleted {
            return None;
        }
        Some(
            self.deleted_at
                .or(self.completed_at)
                .unwrap_or(self.created_at),
        )
    }
}

pub(crate) fn ensure_transition(id: &str, from: BackupStatus, to: BackupStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BackupError::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

pub(crate) fn ensure_completion(id: &str, from: BackupStatus, to: BackupStatus) -> Result<()> {
    if from.can_complete_to(to) {
        Ok(())
    } else {
        Err(BackupError::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

pub(crate) fn ensure_s3_allowed(id: &str, status: BackupStatus) -> Result<()> {
    if status == BackupStatus::Success {
        Ok(())
    } else {
        Err(BackupError::InvalidTransition {
            id: id.to_string(),
            from: status.to_string(),
            to: "s3 upload".to_string(),
        })
    }
}

/// Current time truncated to microseconds, the precision both backends keep.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupFilter {
    pub server: Option<String>,
    pub database: Option<String>,
    pub backup_type: Option<String>,
    /// Only Status=Success records when set; otherwise every stored record.
    pub active_only: bool,
}

impl BackupFilter {
    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.server.as_ref().is_none_or(|s| &record.server_name == s)
            && self.database.as_ref().is_none_or(|d| &record.database_name == d)
            && self.backup_type.as_ref().is_none_or(|t| &record.backup_type == t)
            && (!self.active_only || record.status == BackupStatus::Success)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    CreatedAt,
    Size,
    DatabaseName,
    ServerName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupQuery {
    pub filter: BackupFilter,
    pub status: Option<BackupStatus>,
    pub sort_by: SortField,
    pub descending: bool,
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
}

impl Default for BackupQuery {
    fn default() -> Self {
        Self {
            filter: BackupFilter::default(),
            status: None,
            sort_by: SortField::CreatedAt,
            descending: true,
            page: 1,
            page_size: 50,
        }
    }
}

impl BackupQuery {
    pub(crate) fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupPage {
    pub records: Vec<BackupRecord>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    pub total: u64,
    pub pending: u64,
    pub success: u64,
    pub error: u64,
    pub deleted: u64,
    /// Non-deleted records per backup type.
    pub by_type: BTreeMap<String, u64>,
    /// Non-deleted records per server.
    pub by_server: BTreeMap<String, u64>,
    /// Non-deleted records created in the last 24 hours.
    pub last_24h: u64,
    /// Non-deleted records created in the last 7 days.
    pub last_7d: u64,
    pub total_local_size: u64,
    pub total_s3_size: u64,
    pub last_successful_backup: Option<DateTime<Utc>>,
}

/// Sums over Status=Success and S3UploadStatus=Success (non-deleted) records.
pub fn aggregate_sizes<'a, I>(records: I) -> (u64, u64)
where
    I: IntoIterator<Item = &'a BackupRecord>,
{
    records.into_iter().fold((0, 0), |(local, s3), r| {
        let local = if r.status == BackupStatus::Success {
            local + r.size
        } else {
            local
        };
        let s3 = if r.status != BackupStatus::Deleted
            && r.s3_upload_status == Some(S3UploadStatus::Success)
        {
            s3 + r.size
        } else {
            s3
        };
        (local, s3)
    })
}

impl BackupStats {
    pub fn from_records(records: &[BackupRecord], now: DateTime<Utc>) -> Self {
        let mut stats = BackupStats {
            total: records.len() as u64,
            ..Default::default()
        };
        let day_ago = now - Duration::hours(24);
        let week_ago = now - Duration::days(7);

        for record in records {
            match record.status {
                BackupStatus::Pending => stats.pending += 1,
                BackupStatus::Success => stats.success += 1,
                BackupStatus::Error => stats.error += 1,
                BackupStatus::Deleted => stats.deleted += 1,
            }
            if record.status == BackupStatus::Deleted {
                continue;
            }
            *stats.by_type.entry(record.backup_type.clone()).or_default() += 1;
            *stats.by_server.entry(record.server_name.clone()).or_default() += 1;
            if record.created_at >= day_ago {
                stats.last_24h += 1;
            }
            if record.created_at >= week_ago {
                stats.last_7d += 1;
            }
            if record.status == BackupStatus::Success {
                stats.last_successful_backup = stats.last_successful_backup.max(record.completed_at);
            }
        }

        let (local, s3) = aggregate_sizes(records);
        stats.total_local_size = local;
        stats.total_s3_size = s3;
        stats
    }
}

/// Schedule row kept by the relational backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSchedule {
    pub id: i64,
    pub name: String,
    pub backup_type: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub local_retention: RetentionPolicy,
    pub s3_retention: RetentionPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn create_backup_meta(
        &self,
        server: &str,
        engine: &str,
        database: &str,
        backup_type: &str,
    ) -> Result<BackupRecord>;

    async fn update_backup_status(
        &self,
        id: &str,
        status: BackupStatus,
        local_paths: BTreeMap<String, String>,
        size: u64,
        error_message: Option<String>,
    ) -> Result<()>;

    async fn update_s3_upload_status(
        &self,
        id: &str,
        status: S3UploadStatus,
        s3_keys: BTreeMap<String, String>,
        error_message: Option<String>,
    ) -> Result<()>;

    async fn set_log_file_path(&self, id: &str, path: &str) -> Result<()>;

    async fn mark_backup_deleted(&self, id: &str) -> Result<()>;

    /// Physically removes records deleted longer than `older_than` ago.
    async fn purge_deleted_backups(&self, older_than: Duration) -> Result<u64>;

    async fn get_backup(&self, id: &str) -> Result<BackupRecord>;

    async fn get_backups_filtered(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>>;

    async fn query_backups(&self, query: &BackupQuery) -> Result<BackupPage>;

    async fn find_by_local_path(&self, path: &str) -> Result<Option<BackupRecord>>;

    async fn find_by_s3_key(&self, key: &str) -> Result<Option<BackupRecord>>;

    /// Moves every listed record to `status`; all-or-nothing.
    async fn bulk_update_status(&self, ids: &[String], status: BackupStatus) -> Result<u64>;

    async fn get_stats(&self) -> Result<BackupStats>;
}

/// A metadata store opened at startup, plus the schedules it holds.
pub struct OpenedMetadata {
    pub store: Arc<dyn MetadataStore>,
    /// Stored schedules; always empty for the file backend.
    pub schedules: Vec<BackupSchedule>,
}

/// Opens the backend named by the configuration. Schedules are read through
/// the same connection pool the store keeps using. A failure to read them is
/// logged and leaves the list empty.
pub async fn open_metadata_store(config: &MetadataConfig) -> Result<OpenedMetadata> {
    match config {
        MetadataConfig::File { path } => Ok(OpenedMetadata {
            store: Arc::new(FileMetadataStore::open(path).await?),
            schedules: Vec::new(),
        }),
        MetadataConfig::Sqlite { database_url } => {
            let store = SqlMetadataStore::connect(database_url).await?;
            let schedules = store.list_schedules().await.unwrap_or_else(|e| {
                warn!(error = %e, "Could not load stored schedules, using config.json only");
                Vec::new()
            });
            Ok(OpenedMetadata {
                store: Arc::new(store),
                schedules,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: BackupStatus, size: u64, s3: Option<S3UploadStatus>) -> BackupRecord {
        let mut r = BackupRecord::new_pending("srv1", "postgres", "app_db", "daily");
        r.status = status;
        r.size = size;
        r.s3_upload_status = s3;
        r
    }

    async fn sample_schedule(url: &str) {
        let store = SqlMetadataStore::connect(url).await.unwrap();
        store
            .create_schedule(&BackupSchedule {
                id: 0,
                name: "nightly".to_string(),
                backup_type: "daily".to_string(),
                cron_expression: "0 2 * * *".to_string(),
                enabled: true,
                local_retention: RetentionPolicy {
                    duration: "7d".to_string(),
                    keep_forever: false,
                },
                s3_retention: RetentionPolicy::default(),
                created_at: now(),
                updated_at: now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_sqlite_store_returns_its_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("metadata.db").display());
        sample_schedule(&url).await;

        let opened = open_metadata_store(&MetadataConfig::Sqlite { database_url: url })
            .await
            .unwrap();
        assert_eq!(opened.store.backend_name(), "sqlite");
        assert_eq!(opened.schedules.len(), 1);
        assert_eq!(opened.schedules[0].backup_type, "daily");

        let file = open_metadata_store(&MetadataConfig::File {
            path: dir.path().join("metadata.json"),
        })
        .await
        .unwrap();
        assert_eq!(file.store.backend_name(), "file");
        assert!(file.schedules.is_empty());
    }

    #[tokio::test]
    async fn test_open_in_memory_store_is_usable() {
        let opened = open_metadata_store(&MetadataConfig::Sqlite {
            database_url: "sqlite::memory:".to_string(),
        })
        .await
        .unwrap();
        assert!(opened.schedules.is_empty());
        let record = opened
            .store
            .create_backup_meta("srv1", "postgres", "app_db", "daily")
            .await
            .unwrap();
        assert_eq!(opened.store.get_backup(&record.id).await.unwrap().id, record.id);
    }

    #[test]
    fn test_status_transitions() {
        use BackupStatus::*;
        assert!(Pending.can_transition_to(Success));
        assert!(Pending.can_transition_to(Error));
        assert!(Success.can_transition_to(Deleted));
        assert!(Error.can_transition_to(Deleted));
        assert!(!Success.can_transition_to(Error));
        assert!(!Error.can_transition_to(Success));
        assert!(!Deleted.can_transition_to(Success));
        assert!(!Success.can_transition_to(Pending));

        assert!(Pending.can_complete_to(Success));
        assert!(Pending.can_complete_to(Error));
        assert!(!Pending.can_complete_to(Deleted));
        assert!(!Success.can_complete_to(Deleted));
        assert!(!Pending.can_complete_to(Pending));
    }

    #[test]
    fn test_apply_status_rejects_second_terminal_update() {
        let mut r = BackupRecord::new_pending("srv1", "postgres", "app_db", "daily");
        r.apply_status(BackupStatus::Success, BTreeMap::new(), 10, None, now())
            .unwrap();
        let err = r
            .apply_status(BackupStatus::Error, BTreeMap::new(), 0, None, now())
            .unwrap_err();
        assert!(matches!(err, BackupError::InvalidTransition { .. }));
        assert_eq!(r.status, BackupStatus::Success);
        assert_eq!(r.size, 10);
    }

    #[test]
    fn test_apply_status_never_deletes() {
        let mut r = BackupRecord::new_pending("srv1", "postgres", "app_db", "daily");
        let err = r
            .apply_status(BackupStatus::Deleted, BTreeMap::new(), 0, None, now())
            .unwrap_err();
        assert!(matches!(err, BackupError::InvalidTransition { .. }));
        assert_eq!(r.status, BackupStatus::Pending);
        assert_eq!(r.deleted_at, None);
    }

    #[test]
    fn test_s3_status_requires_success() {
        let mut r = BackupRecord::new_pending("srv1", "postgres", "app_db", "daily");
        assert!(r
            .apply_s3_status(S3UploadStatus::Success, BTreeMap::new(), None)
            .is_err());
    }

    #[test]
    fn test_aggregate_sizes() {
        let records = vec![
            record(BackupStatus::Success, 100, Some(S3UploadStatus::Success)),
            record(BackupStatus::Success, 50, Some(S3UploadStatus::Error)),
            record(BackupStatus::Error, 7, None),
            record(BackupStatus::Deleted, 1000, Some(S3UploadStatus::Success)),
        ];
        assert_eq!(aggregate_sizes(&records), (150, 100));
    }

    #[test]
    fn test_stats_from_records() {
        let mut old = record(BackupStatus::Success, 5, None);
        old.created_at = now() - Duration::days(3);
        old.completed_at = Some(old.created_at);
        let mut fresh = record(BackupStatus::Success, 6, None);
        fresh.completed_at = Some(now());
        let mut other = record(BackupStatus::Error, 0, None);
        other.server_name = "srv2".to_string();
        other.backup_type = "weekly".to_string();
        let deleted = record(BackupStatus::Deleted, 9, None);

        let records = vec![old, fresh.clone(), other, deleted];
        let stats = BackupStats::from_records(&records, now());

        assert_eq!(stats.total, 4);
        assert_eq!((stats.success, stats.error, stats.deleted, stats.pending), (2, 1, 1, 0));
        assert_eq!(stats.by_type.get("daily"), Some(&2));
        assert_eq!(stats.by_type.get("weekly"), Some(&1));
        assert_eq!(stats.by_server.get("srv2"), Some(&1));
        assert_eq!(stats.last_24h, 2);
        assert_eq!(stats.last_7d, 3);
        assert_eq!(stats.total_local_size, 11);
        assert_eq!(stats.last_successful_backup, fresh.completed_at);
    }
}
