use chrono::{Duration, Local};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::run_log::RunLog;
use crate::config::{AppConfig, ConfigHandle, DatabaseServer};
use crate::errors::{BackupError, Result};
use crate::metadata::{BackupStatus, DELETED_RECORD_GRACE_DAYS, MetadataStore, S3UploadStatus};
use crate::metrics::{MetricEvent, Metrics};
use crate::provider::{DumpOptions, Provider, ProviderFactory};
use crate::storage::{
    BackupPaths, LocalStorage, RetentionReport, S3Storage, SCHEME_BY_SERVER, SCHEME_BY_TYPE,
    StorageBackend,
};

/// Restricts a backup run. Empty lists mean "everything configured".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupTarget {
    pub servers: Vec<String>,
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupRunSummary {
    pub backup_type: String,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Servers that resolved to no databases.
    pub skipped_servers: Vec<String>,
    /// Servers that could not be processed at all.
    pub failed_servers: Vec<String>,
    pub record_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub purged_records: u64,
    pub reports: Vec<RetentionReport>,
}

/// Which destinations one run writes to.
#[derive(Debug, Clone, Copy)]
struct Destinations {
    local: bool,
    s3: bool,
}

/// Where the dump is written before anything else happens to it.
enum PrimaryArtifact {
    Local(PathBuf),
    Temporary(NamedTempFile),
}

impl PrimaryArtifact {
    fn path(&self) -> &Path {
        match self {
            PrimaryArtifact::Local(path) => path,
            PrimaryArtifact::Temporary(file) => file.path(),
        }
    }

    /// Removes a partially written local dump.
    fn discard_partial(&self) {
        if let PrimaryArtifact::Local(path) = self {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove partial backup");
                }
            }
        }
    }
}

/// Runs backup passes and retention passes against the configured servers
/// and destinations.
pub struct BackupManager {
    config: ConfigHandle,
    metadata: Arc<dyn MetadataStore>,
    providers: Arc<dyn ProviderFactory>,
    metrics: Arc<dyn Metrics>,
    local: Option<LocalStorage>,
    s3: Option<S3Storage>,
}

impl BackupManager {
    pub fn new(
        config: ConfigHandle,
        metadata: Arc<dyn MetadataStore>,
        providers: Arc<dyn ProviderFactory>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            config,
            metadata,
            providers,
            metrics,
            local: None,
            s3: None,
        }
    }

    pub fn with_local(mut self, local: LocalStorage) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_s3(mut self, s3: S3Storage) -> Self {
        self.s3 = Some(s3);
        self
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    fn destinations(&self, config: &AppConfig, backup_type: &str) -> Result<Destinations> {
        if !config.backup_types.contains_key(backup_type) {
            return Err(BackupError::Configuration(format!(
                "backup type '{}' is not configured",
                backup_type
            )));
        }
        let destinations = Destinations {
            local: config.local_enabled_for(backup_type) && self.local.is_some(),
            s3: config.s3_enabled_for(backup_type) && self.s3.is_some(),
        };
        if !destinations.local && !destinations.s3 {
            return Err(BackupError::Configuration(format!(
                "backup type '{}' has no enabled destination",
                backup_type
            )));
        }
        Ok(destinations)
    }

    /// Fails with a configuration error when `backup_type` cannot run.
    pub fn validate_backup_type(&self, backup_type: &str) -> Result<()> {
        let snapshot = self.config.load();
        self.destinations(&snapshot.config, backup_type).map(|_| ())
    }

    /// Backs up every database of every selected server. Per-database and
    /// per-server failures are recorded and logged; only an unknown backup
    /// type or a type without destinations fails the call.
    pub async fn perform_backup(
        &self,
        backup_type: &str,
        target: &BackupTarget,
        cancel: &CancellationToken,
    ) -> Result<BackupRunSummary> {
        let snapshot = self.config.load();
        let config = &snapshot.config;
        let destinations = self.destinations(config, backup_type)?;

        let mut servers = config.servers_for_run();
        if !target.servers.is_empty() {
            servers.retain(|s| target.servers.contains(&s.name));
        }

        let mut summary = BackupRunSummary {
            backup_type: backup_type.to_string(),
            ..Default::default()
        };
        if servers.is_empty() {
            warn!(backup_type, "No database servers selected for backup run");
            return Ok(summary);
        }

        info!(
            backup_type,
            config_version = snapshot.version,
            servers = servers.len(),
            local = destinations.local,
            s3 = destinations.s3,
            "Starting backup run"
        );

        for server in &servers {
            if cancel.is_cancelled() {
                warn!(backup_type, "Backup run cancelled, remaining servers skipped");
                break;
            }
            if let Err(e) = self
                .backup_server(backup_type, server, target, destinations, config, &mut summary, cancel)
                .await
            {
                error!(backup_type, server = %server.name, error = %e, "Server backup failed");
                summary.failed_servers.push(server.name.clone());
            }
        }

        info!(
            backup_type,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped_servers = summary.skipped_servers.len(),
            failed_servers = summary.failed_servers.len(),
            "Backup run finished"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn backup_server(
        &self,
        backup_type: &str,
        server: &DatabaseServer,
        target: &BackupTarget,
        destinations: Destinations,
        config: &AppConfig,
        summary: &mut BackupRunSummary,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut provider = self.providers.create(server)?;
        provider.connect(cancel).await?;

        let result = self
            .backup_server_databases(provider.as_mut(), backup_type, server, target, destinations, config, summary, cancel)
            .await;
        if let Err(e) = provider.close().await {
            warn!(server = %server.name, error = %e, "Failed to close provider connection");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn backup_server_databases(
        &self,
        provider: &mut dyn Provider,
        backup_type: &str,
        server: &DatabaseServer,
        target: &BackupTarget,
        destinations: Destinations,
        config: &AppConfig,
        summary: &mut BackupRunSummary,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut databases = if server.include_databases.is_empty() {
            provider
                .list_databases(cancel)
                .await?
                .into_iter()
                .filter(|db| !server.exclude_databases.contains(db))
                .collect()
        } else {
            server.include_databases.clone()
        };
        if !target.databases.is_empty() {
            databases.retain(|db| target.databases.contains(db));
        }
        if databases.is_empty() {
            warn!(backup_type, server = %server.name, "No databases to back up, skipping server");
            summary.skipped_servers.push(server.name.clone());
            return Ok(());
        }

        let options = DumpOptions::for_server(server);
        for database in &databases {
            if cancel.is_cancelled() {
                warn!(backup_type, server = %server.name, "Backup run cancelled");
                break;
            }
            summary.attempted += 1;
            let (record_id, success) = self
                .backup_database(provider, backup_type, server, database, &options, destinations, config, cancel)
                .await;
            if let Some(id) = record_id {
                summary.record_ids.push(id);
            }
            if success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(())
    }

    /// One database: dump, store, upload. Returns the record id (when one
    /// could be created) and whether the dump succeeded.
    #[allow(clippy::too_many_arguments)]
    async fn backup_database(
        &self,
        provider: &mut dyn Provider,
        backup_type: &str,
        server: &DatabaseServer,
        database: &str,
        options: &DumpOptions,
        destinations: Destinations,
        config: &AppConfig,
        cancel: &CancellationToken,
    ) -> (Option<String>, bool) {
        let started = Instant::now();
        let paths = BackupPaths::at(&server.name, backup_type, database, &Local::now());

        let record = match self
            .metadata
            .create_backup_meta(&server.name, provider.engine(), database, backup_type)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!(backup_type, server = %server.name, database, error = %e, "Cannot create backup record");
                self.record_failure(backup_type, database, started);
                return (None, false);
            }
        };
        let id = record.id;

        let mut log = RunLog::open(config.backup_log_dir.as_deref(), &paths.log_file_name());
        if let Some(log_path) = log.path() {
            if let Err(e) = self.metadata.set_log_file_path(&id, &log_path).await {
                warn!(id = %id, error = %e, "Failed to store backup log path");
            }
        }
        log.line(format_args!(
            "starting {} backup of {} on {} (record {})",
            backup_type, database, server.name, id
        ));

        let dumped = match self.prepare_primary(&paths, destinations, config).await {
            Ok(primary) => self
                .dump_to(provider, &primary, database, options, cancel)
                .await
                .map(|size| (primary, size)),
            Err(e) => Err(e),
        };
        let (primary, size) = match dumped {
            Ok(done) => done,
            Err(e) => {
                let message = e.to_string();
                error!(backup_type, server = %server.name, database, id = %id, error = %message, "Backup failed");
                log.line(format_args!("failed: {}", message));
                self.set_status(&id, BackupStatus::Error, BTreeMap::new(), 0, Some(message)).await;
                self.record_failure(backup_type, database, started);
                return (Some(id), false);
            }
        };

        let mut local_paths = BTreeMap::new();
        if destinations.local {
            local_paths.insert(SCHEME_BY_SERVER.to_string(), primary.path().to_string_lossy().into_owned());
            if let Some(local) = self.local.as_ref().filter(|l| l.organize_by_type()) {
                match local.copy_secondary(primary.path(), &paths).await {
                    Ok(copy) => {
                        local_paths.insert(SCHEME_BY_TYPE.to_string(), copy.to_string_lossy().into_owned());
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "Secondary copy failed, primary backup kept");
                        log.line(format_args!("warning: {}", e));
                    }
                }
            }
        }

        self.set_status(&id, BackupStatus::Success, local_paths, size, None).await;
        self.metrics.record(MetricEvent::BackupSucceeded {
            backup_type: backup_type.to_string(),
            database: database.to_string(),
            duration: started.elapsed(),
            size,
            completed_at: chrono::Utc::now(),
        });
        info!(backup_type, server = %server.name, database, id = %id, size, "Backup completed");
        log.line(format_args!("completed: {} bytes at {}", size, primary.path().display()));

        if destinations.s3 {
            if let Some(s3) = &self.s3 {
                self.upload(s3, &id, primary.path(), &paths, backup_type, database, &mut log).await;
            }
        }
        // A temporary primary is removed here; a local one stays.
        drop(primary);
        (Some(id), true)
    }

    async fn prepare_primary(
        &self,
        paths: &BackupPaths,
        destinations: Destinations,
        config: &AppConfig,
    ) -> Result<PrimaryArtifact> {
        if destinations.local {
            if let Some(local) = &self.local {
                return Ok(PrimaryArtifact::Local(local.prepare(paths, SCHEME_BY_SERVER).await?));
            }
        }
        let temp_dir = config
            .local_storage
            .as_ref()
            .and_then(|l| l.temp_dir.clone())
            .unwrap_or_else(std::env::temp_dir);
        tokio::fs::create_dir_all(&temp_dir).await.map_err(|e| {
            BackupError::StorageWrite(format!("cannot create {}: {}", temp_dir.display(), e))
        })?;
        let file = tempfile::Builder::new()
            .prefix(&format!("{}_{}-", paths.server, paths.database))
            .suffix(crate::storage::paths::DUMP_EXTENSION)
            .tempfile_in(&temp_dir)
            .map_err(|e| BackupError::StorageWrite(format!("cannot create temporary dump file: {}", e)))?;
        Ok(PrimaryArtifact::Temporary(file))
    }

    /// Streams the dump through gzip into `primary`; returns the compressed size.
    async fn dump_to(
        &self,
        provider: &mut dyn Provider,
        primary: &PrimaryArtifact,
        database: &str,
        options: &DumpOptions,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let path = primary.path();
        let result = async {
            let file = std::fs::File::create(path).map_err(|e| {
                BackupError::StorageWrite(format!("cannot create {}: {}", path.display(), e))
            })?;
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            provider.backup(cancel, database, &mut encoder, options).await?;
            let mut writer = encoder.finish()?;
            writer.flush()?;
            let file = writer.into_inner().map_err(|e| BackupError::Io(e.into_error()))?;
            file.sync_all()?;
            Ok::<u64, BackupError>(std::fs::metadata(path)?.len())
        }
        .await;

        if result.is_err() {
            primary.discard_partial();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload(
        &self,
        s3: &S3Storage,
        id: &str,
        file: &Path,
        paths: &BackupPaths,
        backup_type: &str,
        database: &str,
        log: &mut RunLog,
    ) {
        if let Err(e) = self
            .metadata
            .update_s3_upload_status(id, S3UploadStatus::Pending, BTreeMap::new(), None)
            .await
        {
            warn!(id, error = %e, "Failed to mark S3 upload pending");
        }

        let outcome = s3.upload_all(file, paths).await;
        let status = outcome.status();
        self.metrics.record(MetricEvent::Upload {
            backup_type: backup_type.to_string(),
            database: database.to_string(),
            storage: "s3",
            success: status == S3UploadStatus::Success,
        });
        match outcome.error_message() {
            Some(message) => {
                error!(id, backup_type, database, error = %message, "S3 upload failed");
                log.line(format_args!("s3 upload failed: {}", message));
            }
            None => {
                info!(id, backup_type, database, keys = outcome.keys.len(), "Uploaded backup to S3");
                log.line("s3 upload completed");
            }
        }
        let message = outcome.error_message();
        if let Err(e) = self
            .metadata
            .update_s3_upload_status(id, status, outcome.keys, message)
            .await
        {
            error!(id, error = %e, "Failed to record S3 upload status");
        }
    }

    async fn set_status(
        &self,
        id: &str,
        status: BackupStatus,
        local_paths: BTreeMap<String, String>,
        size: u64,
        error_message: Option<String>,
    ) {
        if let Err(e) = self
            .metadata
            .update_backup_status(id, status, local_paths, size, error_message)
            .await
        {
            error!(id, status = %status, error = %e, "Failed to record backup status");
        }
    }

    fn record_failure(&self, backup_type: &str, database: &str, started: Instant) {
        self.metrics.record(MetricEvent::BackupFailed {
            backup_type: backup_type.to_string(),
            database: database.to_string(),
            duration: started.elapsed(),
        });
    }

    fn backends(&self) -> Vec<&dyn StorageBackend> {
        let mut backends: Vec<&dyn StorageBackend> = Vec::new();
        if let Some(local) = &self.local {
            backends.push(local);
        }
        if let Some(s3) = &self.s3 {
            backends.push(s3);
        }
        backends
    }

    /// Purges long soft-deleted records, then sweeps every destination. A
    /// failing step is logged and the others still run.
    pub async fn enforce_retention_policies(&self) -> Result<RetentionSummary> {
        let snapshot = self.config.load();
        let mut summary = RetentionSummary::default();

        match self
            .metadata
            .purge_deleted_backups(Duration::days(DELETED_RECORD_GRACE_DAYS))
            .await
        {
            Ok(purged) => summary.purged_records = purged,
            Err(e) => error!(error = %e, "Failed to purge soft-deleted backup records"),
        }

        for backend in self.backends() {
            match backend.enforce_retention(&snapshot.config).await {
                Ok(report) => {
                    info!(
                        backend = report.backend,
                        examined = report.examined,
                        deleted = report.deleted,
                        failed = report.failed,
                        "Retention sweep finished"
                    );
                    summary.reports.push(report);
                }
                Err(e) => error!(backend = backend.name(), error = %e, "Retention sweep failed"),
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{BackupFilter, FileMetadataStore};
    use crate::metrics::RecordingMetrics;
    use crate::provider::mock::{ScriptedFactory, ServerScript};
    use crate::storage::MemoryObjectStore;
    use flate2::read::GzDecoder;
    use std::collections::{HashMap, HashSet};
    use std::io::Read;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        manager: BackupManager,
        metadata: Arc<dyn MetadataStore>,
        metrics: Arc<RecordingMetrics>,
        objects: Arc<MemoryObjectStore>,
        factory: ScriptedFactory,
    }

    fn config_json(root: &Path, extra: &str) -> String {
        format!(
            r#"{{
                "servers": [
                    {{ "name": "srv1", "engine": "postgres", "include_databases": ["app_db", "broken_db"] }},
                    {{ "name": "srv2", "engine": "postgres" }},
                    {{ "name": "srv3", "engine": "unsupported", "include_databases": ["x"] }}
                ],
                "backup_types": {{
                    "daily": {{ "schedule": "0 2 * * *", "local": {{ "enabled": true }}, "s3": {{ "enabled": true }} }},
                    "s3only": {{ "schedule": "0 3 * * *", "s3": {{ "enabled": true }} }},
                    "nowhere": {{ "schedule": "0 4 * * *" }}
                }},
                "local_storage": {{ "backup_dir": "{root}/backups", "temp_dir": "{root}/tmp" }},
                "s3_storage": {{
                    "bucket_name": "b", "region": "r", "access_key_id": "k",
                    "secret_access_key": "s", "endpoint_url": "http://localhost:9000",
                    "folder_prefix": "prod"
                }}
                {extra}
            }}"#,
            root = root.display(),
            extra = extra
        )
    }

    async fn harness_with(extra: &str, factory: ScriptedFactory) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::from_json_str(&config_json(dir.path(), extra)).unwrap();
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(FileMetadataStore::open(dir.path().join("metadata.json")).await.unwrap());
        let metrics = Arc::new(RecordingMetrics::default());
        let objects = Arc::new(MemoryObjectStore::default());

        let local = LocalStorage::new(config.local_storage.clone().unwrap(), metadata.clone(), metrics.clone());
        let s3 = S3Storage::new(objects.clone(), Some("prod"), metadata.clone(), metrics.clone());
        let manager = BackupManager::new(
            ConfigHandle::new(config),
            metadata.clone(),
            Arc::new(factory.clone()),
            metrics.clone(),
        )
        .with_local(local)
        .with_s3(s3);

        Harness {
            dir,
            manager,
            metadata,
            metrics,
            objects,
            factory,
        }
    }

    fn default_factory() -> ScriptedFactory {
        ScriptedFactory::default()
            .with_server(
                "srv1",
                ServerScript {
                    failing_dumps: HashMap::from([("broken_db".to_string(), "pg_dump: permission denied".to_string())]),
                    ..Default::default()
                },
            )
            .with_server(
                "srv2",
                ServerScript {
                    databases: vec!["orders".to_string(), "scratch".to_string()],
                    ..Default::default()
                },
            )
    }

    async fn harness() -> Harness {
        harness_with("", default_factory()).await
    }

    async fn records(h: &Harness) -> Vec<crate::metadata::BackupRecord> {
        h.metadata.get_backups_filtered(&BackupFilter::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_structural_errors_fail_the_run() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        for backup_type in ["missing", "nowhere"] {
            let err = h
                .manager
                .perform_backup(backup_type, &BackupTarget::default(), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, BackupError::Configuration(_)), "{backup_type}: {err}");
        }
        assert!(records(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_full_run_isolates_failures() {
        let h = harness().await;
        let summary = h
            .manager
            .perform_backup("daily", &BackupTarget::default(), &CancellationToken::new())
            .await
            .unwrap();

        // srv1: app_db ok, broken_db fails. srv2: orders + scratch. srv3: unsupported engine.
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_servers, vec!["srv3".to_string()]);

        let all = records(&h).await;
        assert_eq!(all.len(), 4);
        let broken = all.iter().find(|r| r.database_name == "broken_db").unwrap();
        assert_eq!(broken.status, BackupStatus::Error);
        assert!(broken.error_message.as_deref().unwrap().contains("permission denied"));
        assert!(broken.local_paths.is_empty());
        assert_eq!(broken.s3_upload_status, None);

        let app = all.iter().find(|r| r.database_name == "app_db").unwrap();
        assert_eq!(app.status, BackupStatus::Success);
        assert_eq!(app.s3_upload_status, Some(S3UploadStatus::Success));
        assert_eq!(app.s3_keys.len(), 2);
        assert!(app.size > 0);

        // Both local organizations exist and hold the same gzip'd dump.
        let primary = &app.local_paths[SCHEME_BY_SERVER];
        let secondary = &app.local_paths[SCHEME_BY_TYPE];
        assert!(primary.contains("/by-server/srv1/daily/app_db-"));
        assert!(secondary.contains("/by-type/daily/srv1_app_db-"));
        let mut text = String::new();
        GzDecoder::new(std::fs::File::open(secondary).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.starts_with("-- dump of app_db"));

        // The failed dump leaves nothing behind and never reaches S3.
        assert!(h.objects.keys().iter().all(|k| !k.contains("broken_db")));
        let leftovers: Vec<_> = walkdir::WalkDir::new(h.dir.path().join("backups"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("broken_db"))
            .collect();
        assert!(leftovers.is_empty());

        let failures = h
            .metrics
            .events()
            .into_iter()
            .filter(|e| matches!(e, MetricEvent::BackupFailed { .. }))
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_partial_s3_failure_marks_whole_upload_failed() {
        let h = harness().await;
        h.objects.fail_put("by-type/daily/srv1_app_db");
        let target = BackupTarget {
            servers: vec!["srv1".to_string()],
            databases: vec!["app_db".to_string()],
        };
        let summary = h
            .manager
            .perform_backup("daily", &target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.succeeded, 1);

        let record = h.metadata.get_backup(&summary.record_ids[0]).await.unwrap();
        assert_eq!(record.status, BackupStatus::Success);
        assert_eq!(record.s3_upload_status, Some(S3UploadStatus::Error));
        assert!(record.s3_error_message.unwrap().contains("access denied"));
        assert_eq!(h.objects.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_s3_only_type_uses_temporary_file() {
        let h = harness().await;
        let target = BackupTarget {
            servers: vec!["srv2".to_string()],
            databases: vec!["orders".to_string()],
        };
        let summary = h
            .manager
            .perform_backup("s3only", &target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);

        let record = h.metadata.get_backup(&summary.record_ids[0]).await.unwrap();
        assert!(record.local_paths.is_empty());
        assert_eq!(record.s3_upload_status, Some(S3UploadStatus::Success));
        assert!(record.s3_keys[SCHEME_BY_SERVER].starts_with("prod/by-server/srv2/s3only/orders-"));
        assert!(!h.dir.path().join("backups").join("by-server").exists());
        let tmp_entries = std::fs::read_dir(h.dir.path().join("tmp")).unwrap().count();
        assert_eq!(tmp_entries, 0);
    }

    #[tokio::test]
    async fn test_empty_database_set_skips_server() {
        let factory = ScriptedFactory::default().with_server(
            "srv2",
            ServerScript {
                databases: vec!["scratch".to_string()],
                ..Default::default()
            },
        );
        let h = harness_with("", factory).await;
        h.manager.config().update(|config| {
            if let Some(srv2) = config.servers.iter_mut().find(|s| s.name == "srv2") {
                srv2.exclude_databases = vec!["scratch".to_string()];
            }
        });
        let target = BackupTarget {
            servers: vec!["srv2".to_string()],
            databases: vec![],
        };
        let summary = h
            .manager
            .perform_backup("daily", &target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.skipped_servers, vec!["srv2".to_string()]);
        assert!(h.factory.dumped().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_does_not_stop_other_servers() {
        let factory = default_factory().with_server(
            "srv1",
            ServerScript {
                connect_error: Some("connection refused".to_string()),
                ..Default::default()
            },
        );
        let h = harness_with("", factory).await;
        let summary = h
            .manager
            .perform_backup("daily", &BackupTarget::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.failed_servers, vec!["srv1".to_string(), "srv3".to_string()]);
        assert_eq!(summary.succeeded, 2);
    }

    #[tokio::test]
    async fn test_backup_log_file_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let extra = format!(r#", "logging": {{ "backup_log_dir": "{}" }}"#, dir.path().display());
        let h = harness_with(&extra, default_factory()).await;
        let target = BackupTarget {
            servers: vec!["srv1".to_string()],
            databases: vec!["broken_db".to_string()],
        };
        let summary = h
            .manager
            .perform_backup("daily", &target, &CancellationToken::new())
            .await
            .unwrap();
        let record = h.metadata.get_backup(&summary.record_ids[0]).await.unwrap();
        let log_path = record.log_file_path.unwrap();
        assert!(log_path.contains("srv1_broken_db-"));
        let log = std::fs::read_to_string(log_path).unwrap();
        assert!(log.contains("failed: "));
        assert!(log.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_cancelled_run_attempts_nothing() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = h
            .manager
            .perform_backup("daily", &BackupTarget::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(summary.attempted, 0);
    }

    fn dump_files(root: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.path().to_string_lossy().ends_with(".sql.gz"))
            .map(|e| e.into_path())
            .collect()
    }

    #[tokio::test]
    async fn test_cancel_during_dump_marks_error_and_removes_partial_file() {
        for backup_type in ["daily", "s3only"] {
            let factory = ScriptedFactory::default().with_server(
                "srv1",
                ServerScript {
                    hanging_dumps: HashSet::from(["app_db".to_string()]),
                    ..Default::default()
                },
            );
            let h = harness_with("", factory).await;
            let cancel = CancellationToken::new();
            let target = BackupTarget {
                servers: vec!["srv1".to_string()],
                databases: Vec::new(),
            };

            let (summary, _) = tokio::join!(
                h.manager.perform_backup(backup_type, &target, &cancel),
                async {
                    while h.factory.dumped().is_empty() {
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    }
                    cancel.cancel();
                }
            );
            let summary = summary.unwrap();
            assert_eq!(summary.attempted, 1, "{}", backup_type);
            assert_eq!(summary.failed, 1);
            assert_eq!(h.factory.dumped(), vec![("srv1".to_string(), "app_db".to_string())]);

            let all = records(&h).await;
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].status, BackupStatus::Error);
            assert!(all[0].error_message.as_deref().unwrap().contains("cancelled"));
            assert_eq!(all[0].s3_upload_status, None);
            assert!(dump_files(h.dir.path()).is_empty(), "{}", backup_type);
            assert!(h.objects.keys().is_empty());
        }
    }

    #[tokio::test]
    async fn test_retention_pass_runs_every_backend() {
        let h = harness().await;
        h.manager.config().update(|config| {
            if let Some(daily) = config.backup_types.get_mut("daily") {
                daily.local.retention.duration = "24h".to_string();
                daily.s3.retention.duration = "24h".to_string();
            }
        });
        let summary = h.manager.enforce_retention_policies().await.unwrap();
        assert_eq!(summary.purged_records, 0);
        let backends: Vec<_> = summary.reports.iter().map(|r| r.backend).collect();
        assert_eq!(backends, vec!["local", "s3"]);
    }
}
