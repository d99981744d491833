//! Cron-driven backup and retention runs with single-flight execution.

mod cron;
mod guard;

pub use self::cron::{CronDriver, JobFn, JobId, parse_cron_expression};
pub use guard::{TaskGuard, TaskPermit};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::backup::{BackupManager, BackupRunSummary, BackupTarget, RetentionSummary};
use crate::errors::Result;

/// Retention runs every hour at minute 15.
pub const RETENTION_SCHEDULE: &str = "0 15 * * * *";

const RETENTION_TASK: &str = "retention";

/// Spawns guarded work. Cloned into every cron job.
#[derive(Clone)]
struct Dispatcher {
    manager: Arc<BackupManager>,
    guard: TaskGuard,
    work: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    fn spawn_backup(&self, backup_type: String, target: BackupTarget) -> Result<()> {
        let permit = self.guard.try_acquire(&format!("backup:{}", backup_type))?;
        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        self.work.spawn(async move {
            let _permit = permit;
            match manager.perform_backup(&backup_type, &target, &cancel).await {
                Ok(summary) => info!(
                    backup_type = %backup_type,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "Scheduled backup finished"
                ),
                Err(e) => error!(backup_type = %backup_type, error = %e, "Backup run failed"),
            }
        });
        Ok(())
    }

    fn spawn_retention(&self) -> Result<()> {
        let permit = self.guard.try_acquire(RETENTION_TASK)?;
        let manager = self.manager.clone();
        self.work.spawn(async move {
            let _permit = permit;
            match manager.enforce_retention_policies().await {
                Ok(summary) => info!(
                    purged = summary.purged_records,
                    backends = summary.reports.len(),
                    "Retention run finished"
                ),
                Err(e) => error!(error = %e, "Retention run failed"),
            }
        });
        Ok(())
    }
}

pub struct Scheduler {
    dispatcher: Dispatcher,
    driver: CronDriver,
    backup_jobs: Mutex<BTreeMap<String, JobId>>,
    retention_job: Mutex<Option<JobId>>,
}

impl Scheduler {
    pub fn new(manager: Arc<BackupManager>) -> Self {
        Self {
            dispatcher: Dispatcher {
                manager,
                guard: TaskGuard::default(),
                work: TaskTracker::new(),
                cancel: CancellationToken::new(),
            },
            driver: CronDriver::new(),
            backup_jobs: Mutex::new(BTreeMap::new()),
            retention_job: Mutex::new(None),
        }
    }

    pub fn guard(&self) -> &TaskGuard {
        &self.dispatcher.guard
    }

    pub fn is_busy(&self) -> bool {
        self.dispatcher.guard.is_busy()
    }

    /// Registers the retention job (once) and one job per configured backup
    /// type. Returns the number of backup-type jobs registered.
    pub fn setup_jobs(&self) -> Result<usize> {
        {
            let mut retention = self.retention_job.lock();
            if retention.is_none() {
                let dispatcher = self.dispatcher.clone();
                let id = self.driver.add_job(
                    RETENTION_TASK,
                    parse_cron_expression(RETENTION_SCHEDULE)?,
                    Arc::new(move || {
                        if let Err(e) = dispatcher.spawn_retention() {
                            warn!(error = %e, "Retention trigger skipped this cycle");
                        }
                    }),
                )?;
                *retention = Some(id);
            }
        }
        Ok(self.register_backup_jobs(&mut self.backup_jobs.lock()))
    }

    /// Replaces every backup-type job with the current configuration's. The
    /// retention job is left alone.
    pub fn reload_schedules(&self) -> usize {
        let mut jobs = self.backup_jobs.lock();
        for (_, id) in std::mem::take(&mut *jobs) {
            self.driver.remove_job(id);
        }
        let registered = self.register_backup_jobs(&mut jobs);
        info!(registered, "Reloaded backup schedules");
        registered
    }

    fn register_backup_jobs(&self, jobs: &mut BTreeMap<String, JobId>) -> usize {
        let snapshot = self.dispatcher.manager.config().load();
        for (backup_type, type_config) in &snapshot.config.backup_types {
            if jobs.contains_key(backup_type) {
                continue;
            }
            let schedule = match parse_cron_expression(&type_config.schedule) {
                Ok(schedule) => schedule,
                Err(e) => {
                    error!(backup_type, error = %e, "Skipping backup type with invalid schedule");
                    continue;
                }
            };
            let dispatcher = self.dispatcher.clone();
            let job_type = backup_type.clone();
            let job: JobFn = Arc::new(move || {
                if let Err(e) = dispatcher.spawn_backup(job_type.clone(), BackupTarget::default()) {
                    warn!(backup_type = %job_type, error = %e, "Backup trigger skipped this cycle");
                }
            });
            match self.driver.add_job(&format!("backup:{}", backup_type), schedule, job) {
                Ok(id) => {
                    info!(backup_type, schedule = %type_config.schedule, "Scheduled backup type");
                    jobs.insert(backup_type.clone(), id);
                }
                Err(e) => error!(backup_type, error = %e, "Failed to schedule backup type"),
            }
        }
        jobs.len()
    }

    /// Runs one backup pass now and waits for it.
    pub async fn run_once(
        &self,
        backup_type: &str,
        servers: Vec<String>,
        databases: Vec<String>,
    ) -> Result<BackupRunSummary> {
        let _permit = self.dispatcher.guard.try_acquire(&format!("backup:{}", backup_type))?;
        self.dispatcher
            .manager
            .perform_backup(backup_type, &BackupTarget { servers, databases }, &self.dispatcher.cancel)
            .await
    }

    /// Runs one retention pass now and waits for it.
    pub async fn run_retention_once(&self) -> Result<RetentionSummary> {
        let _permit = self.dispatcher.guard.try_acquire(RETENTION_TASK)?;
        self.dispatcher.manager.enforce_retention_policies().await
    }

    /// Starts a backup in the background. Fails immediately with
    /// [`crate::errors::BackupError::Conflict`] when another task is running.
    pub fn trigger_backup(&self, backup_type: &str, target: BackupTarget) -> Result<()> {
        self.dispatcher.manager.validate_backup_type(backup_type)?;
        self.dispatcher.spawn_backup(backup_type.to_string(), target)
    }

    pub fn trigger_retention(&self) -> Result<()> {
        self.dispatcher.spawn_retention()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.driver.job_names()
    }

    /// Stops all triggers, cancels running work (killing dump processes) and
    /// waits for both to drain.
    pub async fn stop(&self) {
        self.driver.stop().await;
        self.dispatcher.cancel.cancel();
        self.dispatcher.work.close();
        self.dispatcher.work.wait().await;
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ConfigHandle};
    use crate::errors::BackupError;
    use crate::metadata::BackupStatus;
    use std::collections::HashSet;
    use crate::metadata::{BackupFilter, FileMetadataStore, MetadataStore};
    use crate::metrics::NoopMetrics;
    use crate::provider::mock::{ScriptedFactory, ServerScript};
    use crate::storage::LocalStorage;
    use std::time::Duration;

    async fn scheduler(dir: &std::path::Path) -> (Scheduler, Arc<dyn MetadataStore>) {
        scheduler_with(dir, ServerScript::default()).await
    }

    async fn scheduler_with(
        dir: &std::path::Path,
        script: ServerScript,
    ) -> (Scheduler, Arc<dyn MetadataStore>) {
        let config = AppConfig::from_json_str(&format!(
            r#"{{
                "servers": [{{ "name": "srv1", "engine": "postgres", "include_databases": ["app_db"] }}],
                "backup_types": {{
                    "daily": {{ "schedule": "0 2 * * *", "local": {{ "enabled": true }} }},
                    "broken": {{ "schedule": "whenever", "local": {{ "enabled": true }} }}
                }},
                "local_storage": {{ "backup_dir": "{}/backups" }}
            }}"#,
            dir.display()
        ))
        .unwrap();
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(FileMetadataStore::open(dir.join("metadata.json")).await.unwrap());
        let local = LocalStorage::new(config.local_storage.clone().unwrap(), metadata.clone(), Arc::new(NoopMetrics));
        let factory = ScriptedFactory::default().with_server("srv1", script);
        let manager = BackupManager::new(ConfigHandle::new(config), metadata.clone(), Arc::new(factory), Arc::new(NoopMetrics))
            .with_local(local);
        (Scheduler::new(Arc::new(manager)), metadata)
    }

    async fn wait_idle(scheduler: &Scheduler) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while scheduler.is_busy() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_simultaneous_triggers_admit_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, metadata) = scheduler(dir.path()).await;

        let first = scheduler.trigger_backup("daily", BackupTarget::default());
        let second = scheduler.trigger_backup("daily", BackupTarget::default());
        assert!(first.is_ok());
        assert!(second.unwrap_err().is_conflict());
        assert!(scheduler.trigger_retention().unwrap_err().is_conflict());

        wait_idle(&scheduler).await;
        let records = metadata.get_backups_filtered(&BackupFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);

        assert!(scheduler.trigger_retention().is_ok());
        scheduler.stop().await;
        assert!(!scheduler.is_busy());
    }

    #[tokio::test]
    async fn test_stop_cancels_running_dump() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, metadata) = scheduler_with(
            dir.path(),
            ServerScript {
                hanging_dumps: HashSet::from(["app_db".to_string()]),
                ..Default::default()
            },
        )
        .await;

        scheduler.trigger_backup("daily", BackupTarget::default()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let records = metadata.get_backups_filtered(&BackupFilter::default()).await.unwrap();
                if !records.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(10), scheduler.stop())
            .await
            .unwrap();
        assert!(!scheduler.is_busy());
        let records = metadata.get_backups_filtered(&BackupFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Error);
        assert!(!dir.path().join("backups/by-server/srv1/daily").read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn test_run_once_conflicts_with_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _metadata) = scheduler(dir.path()).await;

        let permit = scheduler.guard().try_acquire("retention").unwrap();
        let err = scheduler.run_once("daily", vec![], vec![]).await.unwrap_err();
        assert!(err.is_conflict());
        drop(permit);

        let summary = scheduler.run_once("daily", vec![], vec![]).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(scheduler.run_retention_once().await.is_ok());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_trigger_rejects_unknown_type_without_taking_guard() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _metadata) = scheduler(dir.path()).await;
        let err = scheduler.trigger_backup("hourly", BackupTarget::default()).unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
        assert!(!scheduler.is_busy());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_setup_skips_invalid_schedules_and_reload_keeps_retention() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _metadata) = scheduler(dir.path()).await;

        assert_eq!(scheduler.setup_jobs().unwrap(), 1);
        assert_eq!(
            scheduler.job_names(),
            vec!["backup:daily".to_string(), "retention".to_string()]
        );
        let retention_id = *scheduler.retention_job.lock();

        scheduler.dispatcher.manager.config().update(|config| {
            let daily = config.backup_types.remove("daily").unwrap();
            config.backup_types.insert("hourly".to_string(), daily.clone());
            config.backup_types.insert("weekly".to_string(), daily);
        });
        assert_eq!(scheduler.reload_schedules(), 2);
        assert_eq!(
            scheduler.job_names(),
            vec![
                "backup:hourly".to_string(),
                "backup:weekly".to_string(),
                "retention".to_string()
            ]
        );
        assert_eq!(*scheduler.retention_job.lock(), retention_id);

        // A second setup does not duplicate anything.
        assert_eq!(scheduler.setup_jobs().unwrap(), 2);
        assert_eq!(scheduler.job_names().len(), 3);
        scheduler.stop().await;
    }
}
