use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use super::{AppConfig, BackupTypeConfig, DestinationConfig};
use crate::metadata::BackupSchedule;

/// An immutable configuration value plus the version it was published under.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: AppConfig,
}

/// Shared, atomically swappable configuration.
///
/// Readers call [`ConfigHandle::load`] once per unit of work and keep the
/// returned snapshot for its duration, so a concurrent reload is never
/// observed half-applied.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<ArcSwap<ConfigSnapshot>>,
    // Serializes read-modify-write updates so versions stay strictly increasing.
    writer: Arc<Mutex<()>>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(ConfigSnapshot { version: 1, config })),
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Publishes a whole new configuration. Returns the new version.
    pub fn replace(&self, config: AppConfig) -> u64 {
        self.update(|current| *current = config)
    }

    pub fn update<F>(&self, f: F) -> u64
    where
        F: FnOnce(&mut AppConfig),
    {
        let _guard = self.writer.lock();
        let previous = self.current.load_full();
        let mut next = previous.config.clone();
        f(&mut next);
        let version = previous.version + 1;
        self.current.store(Arc::new(ConfigSnapshot {
            version,
            config: next,
        }));
        version
    }

    /// Overlays enabled schedules from the relational store onto the backup
    /// type table. A schedule replaces the cron expression and retention rules
    /// of its backup type; destination enable flags already configured for the
    /// type are kept, new types enable every configured destination.
    pub fn apply_schedules(&self, schedules: &[BackupSchedule]) -> u64 {
        let version = self.update(|config| {
            let local_available = config.local_storage.is_some();
            let s3_available = config.spaces_config.is_some();

            for schedule in schedules.iter().filter(|s| s.enabled) {
                let (local_enabled, s3_enabled) = config
                    .backup_types
                    .get(&schedule.backup_type)
                    .map(|existing| (existing.local.enabled, existing.s3.enabled))
                    .unwrap_or((local_available, s3_available));

                config.backup_types.insert(
                    schedule.backup_type.clone(),
                    BackupTypeConfig {
                        schedule: schedule.cron_expression.clone(),
                        local: DestinationConfig {
                            enabled: local_enabled,
                            retention: schedule.local_retention.clone(),
                        },
                        s3: DestinationConfig {
                            enabled: s3_enabled,
                            retention: schedule.s3_retention.clone(),
                        },
                    },
                );
            }
        });
        info!(version, schedules = schedules.len(), "Applied backup schedules to configuration");
        version
    }
}
