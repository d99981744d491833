//! Backup outcome metrics.
//!
//! Components report [`MetricEvent`]s through the [`Metrics`] trait; the
//! Prometheus implementation keeps process-wide collectors registered in the
//! default registry.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, GaugeVec, HistogramVec, IntCounterVec, TextEncoder, register_gauge_vec,
    register_histogram_vec, register_int_counter_vec,
};
use std::time::Duration;

lazy_static! {
    static ref BACKUP_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "db_backup_attempts_total",
        "Backup attempts by outcome",
        &["backup_type", "database", "status"]
    )
    .unwrap();

    static ref BACKUP_DURATION: HistogramVec = register_histogram_vec!(
        "db_backup_duration_seconds",
        "Time spent dumping and storing one database",
        &["backup_type", "database"],
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
    )
    .unwrap();

    static ref BACKUP_SIZE: GaugeVec = register_gauge_vec!(
        "db_backup_size_bytes",
        "Compressed size of the latest successful backup",
        &["backup_type", "database"]
    )
    .unwrap();

    static ref LAST_SUCCESS: GaugeVec = register_gauge_vec!(
        "db_backup_last_success_timestamp_seconds",
        "Unix time of the latest successful backup",
        &["backup_type", "database"]
    )
    .unwrap();

    static ref UPLOADS: IntCounterVec = register_int_counter_vec!(
        "db_backup_uploads_total",
        "Remote uploads by outcome",
        &["backup_type", "database", "storage", "status"]
    )
    .unwrap();

    static ref RETENTION_DELETIONS: IntCounterVec = register_int_counter_vec!(
        "db_backup_retention_deletions_total",
        "Artifacts removed by the retention sweep",
        &["backup_type", "storage"]
    )
    .unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    BackupSucceeded {
        backup_type: String,
        database: String,
        duration: Duration,
        size: u64,
        completed_at: chrono::DateTime<chrono::Utc>,
    },
    BackupFailed {
        backup_type: String,
        database: String,
        duration: Duration,
    },
    Upload {
        backup_type: String,
        database: String,
        storage: &'static str,
        success: bool,
    },
    RetentionDeleted {
        backup_type: String,
        storage: &'static str,
        count: u64,
    },
}

pub trait Metrics: Send + Sync {
    fn record(&self, event: MetricEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl PrometheusMetrics {
    pub fn new() -> Self {
        // Touch every collector so they are all exported from the first scrape.
        lazy_static::initialize(&BACKUP_ATTEMPTS);
        lazy_static::initialize(&BACKUP_DURATION);
        lazy_static::initialize(&BACKUP_SIZE);
        lazy_static::initialize(&LAST_SUCCESS);
        lazy_static::initialize(&UPLOADS);
        lazy_static::initialize(&RETENTION_DELETIONS);
        Self
    }

    /// Text exposition of everything in the default registry.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Metrics for PrometheusMetrics {
    fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::BackupSucceeded {
                backup_type,
                database,
                duration,
                size,
                completed_at,
            } => {
                let labels = [backup_type.as_str(), database.as_str()];
                BACKUP_ATTEMPTS
                    .with_label_values(&[labels[0], labels[1], "success"])
                    .inc();
                BACKUP_DURATION
                    .with_label_values(&labels)
                    .observe(duration.as_secs_f64());
                BACKUP_SIZE.with_label_values(&labels).set(size as f64);
                LAST_SUCCESS
                    .with_label_values(&labels)
                    .set(completed_at.timestamp() as f64);
            }
            MetricEvent::BackupFailed {
                backup_type,
                database,
                duration,
            } => {
                BACKUP_ATTEMPTS
                    .with_label_values(&[backup_type.as_str(), database.as_str(), "error"])
                    .inc();
                BACKUP_DURATION
                    .with_label_values(&[backup_type.as_str(), database.as_str()])
                    .observe(duration.as_secs_f64());
            }
            MetricEvent::Upload {
                backup_type,
                database,
                storage,
                success,
            } => {
                let status = if success { "success" } else { "error" };
                UPLOADS
                    .with_label_values(&[backup_type.as_str(), database.as_str(), storage, status])
                    .inc();
            }
            MetricEvent::RetentionDeleted {
                backup_type,
                storage,
                count,
            } => {
                RETENTION_DELETIONS
                    .with_label_values(&[backup_type.as_str(), storage])
                    .inc_by(count);
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

/// Keeps events in memory for assertions.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingMetrics {
    events: parking_lot::Mutex<Vec<MetricEvent>>,
}

#[cfg(test)]
impl RecordingMetrics {
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
impl Metrics for RecordingMetrics {
    fn record(&self, event: MetricEvent) {
        self.events.lock().push(event);
    }
}
