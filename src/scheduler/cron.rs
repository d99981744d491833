use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::errors::{BackupError, Result};

pub type JobId = u64;

/// Invoked on every fire. Must return quickly; long work is spawned.
pub type JobFn = Arc<dyn Fn() + Send + Sync>;

/// Parses a cron expression. Classic 5-field expressions (minute first) get
/// a leading seconds field; 6 and 7-field expressions are used as given.
pub fn parse_cron_expression(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| {
        BackupError::Configuration(format!("invalid cron expression '{}': {}", expression, e))
    })
}

/// Runs each registered job on its own timer task.
pub struct CronDriver {
    jobs: Mutex<HashMap<JobId, (String, CancellationToken)>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Default for CronDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CronDriver {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn add_job(&self, name: &str, schedule: Schedule, job: JobFn) -> Result<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(BackupError::Configuration(format!(
                "cannot add job '{}' to a stopped scheduler",
                name
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        self.jobs.lock().insert(id, (name.to_string(), token.clone()));

        let job_name = name.to_string();
        self.tracker.spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    debug!(job = %job_name, "Schedule has no future fire times");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        debug!(job = %job_name, "Cron job fired");
                        job();
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
        debug!(id, job = name, "Registered cron job");
        Ok(id)
    }

    pub fn remove_job(&self, id: JobId) -> bool {
        match self.jobs.lock().remove(&id) {
            Some((name, token)) => {
                token.cancel();
                debug!(id, job = %name, "Removed cron job");
                true
            }
            None => false,
        }
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.lock().values().map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }

    /// Cancels every job and waits until all timer tasks have exited.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.jobs.lock().clear();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Cron driver drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_parse_accepts_five_and_six_fields() {
        assert!(parse_cron_expression("0 2 * * *").is_ok());
        assert!(parse_cron_expression("0 15 * * * *").is_ok());
        assert!(parse_cron_expression("*/10 * * * * * 2030").is_ok());
        let err = parse_cron_expression("every night").unwrap_err();
        assert!(matches!(err, BackupError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_jobs_fire_and_stop_drains() {
        let driver = CronDriver::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let every_second = parse_cron_expression("* * * * * *").unwrap();
        driver
            .add_job("tick", every_second, Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while fired.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        driver.stop().await;
        let after_stop = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_stop);
        assert!(driver.add_job("late", parse_cron_expression("0 2 * * *").unwrap(), Arc::new(|| {})).is_err());
    }

    #[tokio::test]
    async fn test_remove_job_only_removes_that_job() {
        let driver = CronDriver::new();
        let schedule = parse_cron_expression("0 2 * * *").unwrap();
        let a = driver.add_job("a", schedule.clone(), Arc::new(|| {})).unwrap();
        driver.add_job("b", schedule, Arc::new(|| {})).unwrap();

        assert!(driver.remove_job(a));
        assert!(!driver.remove_job(a));
        assert_eq!(driver.job_names(), vec!["b".to_string()]);
        driver.stop().await;
    }
}
