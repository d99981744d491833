use parking_lot::Mutex;
use std::sync::Arc;

use crate::errors::{BackupError, Result};

/// System-wide single-flight flag: at most one backup or retention task runs
/// at a time. A second caller is refused, never queued.
#[derive(Clone, Default)]
pub struct TaskGuard {
    active: Arc<Mutex<Option<String>>>,
}

/// Held while a task runs; dropping it frees the guard.
#[must_use = "the guard is released as soon as the permit is dropped"]
pub struct TaskPermit {
    active: Arc<Mutex<Option<String>>>,
}

impl TaskGuard {
    pub fn try_acquire(&self, task: &str) -> Result<TaskPermit> {
        let mut active = self.active.lock();
        if let Some(running) = active.as_ref() {
            return Err(BackupError::Conflict(format!(
                "'{}' requested while '{}' is in progress",
                task, running
            )));
        }
        *active = Some(task.to_string());
        Ok(TaskPermit {
            active: self.active.clone(),
        })
    }

    pub fn current(&self) -> Option<String> {
        self.active.lock().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().is_some()
    }
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}
