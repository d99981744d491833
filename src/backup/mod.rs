mod manager;
mod run_log;

pub use manager::{BackupManager, BackupRunSummary, BackupTarget, RetentionSummary};
