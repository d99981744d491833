//! Scheduled multi-server database backups with local and S3-compatible
//! storage, retention enforcement and queryable backup metadata.

pub mod backup;
pub mod config;
pub mod errors;
pub mod metadata;
pub mod metrics;
pub mod provider;
pub mod scheduler;
pub mod storage;
