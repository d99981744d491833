//! Database Backup Manager
//!
//! `db-backup-manager [serve|backup <type>|retention] [config.json]`

use anyhow::{Context, Result};
use db_backup_manager::backup::BackupManager;
use db_backup_manager::config::{AppConfig, ConfigHandle};
use db_backup_manager::metadata::open_metadata_store;
use db_backup_manager::metrics::PrometheusMetrics;
use db_backup_manager::provider::DefaultProviderFactory;
use db_backup_manager::scheduler::Scheduler;
use db_backup_manager::storage::{AwsObjectStore, LocalStorage, S3Storage};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

enum Command {
    Serve,
    Backup(String),
    Retention,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("db_backup_manager=info")),
        )
        .init();

    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<(Command, Option<PathBuf>)> {
    let mut rest = args.iter().skip(1);
    let command = match rest.next().map(String::as_str) {
        None | Some("serve") => Command::Serve,
        Some("retention") => Command::Retention,
        Some("backup") => Command::Backup(
            rest.next()
                .cloned()
                .context("usage: db-backup-manager backup <type> [config.json]")?,
        ),
        Some(other) => anyhow::bail!(
            "Unknown command '{}'. Expected 'serve', 'backup <type>' or 'retention'.",
            other
        ),
    };
    Ok((command, rest.next().map(PathBuf::from)))
}

async fn run_app() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let (command, config_arg) = parse_args(&args)?;
    let config_path = config_arg
        .or_else(|| env::var("CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.json"));

    let app_config = AppConfig::load_from_json(&config_path)?;
    info!(
        config = %config_path.display(),
        servers = app_config.servers_for_run().len(),
        backup_types = app_config.backup_types.len(),
        "Loaded configuration"
    );

    let opened = open_metadata_store(&app_config.metadata)
        .await
        .context("Failed to initialize backup metadata store")?;
    let metadata = opened.store;
    let metrics = Arc::new(PrometheusMetrics::new());
    let config = ConfigHandle::new(app_config.clone());
    if !opened.schedules.is_empty() {
        config.apply_schedules(&opened.schedules);
    }
    info!(
        backend = metadata.backend_name(),
        stored_schedules = opened.schedules.len(),
        config_version = config.version(),
        "Metadata store ready"
    );

    let mut manager = BackupManager::new(
        config,
        metadata.clone(),
        Arc::new(DefaultProviderFactory),
        metrics.clone(),
    );
    if let Some(local_config) = app_config.local_storage.clone() {
        manager = manager.with_local(LocalStorage::new(local_config, metadata.clone(), metrics.clone()));
    }
    if let Some(spaces) = &app_config.spaces_config {
        let store = AwsObjectStore::from_config(spaces).await;
        manager = manager.with_s3(S3Storage::new(
            Arc::new(store),
            spaces.folder_prefix.as_deref(),
            metadata.clone(),
            metrics.clone(),
        ));
    }
    let scheduler = Scheduler::new(Arc::new(manager));

    match command {
        Command::Serve => {
            let registered = scheduler.setup_jobs()?;
            info!(registered, jobs = ?scheduler.job_names(), "Scheduler running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
            scheduler.stop().await;
        }
        Command::Backup(backup_type) => {
            println!("🚀 Starting {} backup...", backup_type);
            let summary = scheduler
                .run_once(&backup_type, Vec::new(), Vec::new())
                .await
                .with_context(|| format!("Backup run '{}' failed", backup_type))?;
            println!(
                "✅ {} backup finished: {} succeeded, {} failed, {} server(s) skipped, {} server(s) failed.",
                summary.backup_type,
                summary.succeeded,
                summary.failed,
                summary.skipped_servers.len(),
                summary.failed_servers.len()
            );
            scheduler.stop().await;
        }
        Command::Retention => {
            println!("🧹 Enforcing retention policies...");
            let summary = scheduler
                .run_retention_once()
                .await
                .context("Retention run failed")?;
            for report in &summary.reports {
                println!(
                    "  {}: examined {}, deleted {}, failed {}",
                    report.backend, report.examined, report.deleted, report.failed
                );
            }
            println!("✅ Purged {} deleted record(s).", summary.purged_records);
            scheduler.stop().await;
        }
    }

    match metrics.render() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to render metrics"),
    }
    Ok(())
}
