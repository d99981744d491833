// db-backup-manager/src/metadata/sql.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, try_join_all};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    BackupFilter, BackupPage, BackupQuery, BackupRecord, BackupSchedule, BackupStats,
    BackupStatus, MetadataStore, S3UploadStatus, SortField, ensure_completion,
    ensure_s3_allowed, ensure_transition, now,
};
use crate::config::RetentionPolicy;
use crate::errors::{BackupError, Result};
use crate::scheduler::parse_cron_expression;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS backups (
        id TEXT PRIMARY KEY,
        server_name TEXT NOT NULL,
        database_engine TEXT NOT NULL,
        database_name TEXT NOT NULL,
        backup_type TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        completed_at INTEGER,
        deleted_at INTEGER,
        status TEXT NOT NULL,
        error_message TEXT,
        size INTEGER NOT NULL DEFAULT 0,
        s3_upload_status TEXT,
        s3_error_message TEXT,
        log_file_path TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_backups_status ON backups(status)",
    "CREATE INDEX IF NOT EXISTS idx_backups_lookup ON backups(server_name, database_name, backup_type)",
    r#"CREATE TABLE IF NOT EXISTS backup_local_paths (
        backup_id TEXT NOT NULL REFERENCES backups(id) ON DELETE CASCADE,
        scheme TEXT NOT NULL,
        path TEXT NOT NULL,
        PRIMARY KEY (backup_id, scheme)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_local_paths_path ON backup_local_paths(path)",
    r#"CREATE TABLE IF NOT EXISTS backup_s3_keys (
        backup_id TEXT NOT NULL REFERENCES backups(id) ON DELETE CASCADE,
        scheme TEXT NOT NULL,
        object_key TEXT NOT NULL,
        PRIMARY KEY (backup_id, scheme)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_s3_keys_key ON backup_s3_keys(object_key)",
    r#"CREATE TABLE IF NOT EXISTS backup_schedules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        backup_type TEXT NOT NULL,
        cron_expression TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        local_retention TEXT NOT NULL DEFAULT '',
        local_keep_forever INTEGER NOT NULL DEFAULT 0,
        s3_retention TEXT NOT NULL DEFAULT '',
        s3_keep_forever INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"#,
];

const RECORD_COLUMNS: &str = "id, server_name, database_engine, database_name, backup_type, \
    created_at, completed_at, deleted_at, status, error_message, size, s3_upload_status, \
    s3_error_message, log_file_path";

// SQLite's bound-parameter limit is 999 on older builds.
const CHILD_LOOKUP_CHUNK: usize = 500;

/// Metadata in SQLite: one `backups` row per record, child rows for local
/// paths and S3 keys, plus the schedule table.
///
/// Readers share `access`; writers take it exclusively and run inside a
/// transaction.
pub struct SqlMetadataStore {
    pool: SqlitePool,
    access: RwLock<()>,
}

impl SqlMetadataStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(10));

        // Every connection to `:memory:` would see its own empty database.
        let in_memory = database_url.contains(":memory:");
        let options = if in_memory {
            options
        } else {
            options.journal_mode(SqliteJournalMode::Wal)
        };
        let pool_options = if in_memory {
            // The database lives exactly as long as its one connection.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| {
                BackupError::Metadata(format!(
                    "Failed to open metadata database {}: {}",
                    database_url, e
                ))
            })?;

        let store = Self {
            pool,
            access: RwLock::new(()),
        };
        store.init_schema().await?;
        info!(database_url, "Metadata database ready");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn create_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule> {
        validate_schedule(schedule)?;
        let _write = self.access.write().await;
        let at = now();
        let result = sqlx::query(
            "INSERT INTO backup_schedules (name, backup_type, cron_expression, enabled, \
             local_retention, local_keep_forever, s3_retention, s3_keep_forever, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&schedule.name)
        .bind(&schedule.backup_type)
        .bind(&schedule.cron_expression)
        .bind(schedule.enabled)
        .bind(&schedule.local_retention.duration)
        .bind(schedule.local_retention.keep_forever)
        .bind(&schedule.s3_retention.duration)
        .bind(schedule.s3_retention.keep_forever)
        .bind(at.timestamp_micros())
        .bind(at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        let mut created = schedule.clone();
        created.id = result.last_insert_rowid();
        created.created_at = at;
        created.updated_at = at;
        info!(id = created.id, name = %created.name, "Created backup schedule");
        Ok(created)
    }

    pub async fn get_schedule(&self, id: i64) -> Result<BackupSchedule> {
        let _read = self.access.read().await;
        let row = sqlx::query("SELECT * FROM backup_schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("schedule {}", id)))?;
        schedule_from_row(&row)
    }

    pub async fn list_schedules(&self) -> Result<Vec<BackupSchedule>> {
        let _read = self.access.read().await;
        let rows = sqlx::query("SELECT * FROM backup_schedules ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    pub async fn update_schedule(&self, schedule: &BackupSchedule) -> Result<BackupSchedule> {
        validate_schedule(schedule)?;
        let _write = self.access.write().await;
        let at = now();
        let result = sqlx::query(
            "UPDATE backup_schedules SET name = ?, backup_type = ?, cron_expression = ?, enabled = ?, \
             local_retention = ?, local_keep_forever = ?, s3_retention = ?, s3_keep_forever = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(&schedule.name)
        .bind(&schedule.backup_type)
        .bind(&schedule.cron_expression)
        .bind(schedule.enabled)
        .bind(&schedule.local_retention.duration)
        .bind(schedule.local_retention.keep_forever)
        .bind(&schedule.s3_retention.duration)
        .bind(schedule.s3_retention.keep_forever)
        .bind(at.timestamp_micros())
        .bind(schedule.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound(format!("schedule {}", schedule.id)));
        }
        let mut updated = schedule.clone();
        updated.updated_at = at;
        Ok(updated)
    }

    pub async fn delete_schedule(&self, id: i64) -> Result<()> {
        let _write = self.access.write().await;
        let result = sqlx::query("DELETE FROM backup_schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound(format!("schedule {}", id)));
        }
        Ok(())
    }

    async fn fetch_records(&self, mut builder: QueryBuilder<'_, Sqlite>) -> Result<Vec<BackupRecord>> {
        let mut conn = self.pool.acquire().await?;
        let rows = builder.build().fetch_all(&mut *conn).await?;
        let mut records = rows.iter().map(record_from_row).collect::<Result<Vec<_>>>()?;
        load_children(&mut conn, &mut records).await?;
        Ok(records)
    }

    async fn fetch_by_child(&self, table: &str, column: &str, value: &str) -> Result<Option<BackupRecord>> {
        let _read = self.access.read().await;
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM backups WHERE id IN (SELECT backup_id FROM {} WHERE {} = ",
            RECORD_COLUMNS, table, column
        ));
        builder.push_bind(value.to_string());
        builder.push(") ORDER BY created_at DESC LIMIT 1");
        Ok(self.fetch_records(builder).await?.into_iter().next())
    }
}

fn validate_schedule(schedule: &BackupSchedule) -> Result<()> {
    if schedule.name.trim().is_empty() || schedule.backup_type.trim().is_empty() {
        return Err(BackupError::Configuration(
            "schedule name and backup_type must not be empty".to_string(),
        ));
    }
    parse_cron_expression(&schedule.cron_expression)?;
    for policy in [&schedule.local_retention, &schedule.s3_retention] {
        if !policy.keep_forever && !policy.duration.is_empty() {
            policy.max_age()?;
        }
    }
    Ok(())
}

fn to_time(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| BackupError::Metadata(format!("invalid timestamp {}", micros)))
}

fn to_time_opt(micros: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    micros.map(to_time).transpose()
}

fn record_from_row(row: &SqliteRow) -> Result<BackupRecord> {
    let status: String = row.try_get("status")?;
    let s3_status: Option<String> = row.try_get("s3_upload_status")?;
    let size: i64 = row.try_get("size")?;
    Ok(BackupRecord {
        id: row.try_get("id")?,
        server_name: row.try_get("server_name")?,
        database_engine: row.try_get("database_engine")?,
        database_name: row.try_get("database_name")?,
        backup_type: row.try_get("backup_type")?,
        created_at: to_time(row.try_get("created_at")?)?,
        completed_at: to_time_opt(row.try_get("completed_at")?)?,
        deleted_at: to_time_opt(row.try_get("deleted_at")?)?,
        status: status.parse()?,
        error_message: row.try_get("error_message")?,
        size: size.max(0) as u64,
        local_paths: BTreeMap::new(),
        s3_keys: BTreeMap::new(),
        s3_upload_status: s3_status.map(|s| s.parse()).transpose()?,
        s3_error_message: row.try_get("s3_error_message")?,
        log_file_path: row.try_get("log_file_path")?,
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<BackupSchedule> {
    Ok(BackupSchedule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        backup_type: row.try_get("backup_type")?,
        cron_expression: row.try_get("cron_expression")?,
        enabled: row.try_get("enabled")?,
        local_retention: RetentionPolicy {
            duration: row.try_get("local_retention")?,
            keep_forever: row.try_get("local_keep_forever")?,
        },
        s3_retention: RetentionPolicy {
            duration: row.try_get("s3_retention")?,
            keep_forever: row.try_get("s3_keep_forever")?,
        },
        created_at: to_time(row.try_get("created_at")?)?,
        updated_at: to_time(row.try_get("updated_at")?)?,
    })
}

async fn load_children(conn: &mut SqliteConnection, records: &mut [BackupRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    for (i, record) in records.iter().enumerate() {
        index.insert(record.id.clone(), i);
    }
    let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();

    for chunk in ids.chunks(CHILD_LOOKUP_CHUNK) {
        for (table, column) in [("backup_local_paths", "path"), ("backup_s3_keys", "object_key")] {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT backup_id, scheme, {} AS location FROM {} WHERE backup_id IN (",
                column, table
            ));
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");

            let rows = builder.build().fetch_all(&mut *conn).await?;
            for row in rows {
                let backup_id: String = row.try_get("backup_id")?;
                let scheme: String = row.try_get("scheme")?;
                let location: String = row.try_get("location")?;
                if let Some(&i) = index.get(&backup_id) {
                    let target = if table == "backup_local_paths" {
                        &mut records[i].local_paths
                    } else {
                        &mut records[i].s3_keys
                    };
                    target.insert(scheme, location);
                }
            }
        }
    }
    Ok(())
}

async fn current_status(conn: &mut SqliteConnection, id: &str) -> Result<BackupStatus> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM backups WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    status
        .ok_or_else(|| BackupError::NotFound(id.to_string()))?
        .parse()
}

async fn replace_children(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    id: &str,
    entries: &BTreeMap<String, String>,
) -> Result<()> {
    sqlx::query(&format!("DELETE FROM {} WHERE backup_id = ?", table))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    for (scheme, location) in entries {
        sqlx::query(&format!(
            "INSERT INTO {} (backup_id, scheme, {}) VALUES (?, ?, ?)",
            table, column
        ))
        .bind(id)
        .bind(scheme)
        .bind(location)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn set_deleted(conn: &mut SqliteConnection, id: &str, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE backups SET status = 'deleted', deleted_at = ? WHERE id = ? AND status != 'deleted'",
    )
    .bind(at.timestamp_micros())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &BackupFilter, status: Option<BackupStatus>) {
    builder.push(" WHERE 1 = 1");
    if let Some(server) = &filter.server {
        builder.push(" AND server_name = ").push_bind(server.clone());
    }
    if let Some(database) = &filter.database {
        builder.push(" AND database_name = ").push_bind(database.clone());
    }
    if let Some(backup_type) = &filter.backup_type {
        builder.push(" AND backup_type = ").push_bind(backup_type.clone());
    }
    if filter.active_only {
        builder.push(" AND status = 'success'");
    }
    if let Some(status) = status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
}

fn order_clause(sort_by: SortField, descending: bool) -> String {
    let column = match sort_by {
        SortField::CreatedAt => "created_at",
        SortField::Size => "size",
        SortField::DatabaseName => "database_name",
        SortField::ServerName => "server_name",
    };
    let direction = if descending { "DESC" } else { "ASC" };
    format!(" ORDER BY {} {}, id {}", column, direction, direction)
}

/// One independently computed slice of [`BackupStats`].
enum StatsPart {
    StatusCounts(Vec<(String, i64)>),
    TypeCounts(Vec<(String, i64)>),
    ServerCounts(Vec<(String, i64)>),
    Recent { last_24h: i64, last_7d: i64 },
    Sizes { local: i64, s3: i64 },
    LastSuccess(Option<i64>),
}

impl StatsPart {
    fn merge_into(self, stats: &mut BackupStats) -> Result<()> {
        match self {
            StatsPart::StatusCounts(rows) => {
                for (status, count) in rows {
                    let count = count as u64;
                    stats.total += count;
                    match status.parse::<BackupStatus>()? {
                        BackupStatus::Pending => stats.pending += count,
                        BackupStatus::Success => stats.success += count,
                        BackupStatus::Error => stats.error += count,
                        BackupStatus::Deleted => stats.deleted += count,
                    }
                }
            }
            StatsPart::TypeCounts(rows) => {
                stats.by_type = rows.into_iter().map(|(k, v)| (k, v as u64)).collect();
            }
            StatsPart::ServerCounts(rows) => {
                stats.by_server = rows.into_iter().map(|(k, v)| (k, v as u64)).collect();
            }
            StatsPart::Recent { last_24h, last_7d } => {
                stats.last_24h = last_24h as u64;
                stats.last_7d = last_7d as u64;
            }
            StatsPart::Sizes { local, s3 } => {
                stats.total_local_size = local as u64;
                stats.total_s3_size = s3 as u64;
            }
            StatsPart::LastSuccess(micros) => {
                stats.last_successful_backup = to_time_opt(micros)?;
            }
        }
        Ok(())
    }
}

async fn grouped_counts(pool: &SqlitePool, column: &str) -> Result<Vec<(String, i64)>> {
    let sql = format!(
        "SELECT {col}, COUNT(*) FROM backups WHERE status != 'deleted' GROUP BY {col}",
        col = column
    );
    Ok(sqlx::query_as::<_, (String, i64)>(&sql).fetch_all(pool).await?)
}

#[async_trait]
impl MetadataStore for SqlMetadataStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_backup_meta(
        &self,
        server: &str,
        engine: &str,
        database: &str,
        backup_type: &str,
    ) -> Result<BackupRecord> {
        let record = BackupRecord::new_pending(server, engine, database, backup_type);
        let _write = self.access.write().await;
        sqlx::query(
            "INSERT INTO backups (id, server_name, database_engine, database_name, backup_type, \
             created_at, status, size) VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&record.id)
        .bind(&record.server_name)
        .bind(&record.database_engine)
        .bind(&record.database_name)
        .bind(&record.backup_type)
        .bind(record.created_at.timestamp_micros())
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;
        debug!(id = %record.id, server, database, backup_type, "Created backup record");
        Ok(record)
    }

    async fn update_backup_status(
        &self,
        id: &str,
        status: BackupStatus,
        local_paths: BTreeMap<String, String>,
        size: u64,
        error_message: Option<String>,
    ) -> Result<()> {
        let _write = self.access.write().await;
        let mut tx = self.pool.begin().await?;
        let current = current_status(&mut tx, id).await?;
        ensure_completion(id, current, status)?;

        sqlx::query(
            "UPDATE backups SET status = ?, size = ?, error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(size as i64)
        .bind(error_message)
        .bind(now().timestamp_micros())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        replace_children(&mut tx, "backup_local_paths", "path", id, &local_paths).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_s3_upload_status(
        &self,
        id: &str,
        status: S3UploadStatus,
        s3_keys: BTreeMap<String, String>,
        error_message: Option<String>,
    ) -> Result<()> {
        let _write = self.access.write().await;
        let mut tx = self.pool.begin().await?;
        let current = current_status(&mut tx, id).await?;
        ensure_s3_allowed(id, current)?;

        sqlx::query("UPDATE backups SET s3_upload_status = ?, s3_error_message = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        replace_children(&mut tx, "backup_s3_keys", "object_key", id, &s3_keys).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_log_file_path(&self, id: &str, path: &str) -> Result<()> {
        let _write = self.access.write().await;
        let result = sqlx::query("UPDATE backups SET log_file_path = ? WHERE id = ?")
            .bind(path)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackupError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_backup_deleted(&self, id: &str) -> Result<()> {
        let _write = self.access.write().await;
        let mut tx = self.pool.begin().await?;
        current_status(&mut tx, id).await?;
        set_deleted(&mut tx, id, now()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn purge_deleted_backups(&self, older_than: Duration) -> Result<u64> {
        let _write = self.access.write().await;
        let cutoff = (now() - older_than).timestamp_micros();
        let result = sqlx::query(
            "DELETE FROM backups WHERE status = 'deleted' \
             AND COALESCE(deleted_at, completed_at, created_at) <= ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "Purged soft-deleted backup records");
        }
        Ok(removed)
    }

    async fn get_backup(&self, id: &str) -> Result<BackupRecord> {
        let _read = self.access.read().await;
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM backups WHERE id = ", RECORD_COLUMNS));
        builder.push_bind(id.to_string());
        self.fetch_records(builder)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }

    async fn get_backups_filtered(&self, filter: &BackupFilter) -> Result<Vec<BackupRecord>> {
        let _read = self.access.read().await;
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM backups", RECORD_COLUMNS));
        push_filter(&mut builder, filter, None);
        builder.push(order_clause(SortField::CreatedAt, true));
        self.fetch_records(builder).await
    }

    async fn query_backups(&self, query: &BackupQuery) -> Result<BackupPage> {
        let _read = self.access.read().await;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM backups");
        push_filter(&mut count, &query.filter, query.status);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM backups", RECORD_COLUMNS));
        push_filter(&mut builder, &query.filter, query.status);
        builder.push(order_clause(query.sort_by, query.descending));
        builder
            .push(" LIMIT ")
            .push_bind(i64::from(query.page_size))
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);
        let records = self.fetch_records(builder).await?;

        Ok(BackupPage {
            records,
            total: total as u64,
            page: query.page.max(1),
            page_size: query.page_size,
        })
    }

    async fn find_by_local_path(&self, path: &str) -> Result<Option<BackupRecord>> {
        self.fetch_by_child("backup_local_paths", "path", path).await
    }

    async fn find_by_s3_key(&self, key: &str) -> Result<Option<BackupRecord>> {
        self.fetch_by_child("backup_s3_keys", "object_key", key).await
    }

    async fn bulk_update_status(&self, ids: &[String], status: BackupStatus) -> Result<u64> {
        let _write = self.access.write().await;
        let mut tx = self.pool.begin().await?;
        for id in ids {
            let current = current_status(&mut tx, id).await?;
            ensure_transition(id, current, status)?;
        }

        let at = now();
        for id in ids {
            if status == BackupStatus::Deleted {
                set_deleted(&mut tx, id, at).await?;
            } else {
                sqlx::query("UPDATE backups SET status = ?, completed_at = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(at.timestamp_micros())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        // Dropping the transaction on any early return above rolls everything back.
        tx.commit().await?;
        Ok(ids.len() as u64)
    }

    async fn get_stats(&self) -> Result<BackupStats> {
        let _read = self.access.read().await;
        let current = now();
        let day_ago = (current - Duration::hours(24)).timestamp_micros();
        let week_ago = (current - Duration::days(7)).timestamp_micros();
        let pool = &self.pool;

        // Independent read-only aggregates run concurrently; each part fills
        // disjoint fields, so merge order does not matter.
        let queries: Vec<BoxFuture<'_, Result<StatsPart>>> = vec![
            async move {
                let rows = sqlx::query_as::<_, (String, i64)>(
                    "SELECT status, COUNT(*) FROM backups GROUP BY status",
                )
                .fetch_all(pool)
                .await?;
                Ok(StatsPart::StatusCounts(rows))
            }
            .boxed(),
            async move { Ok(StatsPart::TypeCounts(grouped_counts(pool, "backup_type").await?)) }.boxed(),
            async move { Ok(StatsPart::ServerCounts(grouped_counts(pool, "server_name").await?)) }.boxed(),
            async move {
                let (last_24h, last_7d) = sqlx::query_as::<_, (i64, i64)>(
                    "SELECT COALESCE(SUM(CASE WHEN created_at >= ? THEN 1 ELSE 0 END), 0), \
                     COALESCE(SUM(CASE WHEN created_at >= ? THEN 1 ELSE 0 END), 0) \
                     FROM backups WHERE status != 'deleted'",
                )
                .bind(day_ago)
                .bind(week_ago)
                .fetch_one(pool)
                .await?;
                Ok(StatsPart::Recent { last_24h, last_7d })
            }
            .boxed(),
            async move {
                let (local, s3) = sqlx::query_as::<_, (i64, i64)>(
                    "SELECT COALESCE(SUM(CASE WHEN status = 'success' THEN size ELSE 0 END), 0), \
                     COALESCE(SUM(CASE WHEN status != 'deleted' AND s3_upload_status = 'success' \
                     THEN size ELSE 0 END), 0) FROM backups",
                )
                .fetch_one(pool)
                .await?;
                Ok(StatsPart::Sizes { local, s3 })
            }
            .boxed(),
            async move {
                let last: Option<i64> = sqlx::query_scalar(
                    "SELECT MAX(completed_at) FROM backups WHERE status = 'success'",
                )
                .fetch_one(pool)
                .await?;
                Ok(StatsPart::LastSuccess(last))
            }
            .boxed(),
        ];

        let mut stats = BackupStats::default();
        for part in try_join_all(queries).await? {
            part.merge_into(&mut stats)?;
        }
        Ok(stats)
    }
}
