use async_trait::async_trait;
use sqlx::{Connection, MySqlConnection, Row};
use std::io::Write;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DumpOptions, Provider, connection_url, find_executable, stream_command};
use crate::config::DatabaseServer;
use crate::errors::{BackupError, Result};

const DEFAULT_PORT: u16 = 3306;
const SYSTEM_DATABASES: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

/// Dumps MySQL and MariaDB databases with `mysqldump`.
pub struct MySqlProvider {
    server: DatabaseServer,
    admin: Option<MySqlConnection>,
}

impl MySqlProvider {
    pub fn new(server: DatabaseServer) -> Self {
        Self { server, admin: None }
    }

    fn dump_command(&self, database: &str, options: &DumpOptions) -> Result<Command> {
        let port = if self.server.port == 0 { DEFAULT_PORT } else { self.server.port };
        let mut command = Command::new(find_executable("mysqldump")?);
        command
            .arg(format!("--host={}", self.server.host))
            .arg(format!("--port={}", port))
            .arg("--single-transaction")
            .arg("--routines")
            .arg("--triggers");
        if !self.server.username.is_empty() {
            command.arg(format!("--user={}", self.server.username));
        }
        if options.schema_only {
            command.arg("--no-data");
        }
        for table in &options.exclude_tables {
            command.arg(format!("--ignore-table={}.{}", database, table));
        }
        command.arg(database);
        // Tables after the database name restrict the dump to them.
        for table in &options.include_tables {
            command.arg(table);
        }
        if !self.server.password.is_empty() {
            command.env("MYSQL_PWD", &self.server.password);
        }
        Ok(command)
    }
}

#[async_trait]
impl Provider for MySqlProvider {
    fn engine(&self) -> &'static str {
        "mysql"
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        let url = connection_url("mysql", &self.server, DEFAULT_PORT, "")?;
        let connection = tokio::select! {
            connection = MySqlConnection::connect(&url) => connection.map_err(|e| BackupError::Connection {
                server: self.server.name.clone(),
                message: e.to_string(),
            })?,
            _ = cancel.cancelled() => {
                return Err(BackupError::Cancelled(format!("connecting to {}", self.server.name)));
            }
        };
        info!(server = %self.server.name, host = %self.server.host, "Connected to MySQL server");
        self.admin = Some(connection);
        Ok(())
    }

    async fn list_databases(&mut self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let server = self.server.name.clone();
        let conn = self.admin.as_mut().ok_or_else(|| BackupError::Connection {
            server: server.clone(),
            message: "not connected".to_string(),
        })?;

        let rows = tokio::select! {
            rows = sqlx::query("SHOW DATABASES").fetch_all(&mut *conn) => rows?,
            _ = cancel.cancelled() => {
                return Err(BackupError::Cancelled(format!("listing databases on {}", server)));
            }
        };

        let mut databases = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get(0)?;
            if !SYSTEM_DATABASES.contains(&name.as_str()) {
                databases.push(name);
            }
        }
        databases.sort();
        debug!(server = %server, count = databases.len(), "Listed MySQL databases");
        Ok(databases)
    }

    async fn backup(
        &mut self,
        cancel: &CancellationToken,
        database: &str,
        output: &mut (dyn Write + Send),
        options: &DumpOptions,
    ) -> Result<u64> {
        let command = self.dump_command(database, options)?;
        stream_command(command, cancel, output, "mysqldump").await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(connection) = self.admin.take() {
            connection.close().await?;
        }
        Ok(())
    }
}
