use async_trait::async_trait;
use sqlx::{Connection, PgConnection, Row};
use std::io::Write;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DumpOptions, Provider, connection_url, find_executable, stream_command};
use crate::config::DatabaseServer;
use crate::errors::{BackupError, Result};

const DEFAULT_PORT: u16 = 5432;

/// Dumps PostgreSQL databases with `pg_dump` in plain SQL format.
pub struct PostgresProvider {
    server: DatabaseServer,
    admin: Option<PgConnection>,
}

impl PostgresProvider {
    pub fn new(server: DatabaseServer) -> Self {
        Self { server, admin: None }
    }

    fn port(&self) -> u16 {
        if self.server.port == 0 { DEFAULT_PORT } else { self.server.port }
    }

    fn dump_command(&self, database: &str, options: &DumpOptions) -> Result<Command> {
        let mut command = Command::new(find_executable("pg_dump")?);
        command
            .arg("--host")
            .arg(&self.server.host)
            .arg("--port")
            .arg(self.port().to_string())
            .arg("--no-password")
            .arg("--dbname")
            .arg(database);
        if !self.server.username.is_empty() {
            command.arg("--username").arg(&self.server.username);
        }
        if options.schema_only {
            command.arg("--schema-only");
        }
        for table in &options.include_tables {
            command.arg("--table").arg(table);
        }
        for table in &options.exclude_tables {
            command.arg("--exclude-table").arg(table);
        }
        if !self.server.password.is_empty() {
            command.env("PGPASSWORD", &self.server.password);
        }
        Ok(command)
    }
}

#[async_trait]
impl Provider for PostgresProvider {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Result<()> {
        let url = connection_url("postgres", &self.server, DEFAULT_PORT, "postgres")?;
        let connection = tokio::select! {
            connection = PgConnection::connect(&url) => connection.map_err(|e| BackupError::Connection {
                server: self.server.name.clone(),
                message: e.to_string(),
            })?,
            _ = cancel.cancelled() => {
                return Err(BackupError::Cancelled(format!("connecting to {}", self.server.name)));
            }
        };
        info!(server = %self.server.name, host = %self.server.host, "Connected to PostgreSQL server");
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
            rows = sqlx::query(
                "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true ORDER BY datname",
            )
            .fetch_all(&mut *conn) => rows?,
            _ = cancel.cancelled() => {
                return Err(BackupError::Cancelled(format!("listing databases on {}", server)));
            }
        };

        let mut databases = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("datname")?;
            if !is_system_database(&name) {
                databases.push(name);
            }
        }
        debug!(server = %server, count = databases.len(), "Listed PostgreSQL databases");
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
        stream_command(command, cancel, output, "pg_dump").await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(connection) = self.admin.take() {
            connection.close().await?;
        }
        Ok(())
    }
}

/// Databases every cluster ships with. User databases that merely share
/// the prefix (`templates`, `template_engine`) are not among them.
fn is_system_database(name: &str) -> bool {
    matches!(name, "postgres" | "template0" | "template1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_builtin_databases_are_skipped() {
        for builtin in ["postgres", "template0", "template1"] {
            assert!(is_system_database(builtin), "{}", builtin);
        }
        for user_db in ["templates", "template_engine", "app_db", "postgres_archive"] {
            assert!(!is_system_database(user_db), "{}", user_db);
        }
    }

    fn args(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_dump_command_flags() {
        if which::which("pg_dump").is_err() {
            return;
        }
        let provider = PostgresProvider::new(DatabaseServer {
            name: "srv1".to_string(),
            engine: "postgres".to_string(),
            host: "db1".to_string(),
            username: "backup".to_string(),
            ..Default::default()
        });
        let options = DumpOptions {
            schema_only: true,
            include_tables: vec!["users".to_string()],
            exclude_tables: vec!["audit_log".to_string()],
        };
        let command = provider.dump_command("app_db", &options).unwrap();
        let args = args(&command);
        assert!(args.windows(2).any(|w| w == ["--port", "5432"]));
        assert!(args.windows(2).any(|w| w == ["--dbname", "app_db"]));
        assert!(args.contains(&"--schema-only".to_string()));
        assert!(args.windows(2).any(|w| w == ["--table", "users"]));
        assert!(args.windows(2).any(|w| w == ["--exclude-table", "audit_log"]));
    }
}
