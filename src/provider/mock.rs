use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{DumpOptions, Provider, ProviderFactory};
use crate::config::DatabaseServer;
use crate::errors::{BackupError, Result};

/// What a scripted server does when asked to connect, list or dump.
#[derive(Debug, Clone, Default)]
pub(crate) struct ServerScript {
    pub connect_error: Option<String>,
    pub databases: Vec<String>,
    /// Database -> dump failure message.
    pub failing_dumps: HashMap<String, String>,
    /// Dump body; defaults to a small SQL script naming the database.
    pub dump_body: Option<Vec<u8>>,
    /// Databases whose dump writes a first chunk and then hangs until
    /// cancelled, like a long-running dump process.
    pub hanging_dumps: HashSet<String>,
}

/// Hands out providers that replay a [`ServerScript`] per server name and
/// records every dump request.
#[derive(Default, Clone)]
pub(crate) struct ScriptedFactory {
    scripts: HashMap<String, ServerScript>,
    pub dumped: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedFactory {
    pub fn with_server(mut self, server: &str, script: ServerScript) -> Self {
        self.scripts.insert(server.to_string(), script);
        self
    }

    pub fn dumped(&self) -> Vec<(String, String)> {
        self.dumped.lock().clone()
    }
}

impl ProviderFactory for ScriptedFactory {
    fn create(&self, server: &DatabaseServer) -> Result<Box<dyn Provider>> {
        if server.engine == "unsupported" {
            return Err(BackupError::Configuration(format!(
                "server '{}' uses unsupported engine 'unsupported'",
                server.name
            )));
        }
        Ok(Box::new(ScriptedProvider {
            server: server.name.clone(),
            script: self.scripts.get(&server.name).cloned().unwrap_or_default(),
            dumped: self.dumped.clone(),
        }))
    }
}

pub(crate) struct ScriptedProvider {
    server: String,
    script: ServerScript,
    dumped: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&mut self, _cancel: &CancellationToken) -> Result<()> {
        match &self.script.connect_error {
            Some(message) => Err(BackupError::Connection {
                server: self.server.clone(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn list_databases(&mut self, _cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(self.script.databases.clone())
    }

    async fn backup(
        &mut self,
        cancel: &CancellationToken,
        database: &str,
        output: &mut (dyn Write + Send),
        _options: &DumpOptions,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled(format!("dump of {}", database)));
        }
        self.dumped.lock().push((self.server.clone(), database.to_string()));
        if let Some(message) = self.script.failing_dumps.get(database) {
            output.write_all(b"-- partial")?;
            return Err(BackupError::Dump(message.clone()));
        }
        if self.script.hanging_dumps.contains(database) {
            output.write_all(b"-- first chunk\n")?;
            cancel.cancelled().await;
            return Err(BackupError::Cancelled(format!("dump of {}", database)));
        }
        let body = self
            .script
            .dump_body
            .clone()
            .unwrap_or_else(|| format!("-- dump of {}\nCREATE TABLE t (id int);\n", database).into_bytes());
        output.write_all(&body)?;
        Ok(body.len() as u64)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
