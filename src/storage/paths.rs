use chrono::{DateTime, TimeZone};
use std::path::{Path, PathBuf};

pub const SCHEME_BY_SERVER: &str = "by-server";
pub const SCHEME_BY_TYPE: &str = "by-type";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
pub const DUMP_EXTENSION: &str = ".sql.gz";

/// The two relative locations of one logical backup artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPaths {
    pub server: String,
    pub backup_type: String,
    pub database: String,
    pub timestamp: String,
}

impl BackupPaths {
    pub fn new(server: &str, backup_type: &str, database: &str, timestamp: &str) -> Self {
        Self {
            server: server.to_string(),
            backup_type: backup_type.to_string(),
            database: database.to_string(),
            timestamp: timestamp.to_string(),
        }
    }

    pub fn at<Tz: TimeZone>(server: &str, backup_type: &str, database: &str, at: &DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        Self::new(server, backup_type, database, &at.format(TIMESTAMP_FORMAT).to_string())
    }

    /// `by-server/<server>/<type>/<db>-<ts>.sql.gz`
    pub fn by_server(&self) -> String {
        format!(
            "{}/{}/{}/{}-{}{}",
            SCHEME_BY_SERVER, self.server, self.backup_type, self.database, self.timestamp, DUMP_EXTENSION
        )
    }

    /// `by-type/<type>/<server>_<db>-<ts>.sql.gz`
    pub fn by_type(&self) -> String {
        format!(
            "{}/{}/{}_{}-{}{}",
            SCHEME_BY_TYPE, self.backup_type, self.server, self.database, self.timestamp, DUMP_EXTENSION
        )
    }

    /// Both variants as `(scheme, relative path)`, primary first.
    pub fn variants(&self) -> [(&'static str, String); 2] {
        [(SCHEME_BY_SERVER, self.by_server()), (SCHEME_BY_TYPE, self.by_type())]
    }

    pub fn local(&self, root: &Path, scheme: &str) -> PathBuf {
        let relative = if scheme == SCHEME_BY_TYPE { self.by_type() } else { self.by_server() };
        root.join(relative)
    }

    pub fn log_file_name(&self) -> String {
        format!("{}_{}-{}.log", self.server, self.database, self.timestamp)
    }
}

/// Normalizes an object-key prefix to either "" or "<prefix>/".
pub fn normalize_prefix(prefix: Option<&str>) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{}/", p),
        _ => String::new(),
    }
}

/// Splits a relative artifact path into its organization scheme and backup
/// type. Anything that is not a dump under a known scheme yields `None`.
pub fn classify(relative: &str) -> Option<(&'static str, &str)> {
    if !relative.ends_with(DUMP_EXTENSION) {
        return None;
    }
    let parts: Vec<&str> = relative.split('/').collect();
    match parts.as_slice() {
        [SCHEME_BY_SERVER, _server, backup_type, _file] => Some((SCHEME_BY_SERVER, *backup_type)),
        [SCHEME_BY_TYPE, backup_type, _file] => Some((SCHEME_BY_TYPE, *backup_type)),
        _ => None,
    }
}
