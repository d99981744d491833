use chrono::Local;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Plain-text log of one backup attempt, kept next to the other attempt logs
/// so operators can read what happened without the service logs.
pub(crate) struct RunLog {
    path: Option<PathBuf>,
    file: Option<File>,
}

impl RunLog {
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    /// Opens `<dir>/<file_name>`; a failure only disables the log.
    pub fn open(dir: Option<&Path>, file_name: &str) -> Self {
        let Some(dir) = dir else {
            return Self::disabled();
        };
        let path = dir.join(file_name);
        let opened = std::fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(file) => Self {
                path: Some(path),
                file: Some(file),
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open backup log file");
                Self::disabled()
            }
        }
    }

    pub fn path(&self) -> Option<String> {
        self.path.as_ref().map(|p| p.to_string_lossy().into_owned())
    }

    pub fn line(&mut self, message: impl Display) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(file, "{} {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message) {
            warn!(error = %e, "Backup log write failed, disabling it");
            self.file = None;
        }
    }
}
