//! Host-Dateisystem - abstrahiert Verzeichnis-Operationen auf dem Zielhost
//!
//! [`LocalFilesystem`] arbeitet über `stat`, `mkdir`, `chmod` und `chown`
//! auf dem lokalen Rechner. Für entfernte Hosts muss der Transport eine
//! eigene Implementierung bereitstellen; bis dahin verweigert
//! [`NoTransport`] jeden Zugriff.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use podfleet_config::{Directory, FileMode};
use tokio::process::Command;
use tracing::debug;

use crate::runtime::RuntimeError;
use crate::state::DirectoryStat;

#[async_trait]
pub trait HostFilesystem: Send + Sync {
    /// Modus und Besitzer eines Verzeichnisses. `None` wenn es nicht existiert.
    async fn stat_directory(&self, path: &Path) -> Result<Option<DirectoryStat>, RuntimeError>;

    /// Legt das Verzeichnis an und setzt Modus und Besitzer.
    async fn ensure_directory(&self, directory: &Directory) -> Result<(), RuntimeError>;
}

/// Verzeichnisse auf dem lokalen Rechner.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    async fn run(program: &str, args: &[&str]) -> Result<String, RuntimeError> {
        debug!(program, args = ?args, "hostfs");

        let output = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::fatal(format!("failed to execute {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.contains("No such file or directory") {
                return Err(RuntimeError::not_found(stderr.to_string()));
            }
            return Err(RuntimeError::fatal(format!("{} failed: {}", program, stderr)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl HostFilesystem for LocalFilesystem {
    async fn stat_directory(&self, path: &Path) -> Result<Option<DirectoryStat>, RuntimeError> {
        let path = path.to_string_lossy();
        match Self::run("stat", &["--format=%a %U %G %F", &path]).await {
            Ok(stdout) => parse_stat(&stdout).map(Some),
            Err(e) if e.kind == crate::runtime::RuntimeErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_directory(&self, directory: &Directory) -> Result<(), RuntimeError> {
        let path = directory.path.to_string_lossy();
        let mode = directory.mode.to_string();

        Self::run("mkdir", &["-p", &path]).await?;
        Self::run("chmod", &[&mode, &path]).await?;

        let owner = match (&directory.owner, &directory.group) {
            (Some(owner), Some(group)) => Some(format!("{}:{}", owner, group)),
            (Some(owner), None) => Some(owner.clone()),
            (None, Some(group)) => Some(format!(":{}", group)),
            (None, None) => None,
        };
        if let Some(owner) = owner {
            Self::run("chown", &[&owner, &path]).await?;
        }
        Ok(())
    }
}

/// Platzhalter für Hosts hinter einer Runtime-Verbindung, für die es keinen
/// Dateisystem-Transport gibt. Jede Abfrage schlägt fehl, statt auf dem
/// lokalen Rechner zu landen.
#[derive(Debug, Clone)]
pub struct NoTransport {
    pub connection: String,
}

impl NoTransport {
    fn error(&self) -> RuntimeError {
        RuntimeError::fatal(format!(
            "no filesystem transport for connection '{}'",
            self.connection
        ))
    }
}

#[async_trait]
impl HostFilesystem for NoTransport {
    async fn stat_directory(&self, _path: &Path) -> Result<Option<DirectoryStat>, RuntimeError> {
        Err(self.error())
    }

    async fn ensure_directory(&self, _directory: &Directory) -> Result<(), RuntimeError> {
        Err(self.error())
    }
}

/// Parst die Ausgabe von `stat --format='%a %U %G %F'`.
fn parse_stat(stdout: &str) -> Result<DirectoryStat, RuntimeError> {
    let mut parts = stdout.trim().splitn(4, ' ');
    let (Some(mode), Some(owner), Some(group), Some(kind)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RuntimeError::fatal(format!(
            "unexpected stat output: {}",
            stdout.trim()
        )));
    };

    if kind != "directory" {
        return Err(RuntimeError::fatal(format!("path exists but is a {}", kind)));
    }

    let mode = FileMode::parse(mode)
        .ok_or_else(|| RuntimeError::fatal(format!("unexpected mode from stat: {}", mode)))?;

    Ok(DirectoryStat {
        mode,
        owner: owner.to_string(),
        group: group.to_string(),
    })
}
