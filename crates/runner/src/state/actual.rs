//! Actual State - was die Runtime tatsächlich meldet
//!
//! Der ActualState wird vom Inspector durch Abfrage der Container-Runtime und
//! des Host-Dateisystems ermittelt. Er kann unvollständig sein: fehlgeschlagene
//! Abfragen landen in `errors` statt den ganzen Scan abzubrechen.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use podfleet_config::{FileMode, LABEL_MANAGED, LABEL_PROFILE, LABEL_SPEC_HASH};
use serde::Serialize;

/// Der tatsächliche Zustand eines Hosts.
#[derive(Debug, Clone, Default)]
pub struct ActualState {
    /// Inspizierte Container, nach Namen
    pub containers: BTreeMap<String, ActualContainer>,
    /// Existierende Netzwerke, nach Namen
    pub networks: BTreeMap<String, ActualNetwork>,
    /// Deklarierte Verzeichnisse; `None` wenn das Verzeichnis fehlt
    pub directories: BTreeMap<PathBuf, Option<DirectoryStat>>,
    /// Fehler einzelner Abfragen
    pub errors: Vec<QueryError>,
    /// `false` wenn eine Listen-Abfrage fehlgeschlagen ist
    pub complete: bool,
}

impl ActualState {
    /// Leerer, vollständiger Zustand (nichts existiert).
    pub fn empty() -> Self {
        Self {
            complete: true,
            ..Self::default()
        }
    }

    pub fn container(&self, name: &str) -> Option<&ActualContainer> {
        self.containers.get(name)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.networks.contains_key(name)
    }

    /// Prüft ob die Abfrage einer Ressource fehlgeschlagen ist.
    pub fn query_failed(&self, kind: ResourceKind, name: &str) -> bool {
        self.errors.iter().any(|e| e.kind == kind && e.name == name)
    }
}

/// Ein existierender Container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualContainer {
    pub name: String,
    /// Image-Referenz wie von der Runtime gemeldet
    pub image: String,
    pub status: ContainerStatus,
    pub health: HealthStatus,
    pub labels: BTreeMap<String, String>,
    /// Name der Restart-Policy wie von der Runtime gemeldet
    pub restart_policy: String,
    /// Netzwerke denen der Container angehört
    pub networks: BTreeSet<String>,
}

impl ActualContainer {
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    /// Der gespeicherte Spec-Hash, falls der Container von podfleet erstellt wurde.
    pub fn spec_hash(&self) -> Option<&str> {
        self.labels.get(LABEL_SPEC_HASH).map(String::as_str)
    }

    /// Gehört der Container zum angegebenen Host-Profil?
    pub fn is_managed_by(&self, profile: &str) -> bool {
        owned_by(&self.labels, profile)
    }
}

/// Tragen die Labels das Besitz-Label von `profile`?
pub fn owned_by(labels: &BTreeMap<String, String>, profile: &str) -> bool {
    labels.get(LABEL_MANAGED).map(String::as_str) == Some("true")
        && labels.get(LABEL_PROFILE).map(String::as_str) == Some(profile)
}

/// Laufzeitstatus eines Containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    /// created, exited, stopped, configured
    Stopped,
    Paused,
    Other(String),
}

impl ContainerStatus {
    /// Parst den `State.Status` einer Runtime.
    pub fn from_runtime(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "created" | "exited" | "stopped" | "configured" | "initialized" => Self::Stopped,
            "paused" => Self::Paused,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Paused => f.write_str("paused"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Health-Status den die Runtime selbst meldet (eigener Healthcheck im Image).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    #[default]
    None,
}

impl HealthStatus {
    pub fn from_runtime(s: &str) -> Self {
        match s {
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            "starting" => Self::Starting,
            _ => Self::None,
        }
    }
}

/// Ein existierendes Netzwerk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualNetwork {
    pub name: String,
    pub driver: Option<String>,
}

/// Modus und Besitzer eines existierenden Verzeichnisses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryStat {
    pub mode: FileMode,
    pub owner: String,
    pub group: String,
}

/// Art der Ressource bei Abfragefehlern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Container,
    Network,
    Directory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Container => "container",
            Self::Network => "network",
            Self::Directory => "directory",
        })
    }
}

/// Eine fehlgeschlagene Abfrage. `name` ist leer bei Listen-Abfragen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryError {
    pub kind: ResourceKind,
    pub name: String,
    pub message: String,
}

impl QueryError {
    /// Schlüssel der Ressource wie im Report (`container/web`).
    pub fn resource(&self) -> String {
        if self.name.is_empty() {
            format!("{}/*", self.kind)
        } else {
            format!("{}/{}", self.kind, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_with_labels(labels: &[(&str, &str)]) -> ActualContainer {
        ActualContainer {
            name: "web".to_string(),
            image: "docker.io/library/nginx:latest".to_string(),
            status: ContainerStatus::Running,
            health: HealthStatus::None,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            restart_policy: String::new(),
            networks: BTreeSet::new(),
        }
    }

    #[test]
    fn test_container_status_from_runtime() {
        assert_eq!(ContainerStatus::from_runtime("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_runtime("exited"), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::from_runtime("created"), ContainerStatus::Stopped);
        assert_eq!(
            ContainerStatus::from_runtime("removing"),
            ContainerStatus::Other("removing".to_string())
        );
    }

    #[test]
    fn test_is_managed_by_requires_both_labels() {
        let c = container_with_labels(&[(LABEL_MANAGED, "true"), (LABEL_PROFILE, "web01")]);
        assert!(c.is_managed_by("web01"));
        assert!(!c.is_managed_by("web02"));

        let foreign = container_with_labels(&[(LABEL_PROFILE, "web01")]);
        assert!(!foreign.is_managed_by("web01"));
    }

    #[test]
    fn test_query_error_resource_key() {
        let e = QueryError {
            kind: ResourceKind::Container,
            name: String::new(),
            message: "boom".to_string(),
        };
        assert_eq!(e.resource(), "container/*");
    }
}
