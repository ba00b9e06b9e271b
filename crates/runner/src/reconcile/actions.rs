//! Operations - Aktionen die vom Reconciler abgeleitet werden
//!
//! Operations sind die Ausgabe der reconcile() Funktion und beschreiben
//! was der Executor tun soll. Jede Operation hat eine Id und die Ids der
//! Operationen auf die sie warten muss.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use podfleet_config::{Container, Directory, HealthCheck, Network};
use serde::Serialize;

use super::drift::Drift;
use crate::runtime::ContainerUpdate;
use crate::state::QueryError;

/// Id einer Operation innerhalb eines Plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OperationId(pub usize);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ausführungsphasen. Ein Lauf kann auf einzelne Phasen beschränkt werden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Directories,
    Networks,
    Containers,
    HealthCheck,
    Verification,
    Info,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Directories,
        Phase::Networks,
        Phase::Containers,
        Phase::HealthCheck,
        Phase::Verification,
        Phase::Info,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Directories => "directories",
            Self::Networks => "networks",
            Self::Containers => "containers",
            Self::HealthCheck => "health-check",
            Self::Verification => "verification",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<_> = Phase::ALL.iter().map(|p| p.as_str()).collect();
                format!("unknown phase '{}' (expected one of: {})", s, valid.join(", "))
            })
    }
}

/// Menge der aktiven Phasen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSet(BTreeSet<Phase>);

impl PhaseSet {
    pub fn all() -> Self {
        Self(Phase::ALL.into_iter().collect())
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.0.contains(&phase)
    }
}

impl Default for PhaseSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<Phase> for PhaseSet {
    fn from_iter<T: IntoIterator<Item = Phase>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Warum ein Container entfernt wird.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoveReason {
    /// Deklariert mit `state: absent`
    Absent,
    /// Nicht mehr deklariert, `prune` ist aktiv
    Pruned,
}

/// Was eine Operation tut.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    CreateNetwork {
        network: Network,
    },
    /// Verzeichnis anlegen oder Modus/Besitzer korrigieren
    EnsureDirectory {
        directory: Directory,
        exists: bool,
    },
    /// Container erstellen und in den deklarierten Zustand bringen
    CreateContainer {
        container: Container,
    },
    /// Netzwerke oder Restart-Policy ohne Neuerstellung ändern
    UpdateContainer {
        name: String,
        update: ContainerUpdate,
    },
    /// Container entfernen und neu erstellen
    RecreateContainer {
        container: Container,
        drift: Vec<Drift>,
    },
    RemoveContainer {
        name: String,
        reason: RemoveReason,
    },
    StartContainer {
        name: String,
    },
    StopContainer {
        name: String,
    },
    /// Pausierten Container fortsetzen
    UnpauseContainer {
        name: String,
    },
    /// Neustart eines laufenden, aber unhealthy Containers
    RestartContainer {
        name: String,
    },
}

impl OperationKind {
    /// Kurzname der Aktion (`create-container`).
    pub fn action(&self) -> &'static str {
        match self {
            Self::CreateNetwork { .. } => "create-network",
            Self::EnsureDirectory { .. } => "ensure-directory",
            Self::CreateContainer { .. } => "create-container",
            Self::UpdateContainer { .. } => "update-container",
            Self::RecreateContainer { .. } => "recreate-container",
            Self::RemoveContainer { .. } => "remove-container",
            Self::StartContainer { .. } => "start-container",
            Self::StopContainer { .. } => "stop-container",
            Self::UnpauseContainer { .. } => "unpause-container",
            Self::RestartContainer { .. } => "restart-container",
        }
    }

    /// Schlüssel der betroffenen Ressource (`container/web`).
    pub fn resource(&self) -> String {
        match self {
            Self::CreateNetwork { network } => format!("network/{}", network.name),
            Self::EnsureDirectory { directory, .. } => {
                format!("directory/{}", directory.path.display())
            }
            Self::CreateContainer { container } | Self::RecreateContainer { container, .. } => {
                format!("container/{}", container.name)
            }
            Self::UpdateContainer { name, .. }
            | Self::RemoveContainer { name, .. }
            | Self::StartContainer { name }
            | Self::StopContainer { name }
            | Self::UnpauseContainer { name }
            | Self::RestartContainer { name } => format!("container/{}", name),
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::CreateNetwork { .. } => Phase::Networks,
            Self::EnsureDirectory { .. } => Phase::Directories,
            _ => Phase::Containers,
        }
    }

    /// Ergänzende Beschreibung für die Ausgabe.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::EnsureDirectory { directory, exists } => Some(format!(
                "{} mode {}",
                if *exists { "fix" } else { "create" },
                directory.mode
            )),
            Self::CreateContainer { container } => Some(container.image.clone()),
            Self::UpdateContainer { update, .. } => Some(update.to_string()),
            Self::RecreateContainer { drift, .. } => Some(
                drift
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            Self::RemoveContainer { reason, .. } => Some(
                match reason {
                    RemoveReason::Absent => "declared absent",
                    RemoveReason::Pruned => "no longer declared",
                }
                .to_string(),
            ),
            _ => None,
        }
    }
}

/// Eine geplante Operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Operationen die vorher erfolgreich sein müssen
    pub depends_on: Vec<OperationId>,
    /// Readiness-Probe nach dem Start des Containers
    pub health_check: Option<HealthCheck>,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.action(), self.kind.resource())?;
        if let Some(detail) = self.kind.detail() {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Ein ReconciliationPlan: geordnete Operationen für einen Host.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub host: String,
    operations: Vec<Operation>,
    /// Ressourcen die bereits dem Soll-Zustand entsprechen
    pub in_sync: Vec<String>,
    /// Abfragefehler aus der Inspektion; diese Ressourcen haben keine Operation
    pub query_errors: Vec<QueryError>,
    /// Hinweise (z.B. übersprungenes Pruning)
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Fügt eine Operation hinzu und gibt ihre Id zurück.
    pub fn push(&mut self, kind: OperationKind, depends_on: Vec<OperationId>) -> OperationId {
        let id = OperationId(self.operations.len());
        self.operations.push(Operation {
            id,
            kind,
            depends_on,
            health_check: None,
        });
        id
    }

    /// Wie [`Plan::push`], mit Readiness-Probe.
    pub fn push_checked(
        &mut self,
        kind: OperationKind,
        depends_on: Vec<OperationId>,
        health_check: Option<HealthCheck>,
    ) -> OperationId {
        let id = self.push(kind, depends_on);
        self.operations[id.0].health_check = health_check;
        id
    }

    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Beschreibungen aller Operationen, in Planreihenfolge.
    pub fn descriptions(&self) -> Vec<String> {
        self.operations.iter().map(ToString::to_string).collect()
    }

    /// Behält nur Operationen der aktiven Phasen. Abhängigkeiten auf
    /// entfernte Operationen gelten als erfüllt.
    pub fn only_phases(mut self, phases: &PhaseSet) -> Self {
        self.operations.retain(|op| phases.contains(op.kind.phase()));
        let kept: BTreeSet<OperationId> = self.operations.iter().map(|op| op.id).collect();
        for op in &mut self.operations {
            op.depends_on.retain(|dep| kept.contains(dep));
        }
        self
    }
}
