//! Status Reporter
//!
//! Sammelt die Ergebnisse aller Operationen eines Laufs. Reports werden als
//! Text (über die UI) oder als JSON ausgegeben und verändern keinen Zustand.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::reconcile::{Operation, OperationId};
use crate::runtime::{RuntimeError, RuntimeErrorKind};
use crate::state::{ActualState, ContainerStatus, HealthStatus, QueryError};

/// Ergebnis einer Operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Applied,
    /// Nichts zu tun (z.B. Ressource existierte bereits)
    Unchanged,
    Failed,
    /// Eine Abhängigkeit ist fehlgeschlagen
    SkippedDependencyFailed,
    /// Nicht gestartet wegen Abbruch
    Cancelled,
    /// Dry run
    Planned,
}

impl OperationStatus {
    /// Abhängige Operationen dürfen starten.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Applied | Self::Unchanged)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::SkippedDependencyFailed => "skipped-dependency-failed",
            Self::Cancelled => "cancelled",
            Self::Planned => "planned",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ursache eines Fehlschlags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCause {
    /// Vorübergehender Fehler, Wiederholungen erschöpft
    Transient,
    Fatal,
    HealthCheckTimeout,
    /// Die Ressource konnte nicht inspiziert werden
    Inspection,
}

impl FailureCause {
    pub fn from_runtime(kind: RuntimeErrorKind) -> Self {
        match kind {
            RuntimeErrorKind::Transient => Self::Transient,
            _ => Self::Fatal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::HealthCheckTimeout => "health-check-timeout",
            Self::Inspection => "inspection",
        }
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// OperationResult: Ergebnis einer einzelnen Operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    /// `None` bei fehlgeschlagener Inspektion (keine Operation geplant)
    pub id: Option<OperationId>,
    pub action: String,
    pub resource: String,
    pub description: String,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl OperationResult {
    fn for_operation(op: &Operation, status: OperationStatus) -> Self {
        Self {
            id: Some(op.id),
            action: op.kind.action().to_string(),
            resource: op.kind.resource(),
            description: op.to_string(),
            status,
            cause: None,
            error: None,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn planned(op: &Operation) -> Self {
        Self::for_operation(op, OperationStatus::Planned)
    }

    pub fn cancelled(op: &Operation) -> Self {
        Self::for_operation(op, OperationStatus::Cancelled)
    }

    pub fn skipped(op: &Operation, failed_dependency: OperationId) -> Self {
        Self {
            error: Some(format!("dependency {} did not succeed", failed_dependency)),
            ..Self::for_operation(op, OperationStatus::SkippedDependencyFailed)
        }
    }

    pub fn succeeded(op: &Operation, status: OperationStatus, attempts: u32, duration: Duration) -> Self {
        Self {
            attempts,
            duration,
            ..Self::for_operation(op, status)
        }
    }

    pub fn failed(
        op: &Operation,
        cause: FailureCause,
        error: impl Into<String>,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            cause: Some(cause),
            error: Some(error.into()),
            attempts,
            duration,
            ..Self::for_operation(op, OperationStatus::Failed)
        }
    }

    pub fn runtime_failure(op: &Operation, error: &RuntimeError, attempts: u32, duration: Duration) -> Self {
        Self::failed(op, FailureCause::from_runtime(error.kind), error.message.clone(), attempts, duration)
    }

    /// Eine Ressource deren Ist-Zustand nicht gelesen werden konnte.
    pub fn inspection_failed(error: &QueryError) -> Self {
        Self {
            id: None,
            action: "inspect".to_string(),
            resource: error.resource(),
            description: format!("inspect {}", error.resource()),
            status: OperationStatus::Failed,
            cause: Some(FailureCause::Inspection),
            error: Some(error.message.clone()),
            attempts: 1,
            duration: Duration::ZERO,
        }
    }
}

/// Anzahl Ergebnisse je Status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub applied: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub planned: usize,
}

impl StatusCounts {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a OperationResult>) -> Self {
        let mut counts = Self::default();
        for result in results {
            match result.status {
                OperationStatus::Applied => counts.applied += 1,
                OperationStatus::Unchanged => counts.unchanged += 1,
                OperationStatus::Failed => counts.failed += 1,
                OperationStatus::SkippedDependencyFailed => counts.skipped += 1,
                OperationStatus::Cancelled => counts.cancelled += 1,
                OperationStatus::Planned => counts.planned += 1,
            }
        }
        counts
    }

    fn add(&mut self, other: &StatusCounts) {
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.cancelled += other.cancelled;
        self.planned += other.planned;
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.planned > 0 {
            return write!(f, "{} planned", self.planned);
        }
        write!(
            f,
            "{} applied, {} unchanged, {} failed, {} skipped, {} cancelled",
            self.applied, self.unchanged, self.failed, self.skipped, self.cancelled
        )
    }
}

/// Laufzeitinformationen eines Containers für die Info-Phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub health: HealthStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub containers: Vec<ContainerInfo>,
    pub networks: Vec<String>,
}

impl HostInfo {
    pub fn from_state(state: &ActualState) -> Self {
        Self {
            containers: state
                .containers
                .values()
                .map(|c| ContainerInfo {
                    name: c.name.clone(),
                    image: c.image.clone(),
                    status: c.status.clone(),
                    health: c.health,
                })
                .collect(),
            networks: state.networks.keys().cloned().collect(),
        }
    }
}

/// Ergebnis eines Laufs für einen Host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReport {
    pub host: String,
    pub dry_run: bool,
    /// Gesetzt wenn Laden oder Validierung fehlschlug; dann gibt es keine Operationen
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    pub summary: StatusCounts,
    pub operations: Vec<OperationResult>,
    /// Ressourcen die bereits passten
    pub in_sync: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Abweichungen die nach dem Lauf noch bestehen
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verification: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<HostInfo>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl HostReport {
    pub fn new(host: impl Into<String>, dry_run: bool) -> Self {
        Self {
            host: host.into(),
            dry_run,
            validation_error: None,
            summary: StatusCounts::default(),
            operations: Vec::new(),
            in_sync: Vec::new(),
            warnings: Vec::new(),
            verification: Vec::new(),
            info: None,
            duration: Duration::ZERO,
        }
    }

    /// Report für einen Host dessen Deklaration ungültig ist.
    pub fn invalid(host: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            validation_error: Some(error.to_string()),
            ..Self::new(host, false)
        }
    }

    /// Berechnet die Zusammenfassung und setzt die Dauer.
    pub fn finish(mut self, duration: Duration) -> Self {
        self.summary = StatusCounts::from_results(&self.operations);
        self.duration = duration;
        self
    }

    pub fn is_invalid(&self) -> bool {
        self.validation_error.is_some()
    }

    pub fn has_failures(&self) -> bool {
        self.is_invalid()
            || self
                .operations
                .iter()
                .any(|r| matches!(r.status, OperationStatus::Failed | OperationStatus::SkippedDependencyFailed))
            || !self.verification.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperationResult> {
        self.operations
            .iter()
            .filter(|r| r.status == OperationStatus::Failed)
    }

    pub fn result_for(&self, resource: &str) -> Option<&OperationResult> {
        self.operations.iter().find(|r| r.resource == resource)
    }
}

/// Zusammengefasste Reports aller Hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetReport {
    pub hosts: Vec<HostReport>,
    pub summary: StatusCounts,
    /// Fehler außerhalb einzelner Hosts
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl FleetReport {
    pub fn new(hosts: Vec<HostReport>, errors: Vec<String>, duration: Duration) -> Self {
        let mut summary = StatusCounts::default();
        for host in &hosts {
            summary.add(&host.summary);
        }
        Self {
            hosts,
            summary,
            errors,
            duration,
        }
    }

    pub fn host(&self, name: &str) -> Option<&HostReport> {
        self.hosts.iter().find(|h| h.host == name)
    }

    /// 0 bei Erfolg, 2 bei ungültiger Konfiguration, sonst 1.
    pub fn exit_code(&self) -> i32 {
        if self.hosts.iter().any(HostReport::is_invalid) {
            2
        } else if !self.errors.is_empty() || self.hosts.iter().any(HostReport::has_failures) {
            1
        } else {
            0
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let invalid = self.hosts.iter().filter(|h| h.is_invalid()).count();
        write!(
            f,
            "{} host(s): {} ({:.1}s)",
            self.hosts.len(),
            self.summary,
            self.duration.as_secs_f64()
        )?;
        if invalid > 0 {
            write!(f, ", {} invalid", invalid)?;
        }
        Ok(())
    }
}
