//! Runtime Module - abstrahiert die Container-Runtime
//!
//! [`ContainerRuntime`] ist die einzige Stelle an der podfleet mit der
//! Runtime spricht. [`PodmanCli`] ist die echte Implementierung über die
//! Podman-CLI, `test_utils::MockRuntime` die für Tests.

mod podman;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use podfleet_config::{Container, HealthProbe, Network, RestartPolicy};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::state::{ActualContainer, ActualNetwork};

pub use podman::{classify_failure, PodmanCli};

/// Wie lange ein einzelner TCP-Probe auf den Verbindungsaufbau wartet.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Klassifikation eines Runtime-Fehlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// Vorübergehend (Timeout, Lock, Verbindungsabbruch) - wird wiederholt
    Transient,
    /// Dauerhaft - die Operation schlägt fehl
    Fatal,
    /// Die Ressource existiert bereits
    AlreadyExists,
    /// Die Ressource existiert nicht
    NotFound,
    /// Die Runtime unterstützt die Operation nicht
    NotSupported,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::AlreadyExists => "already exists",
            Self::NotFound => "not found",
            Self::NotSupported => "not supported",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Fatal, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::AlreadyExists, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::NotFound, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::NotSupported, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RuntimeErrorKind::Transient
    }
}

/// Kurzinfo aus der Container-Liste.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSummary {
    pub fn is_managed_by(&self, profile: &str) -> bool {
        crate::state::owned_by(&self.labels, profile)
    }
}

/// Änderungen die ohne Neuerstellung angewendet werden können.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerUpdate {
    pub connect: Vec<String>,
    pub disconnect: Vec<String>,
    pub restart_policy: Option<RestartPolicy>,
}

impl fmt::Display for ContainerUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.connect.is_empty() {
            parts.push(format!("connect {}", self.connect.join(",")));
        }
        if !self.disconnect.is_empty() {
            parts.push(format!("disconnect {}", self.disconnect.join(",")));
        }
        if let Some(policy) = self.restart_policy {
            parts.push(format!("restart={}", policy.as_str()));
        }
        f.write_str(&parts.join(", "))
    }
}

/// Trait für Operationen auf der Container-Runtime.
/// Ermöglicht Mocking für Tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Listet alle Container (auch gestoppte) auf
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Inspiziert einen Container. `None` wenn er nicht existiert.
    async fn inspect_container(&self, name: &str) -> Result<Option<ActualContainer>, RuntimeError>;

    /// Listet alle Netzwerke auf
    async fn list_networks(&self) -> Result<Vec<ActualNetwork>, RuntimeError>;

    async fn create_network(&self, network: &Network) -> Result<(), RuntimeError>;

    /// Erstellt einen Container ohne ihn zu starten
    async fn create_container(
        &self,
        container: &Container,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), RuntimeError>;

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Setzt einen pausierten Container fort
    async fn unpause_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Entfernt einen Container, laufende werden vorher gestoppt
    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Kann die Runtime Netzwerke und Restart-Policy ohne Neuerstellung ändern?
    fn supports_update(&self) -> bool {
        false
    }

    async fn update_container(
        &self,
        name: &str,
        update: &ContainerUpdate,
    ) -> Result<(), RuntimeError> {
        let _ = update;
        Err(RuntimeError::not_supported(format!(
            "in-place update of '{}' is not supported",
            name
        )))
    }

    async fn restart_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.stop_container(name).await?;
        self.start_container(name).await
    }

    /// Führt einen Readiness-Probe aus. `Ok(false)` heißt: noch nicht bereit.
    async fn probe(&self, container: &str, probe: &HealthProbe) -> Result<bool, RuntimeError>;
}

/// TCP-Connect gegen `host:port`.
pub async fn tcp_probe(host: &str, port: u16) -> bool {
    matches!(
        timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
