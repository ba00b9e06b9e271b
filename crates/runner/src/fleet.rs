//! Fleet-Läufe: alle ausgewählten Hosts parallel.
//!
//! Jeder Host läuft in einem eigenen Task. Ein Host mit ungültiger
//! Deklaration oder fehlgeschlagenen Operationen hält die anderen nicht auf.

use std::sync::Arc;
use std::time::Instant;

use podfleet_config::{DiscoveredHost, HostProfile, RuntimeConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::hostfs::{HostFilesystem, LocalFilesystem, NoTransport};
use crate::report::{FleetReport, HostReport};
use crate::runtime::{ContainerRuntime, PodmanCli};
use crate::ui::{ChannelUI, RunUI, UiEvent};
use crate::{run_host, RunOptions};

/// Stellt Runtime und Dateisystem für einen Host bereit.
pub trait HostConnector: Send + Sync {
    fn runtime(&self, profile: &HostProfile) -> Arc<dyn ContainerRuntime>;
    fn filesystem(&self, profile: &HostProfile) -> Arc<dyn HostFilesystem>;
}

/// Podman-CLI; `connection` aus dem Profil wird als `--connection` genutzt.
/// Verzeichnisse werden nur ohne `connection` verwaltet (lokaler Host).
pub struct PodmanConnector {
    pub runtime: RuntimeConfig,
}

impl HostConnector for PodmanConnector {
    fn runtime(&self, profile: &HostProfile) -> Arc<dyn ContainerRuntime> {
        Arc::new(PodmanCli::from_config(&self.runtime, profile.connection.clone()))
    }

    fn filesystem(&self, profile: &HostProfile) -> Arc<dyn HostFilesystem> {
        match &profile.connection {
            Some(connection) => Arc::new(NoTransport {
                connection: connection.clone(),
            }),
            None => Arc::new(LocalFilesystem),
        }
    }
}

/// Konvergiert alle `hosts` parallel. Reports sind nach Hostname sortiert.
pub async fn run_fleet<U: RunUI + ?Sized>(
    hosts: Vec<DiscoveredHost>,
    connector: Arc<dyn HostConnector>,
    options: Arc<RunOptions>,
    cancel: watch::Receiver<bool>,
    ui: &mut U,
) -> FleetReport {
    let started = Instant::now();
    let (tx, mut rx) = mpsc::unbounded_channel::<UiEvent>();
    let mut tasks: JoinSet<HostReport> = JoinSet::new();
    let mut reports = Vec::new();
    let mut errors = Vec::new();

    for host in hosts {
        let profile = match host.load() {
            Ok(profile) => profile,
            Err(e) => {
                warn!(host = %host.name, error = %e, "host declaration invalid");
                let report = HostReport::invalid(&host.name, &e);
                ui.on_host_complete(&report);
                reports.push(report);
                continue;
            }
        };

        let connector = connector.clone();
        let options = options.clone();
        let cancel = cancel.clone();
        let mut host_ui = ChannelUI::new(tx.clone());
        tasks.spawn(async move {
            let runtime = connector.runtime(&profile);
            let fs = connector.filesystem(&profile);
            run_host(&profile, runtime, fs, &options, cancel, &mut host_ui).await
        });
    }
    drop(tx);

    // Events weiterleiten bis alle Host-Tasks ihren Sender fallen gelassen haben
    while let Some(event) = rx.recv().await {
        event.dispatch(ui);
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!(error = %e, "host task failed");
                errors.push(format!("host task failed: {}", e));
            }
        }
    }

    reports.sort_by(|a, b| a.host.cmp(&b.host));
    FleetReport::new(reports, errors, started.elapsed())
}
