//! Reconcile Module - Pure Function für State Reconciliation
//!
//! Die reconcile() Funktion ist eine **pure function**:
//! - Keine Side Effects
//! - Deterministisch
//! - Perfekt testbar ohne Mocks
//!
//! Reihenfolge im Plan: Netzwerke, Verzeichnisse, Container. Container
//! kommen in Abhängigkeitsreihenfolge (Netzwerke, Volumes, `depends_on`,
//! `container:<name>`), jede Operation trägt ihre Abhängigkeiten explizit.

mod actions;
mod drift;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use podfleet_config::{
    Container, DesiredLifecycle, Directory, HostProfile, ValidationError, VolumeSource,
};

pub use actions::{
    Operation, OperationId, OperationKind, Phase, PhaseSet, Plan, RemoveReason,
};
pub use drift::{container_drift, normalize_image, Drift};

use crate::state::{
    ActualContainer, ActualState, ContainerStatus, DirectoryStat, HealthStatus, ResourceKind,
};

/// Fähigkeiten der Runtime, die den Plan beeinflussen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Netzwerke/Restart-Policy in-place ändern statt neu zu erstellen
    pub supports_update: bool,
}

/// Berechnet die Operationen, die `actual` in den Zustand von `profile` bringen.
///
/// Schlägt nur fehl wenn die Container-Abhängigkeiten einen Zyklus bilden.
/// Ressourcen deren Abfrage fehlgeschlagen ist bekommen keine Operation.
///
/// # Example
///
/// ```ignore
/// let actual = inspect_host(&profile, runtime, fs).await;
/// let plan = reconcile(&profile, &actual, &ReconcileOptions::default())?;
///
/// for op in plan.operations() {
///     println!("{}", op);
/// }
/// ```
pub fn reconcile(
    profile: &HostProfile,
    actual: &ActualState,
    options: &ReconcileOptions,
) -> Result<Plan, ValidationError> {
    let order = profile.dependency_order()?;

    let mut plan = Plan::new(&profile.name);
    plan.query_errors = actual.errors.clone();

    // 1. Netzwerke; ohne Netzwerkliste ist unbekannt, welche fehlen
    let mut network_ops: HashMap<&str, OperationId> = HashMap::new();
    let networks_known = !actual.query_failed(ResourceKind::Network, "");
    for network in profile.networks.iter().filter(|_| networks_known) {
        if actual.has_network(&network.name) {
            plan.in_sync.push(format!("network/{}", network.name));
        } else {
            let id = plan.push(
                OperationKind::CreateNetwork {
                    network: network.clone(),
                },
                Vec::new(),
            );
            network_ops.insert(&network.name, id);
        }
    }

    // 2. Verzeichnisse
    let mut directory_ops: HashMap<PathBuf, OperationId> = HashMap::new();
    for directory in &profile.directories {
        let key = directory.path.display().to_string();
        if actual.query_failed(ResourceKind::Directory, &key) {
            continue;
        }
        match actual.directories.get(&directory.path) {
            Some(Some(stat)) if directory_matches(directory, stat) => {
                plan.in_sync.push(format!("directory/{}", key));
            }
            existing => {
                let id = plan.push(
                    OperationKind::EnsureDirectory {
                        directory: directory.clone(),
                        exists: matches!(existing, Some(Some(_))),
                    },
                    Vec::new(),
                );
                directory_ops.insert(directory.path.clone(), id);
            }
        }
    }

    // 3. Container in Abhängigkeitsreihenfolge
    let mut container_ops: HashMap<&str, OperationId> = HashMap::new();
    // Container deren Voraussetzungen unbekannt sind, samt ihren Abhängigen
    let mut blocked: HashSet<&str> = HashSet::new();
    for container in order {
        if actual.query_failed(ResourceKind::Container, &container.name) {
            blocked.insert(&container.name);
            continue;
        }

        if container.state != DesiredLifecycle::Absent {
            let unknown = unknown_prerequisite(profile, actual, container, &blocked);
            if let Some(prerequisite) = unknown {
                plan.warnings.push(format!(
                    "container '{}' skipped: {} could not be inspected",
                    container.name, prerequisite
                ));
                blocked.insert(&container.name);
                continue;
            }
        }

        let mut deps: Vec<OperationId> = Vec::new();
        for network in container.network_names() {
            if let Some(&id) = network_ops.get(network.as_str()) {
                deps.push(id);
            }
        }
        for volume in &container.volumes {
            if let VolumeSource::Path(source) = &volume.source {
                if let Some(dir) = profile.directory_covering(source) {
                    if let Some(&id) = directory_ops.get(&dir.path) {
                        deps.push(id);
                    }
                }
            }
        }
        for dependency in container.dependencies() {
            if let Some(&id) = container_ops.get(dependency) {
                deps.push(id);
            }
        }
        deps.sort();
        deps.dedup();

        match plan_container(&mut plan, container, actual.container(&container.name), deps, options) {
            Some(id) => {
                container_ops.insert(&container.name, id);
            }
            None => plan.in_sync.push(format!("container/{}", container.name)),
        }
    }

    // 4. Pruning
    if profile.prune {
        if actual.complete {
            for (name, live) in &actual.containers {
                if live.is_managed_by(&profile.name) && profile.container(name).is_none() {
                    plan.push(
                        OperationKind::RemoveContainer {
                            name: name.clone(),
                            reason: RemoveReason::Pruned,
                        },
                        Vec::new(),
                    );
                }
            }
        } else {
            plan.warnings
                .push("pruning skipped: the runtime scan was incomplete".to_string());
        }
    }

    Ok(plan)
}

/// Plant die Operationen für einen Container. Gibt die Id der letzten
/// Operation zurück, auf die abhängige Container warten.
fn plan_container(
    plan: &mut Plan,
    container: &Container,
    live: Option<&ActualContainer>,
    deps: Vec<OperationId>,
    options: &ReconcileOptions,
) -> Option<OperationId> {
    let health = match container.state {
        DesiredLifecycle::Running => container.healthcheck.clone(),
        _ => None,
    };

    let live = match (container.state, live) {
        (DesiredLifecycle::Absent, None) => return None,
        (DesiredLifecycle::Absent, Some(_)) => {
            return Some(plan.push(
                OperationKind::RemoveContainer {
                    name: container.name.clone(),
                    reason: RemoveReason::Absent,
                },
                deps,
            ));
        }
        (_, None) => {
            return Some(plan.push_checked(
                OperationKind::CreateContainer {
                    container: container.clone(),
                },
                deps,
                health,
            ));
        }
        (_, Some(live)) => live,
    };

    let drift = container_drift(container, live);

    // Genau eine in-place behebbare Abweichung: Update; sonst Neuerstellung
    if let [single] = drift.as_slice() {
        if options.supports_update && single.is_updatable() {
            if let Some(update) = single.as_update() {
                let id = plan.push(
                    OperationKind::UpdateContainer {
                        name: container.name.clone(),
                        update,
                    },
                    deps,
                );
                return plan_lifecycle(plan, container, live, vec![id], health).or(Some(id));
            }
        }
    }
    if !drift.is_empty() {
        return Some(plan.push_checked(
            OperationKind::RecreateContainer {
                container: container.clone(),
                drift,
            },
            deps,
            health,
        ));
    }

    plan_lifecycle(plan, container, live, deps, health)
}

/// Start/Stop/Restart wenn die Konfiguration stimmt, der Laufzustand aber nicht.
///
/// Pausierte Container lehnen `start` und `stop` ab und werden erst fortgesetzt.
fn plan_lifecycle(
    plan: &mut Plan,
    container: &Container,
    live: &ActualContainer,
    deps: Vec<OperationId>,
    health: Option<podfleet_config::HealthCheck>,
) -> Option<OperationId> {
    let name = container.name.clone();
    if live.status == ContainerStatus::Paused {
        return match container.state {
            DesiredLifecycle::Running => Some(plan.push_checked(
                OperationKind::UnpauseContainer { name },
                deps,
                health,
            )),
            DesiredLifecycle::Stopped => {
                let unpause = plan.push(OperationKind::UnpauseContainer { name: name.clone() }, deps);
                Some(plan.push(OperationKind::StopContainer { name }, vec![unpause]))
            }
            DesiredLifecycle::Absent => None,
        };
    }
    match container.state {
        DesiredLifecycle::Running if !live.is_running() => Some(plan.push_checked(
            OperationKind::StartContainer { name },
            deps,
            health,
        )),
        DesiredLifecycle::Running if live.health == HealthStatus::Unhealthy => Some(
            plan.push_checked(OperationKind::RestartContainer { name }, deps, health),
        ),
        DesiredLifecycle::Stopped if live.status != ContainerStatus::Stopped => {
            Some(plan.push(OperationKind::StopContainer { name }, deps))
        }
        _ => None,
    }
}

/// Erstes Verzeichnis oder erster Container, ohne den `container` nicht
/// sicher geplant werden kann.
fn unknown_prerequisite(
    profile: &HostProfile,
    actual: &ActualState,
    container: &Container,
    blocked: &HashSet<&str>,
) -> Option<String> {
    for volume in &container.volumes {
        if let VolumeSource::Path(source) = &volume.source {
            if let Some(dir) = profile.directory_covering(source) {
                let key = dir.path.display().to_string();
                if actual.query_failed(ResourceKind::Directory, &key) {
                    return Some(format!("directory {}", key));
                }
            }
        }
    }
    container
        .dependencies()
        .into_iter()
        .find(|dep| blocked.contains(dep))
        .map(|dep| format!("container {}", dep))
}

/// Modus und (falls deklariert) Besitzer stimmen überein.
fn directory_matches(directory: &Directory, stat: &DirectoryStat) -> bool {
    directory.mode == stat.mode
        && directory.owner.as_ref().map_or(true, |o| *o == stat.owner)
        && directory.group.as_ref().map_or(true, |g| *g == stat.group)
}
