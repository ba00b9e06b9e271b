//! Current-State Inspector
//!
//! Fragt Runtime und Host-Dateisystem ab und baut daraus den [`ActualState`].
//! Einzelne fehlgeschlagene Abfragen brechen den Scan nicht ab, sondern
//! landen in [`ActualState::errors`]. Liefert eine Listen-Abfrage einen
//! Fehler, gilt der Scan als unvollständig.

use std::collections::BTreeSet;

use podfleet_config::HostProfile;
use tracing::{debug, warn};

use crate::hostfs::HostFilesystem;
use crate::runtime::ContainerRuntime;
use crate::state::{ActualState, QueryError, ResourceKind};

/// Liest den Ist-Zustand aller für `profile` relevanten Ressourcen.
///
/// Inspiziert werden deklarierte Container und solche mit dem
/// Besitz-Label dieses Profils. Fremde Container bleiben unberührt.
pub async fn inspect_host(
    profile: &HostProfile,
    runtime: &dyn ContainerRuntime,
    fs: &dyn HostFilesystem,
) -> ActualState {
    let mut state = ActualState::empty();

    match runtime.list_networks().await {
        Ok(networks) => {
            state.networks = networks.into_iter().map(|n| (n.name.clone(), n)).collect();
        }
        Err(e) => {
            warn!(host = %profile.name, error = %e, "listing networks failed");
            state.complete = false;
            state.errors.push(QueryError {
                kind: ResourceKind::Network,
                name: String::new(),
                message: e.message,
            });
        }
    }

    let mut names: BTreeSet<String> = profile.containers.iter().map(|c| c.name.clone()).collect();

    match runtime.list_containers().await {
        Ok(summaries) => {
            for summary in summaries {
                if summary.is_managed_by(&profile.name) {
                    names.insert(summary.name);
                }
            }
        }
        Err(e) => {
            warn!(host = %profile.name, error = %e, "listing containers failed");
            state.complete = false;
            state.errors.push(QueryError {
                kind: ResourceKind::Container,
                name: String::new(),
                message: e.message,
            });
        }
    }

    for name in names {
        match runtime.inspect_container(&name).await {
            Ok(Some(container)) => {
                state.containers.insert(name, container);
            }
            Ok(None) => debug!(host = %profile.name, container = %name, "container does not exist"),
            Err(e) => {
                warn!(host = %profile.name, container = %name, error = %e, "inspect failed");
                state.errors.push(QueryError {
                    kind: ResourceKind::Container,
                    name,
                    message: e.message,
                });
            }
        }
    }

    for directory in &profile.directories {
        match fs.stat_directory(&directory.path).await {
            Ok(stat) => {
                state.directories.insert(directory.path.clone(), stat);
            }
            Err(e) => {
                warn!(host = %profile.name, path = %directory.path.display(), error = %e, "stat failed");
                state.errors.push(QueryError {
                    kind: ResourceKind::Directory,
                    name: directory.path.display().to_string(),
                    message: e.message,
                });
            }
        }
    }

    debug!(
        host = %profile.name,
        containers = state.containers.len(),
        networks = state.networks.len(),
        errors = state.errors.len(),
        "inspection finished"
    );

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    const PROFILE: &str = r#"
directories:
  - path: /srv/web
    mode: "0750"
networks:
  - name: app-net
containers:
  - name: web
    image: nginx:latest
    networks: [app-net]
  - name: db
    image: postgres:16
"#;

    #[tokio::test]
    async fn test_inspect_collects_declared_and_owned() {
        let profile = profile_from_yaml("web01", PROFILE);
        let runtime = MockRuntime::new();
        runtime.add_network("app-net");
        runtime.add_container(managed_container("web01", profile.container("web").unwrap(), true));
        runtime.add_container(labelled_container("old", "web01"));
        runtime.add_container(labelled_container("theirs", "web02"));
        runtime.add_container(unmanaged_container("infra"));
        let fs = MockFilesystem::new();

        let state = inspect_host(&profile, &runtime, &fs).await;

        assert!(state.complete);
        assert!(state.errors.is_empty());
        assert!(state.has_network("app-net"));
        let names: Vec<_> = state.containers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["old", "web"]);
        assert_eq!(state.directories.len(), 1);
        assert!(state.directories.values().all(Option::is_none));
    }

    #[tokio::test]
    async fn test_inspect_tolerates_single_failure() {
        let profile = profile_from_yaml("web01", PROFILE);
        let runtime = MockRuntime::new();
        runtime.add_container(managed_container("web01", profile.container("web").unwrap(), true));
        runtime.add_container(managed_container("web01", profile.container("db").unwrap(), true));
        runtime.fail_inspect("db");
        let fs = MockFilesystem::new();

        let state = inspect_host(&profile, &runtime, &fs).await;

        assert!(state.complete);
        assert!(state.container("web").is_some());
        assert!(state.container("db").is_none());
        assert!(state.query_failed(ResourceKind::Container, "db"));
    }

    #[tokio::test]
    async fn test_failed_listing_marks_scan_incomplete() {
        let profile = profile_from_yaml("web01", PROFILE);
        let runtime = MockRuntime::new();
        runtime.add_container(managed_container("web01", profile.container("web").unwrap(), true));
        runtime.fail_listing();
        let fs = MockFilesystem::new();

        let state = inspect_host(&profile, &runtime, &fs).await;

        assert!(!state.complete);
        assert_eq!(state.errors.len(), 2);
        // Deklarierte Container werden trotzdem direkt inspiziert
        assert!(state.container("web").is_some());
    }
}
