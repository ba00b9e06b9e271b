// ============================================================================
// Test Utilities - exportiert für Integrationstests
// ============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use podfleet_config::{
    Container, Directory, HealthProbe, HostDeclaration, HostProfile, Network, LABEL_MANAGED,
    LABEL_PROFILE,
};

use crate::fleet::HostConnector;
use crate::hostfs::HostFilesystem;
use crate::reconcile::Plan;
use crate::report::{HostReport, OperationResult};
use crate::runtime::{ContainerRuntime, ContainerSummary, ContainerUpdate, RuntimeError, RuntimeErrorKind};
use crate::state::{ActualContainer, ActualNetwork, ContainerStatus, DirectoryStat, HealthStatus};
use crate::ui::RunUI;

/// Validiertes Profil aus einem YAML-Snippet.
pub fn profile_from_yaml(name: &str, yaml: &str) -> HostProfile {
    let decl = HostDeclaration::from_yaml(yaml).expect("valid yaml");
    HostProfile::from_declaration(name, decl).expect("valid declaration")
}

/// Laufender (oder gestoppter) Container, exakt wie `container` deklariert.
pub fn managed_container(profile: &str, container: &Container, running: bool) -> ActualContainer {
    ActualContainer {
        name: container.name.clone(),
        image: container.image.clone(),
        status: if running {
            ContainerStatus::Running
        } else {
            ContainerStatus::Stopped
        },
        health: HealthStatus::None,
        labels: container.managed_labels(profile),
        restart_policy: container.restart_policy.as_str().to_string(),
        networks: container.network_names(),
    }
}

/// Container mit Besitz-Label von `profile`, aber nicht (mehr) deklariert.
pub fn labelled_container(name: &str, profile: &str) -> ActualContainer {
    let mut container = unmanaged_container(name);
    container
        .labels
        .insert(LABEL_MANAGED.to_string(), "true".to_string());
    container
        .labels
        .insert(LABEL_PROFILE.to_string(), profile.to_string());
    container
}

/// Fremder Container ohne podfleet-Labels.
pub fn unmanaged_container(name: &str) -> ActualContainer {
    ActualContainer {
        name: name.to_string(),
        image: "alpine:latest".to_string(),
        status: ContainerStatus::Running,
        health: HealthStatus::None,
        labels: BTreeMap::new(),
        restart_policy: String::new(),
        networks: BTreeSet::new(),
    }
}

// ============================================================================
// MockUI
// ============================================================================

/// Mock UI für Tests - zeichnet alle Events auf
#[derive(Default)]
pub struct MockUI {
    pub events: Vec<String>,
}

impl MockUI {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunUI for MockUI {
    fn on_host_start(&mut self, host: &str, plan: &Plan) {
        self.events.push(format!("host_start:{}:{}", host, plan.len()));
    }
    fn on_operation_finished(&mut self, host: &str, result: &OperationResult) {
        self.events
            .push(format!("operation:{}:{}:{}", host, result.resource, result.status));
    }
    fn on_warning(&mut self, host: &str, message: &str) {
        self.events.push(format!("warning:{}:{}", host, message));
    }
    fn on_host_complete(&mut self, report: &HostReport) {
        self.events.push(format!("host_complete:{}", report.host));
    }
}

// ============================================================================
// MockRuntime
// ============================================================================

#[derive(Default)]
struct RuntimeState {
    containers: BTreeMap<String, ActualContainer>,
    networks: BTreeMap<String, ActualNetwork>,
    /// Schlüssel `aktion:name` -> (Fehlerart, verbleibende Fehlschläge)
    failures: HashMap<String, (RuntimeErrorKind, u32)>,
    failing_inspect: BTreeSet<String>,
    listing_fails: bool,
    unhealthy: BTreeSet<String>,
    mutations: Vec<String>,
    delay: Duration,
}

/// In-Memory Container-Runtime für Tests
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<RuntimeState>,
    updates: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Erlaubt in-place Updates (Netzwerke, Restart-Policy)
    pub fn with_update_support(mut self) -> Self {
        self.updates = true;
        self
    }

    pub fn add_network(&self, name: &str) {
        self.state.lock().unwrap().networks.insert(
            name.to_string(),
            ActualNetwork {
                name: name.to_string(),
                driver: Some("bridge".to_string()),
            },
        );
    }

    pub fn add_container(&self, container: ActualContainer) {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(container.name.clone(), container);
    }

    /// Inspektion dieses Containers schlägt immer fehl
    pub fn fail_inspect(&self, name: &str) {
        self.state.lock().unwrap().failing_inspect.insert(name.to_string());
    }

    /// Auflisten von Containern und Netzwerken schlägt fehl
    pub fn fail_listing(&self) {
        self.state.lock().unwrap().listing_fails = true;
    }

    /// Die nächsten `times` Aufrufe von `key` (z.B. `start-container:web`) schlagen fehl
    pub fn fail_on(&self, key: &str, kind: RuntimeErrorKind, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(key.to_string(), (kind, times));
    }

    /// Readiness-Probe für diesen Container schlägt immer fehl
    pub fn never_healthy(&self, name: &str) {
        self.state.lock().unwrap().unhealthy.insert(name.to_string());
    }

    /// Verzögerung vor jeder ändernden Operation
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn set_health(&self, name: &str, health: HealthStatus) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(name) {
            c.health = health;
        }
    }

    /// Erfolgreiche ändernde Aufrufe, in Reihenfolge
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn container(&self, name: &str) -> Option<ActualContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state.lock().unwrap().networks.contains_key(name)
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    /// Wartet die konfigurierte Verzögerung ab und prüft geplante Fehler.
    async fn begin(&self, key: String) -> Result<(), RuntimeError> {
        let delay = self.state.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some((kind, remaining)) = state.failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuntimeError::new(*kind, format!("injected failure for {}", key)));
            }
        }
        Ok(())
    }

    fn record(&self, state: &mut RuntimeState, key: String) {
        state.mutations.push(key);
    }

    fn with_container<F>(&self, key: String, name: &str, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&mut ActualContainer),
    {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::not_found(format!("no such container: {}", name)))?;
        f(container);
        self.record(&mut state, key);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.listing_fails {
            return Err(RuntimeError::transient("cannot connect to podman socket"));
        }
        Ok(state
            .containers
            .values()
            .map(|c| ContainerSummary {
                name: c.name.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ActualContainer>, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.failing_inspect.contains(name) {
            return Err(RuntimeError::fatal(format!("inspect {} failed", name)));
        }
        Ok(state.containers.get(name).cloned())
    }

    async fn list_networks(&self) -> Result<Vec<ActualNetwork>, RuntimeError> {
        let state = self.state.lock().unwrap();
        if state.listing_fails {
            return Err(RuntimeError::transient("cannot connect to podman socket"));
        }
        Ok(state.networks.values().cloned().collect())
    }

    async fn create_network(&self, network: &Network) -> Result<(), RuntimeError> {
        let key = format!("create-network:{}", network.name);
        self.begin(key.clone()).await?;

        let mut state = self.state.lock().unwrap();
        if state.networks.contains_key(&network.name) {
            return Err(RuntimeError::already_exists(format!(
                "network {} already exists",
                network.name
            )));
        }
        state.networks.insert(
            network.name.clone(),
            ActualNetwork {
                name: network.name.clone(),
                driver: network.driver.clone(),
            },
        );
        self.record(&mut state, key);
        Ok(())
    }

    async fn create_container(
        &self,
        container: &Container,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let key = format!("create-container:{}", container.name);
        self.begin(key.clone()).await?;

        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&container.name) {
            return Err(RuntimeError::already_exists(format!(
                "container name {} is already in use",
                container.name
            )));
        }
        let networks = container.network_names();
        if let Some(missing) = networks.iter().find(|n| !state.networks.contains_key(*n)) {
            return Err(RuntimeError::not_found(format!("network not found: {}", missing)));
        }
        state.containers.insert(
            container.name.clone(),
            ActualContainer {
                name: container.name.clone(),
                image: container.image.clone(),
                status: ContainerStatus::Stopped,
                health: HealthStatus::None,
                labels: labels.clone(),
                restart_policy: container.restart_policy.as_str().to_string(),
                networks,
            },
        );
        self.record(&mut state, key);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let key = format!("start-container:{}", name);
        self.begin(key.clone()).await?;
        self.with_container(key, name, |c| c.status = ContainerStatus::Running)
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        let key = format!("stop-container:{}", name);
        self.begin(key.clone()).await?;
        self.with_container(key, name, |c| c.status = ContainerStatus::Stopped)
    }

    async fn unpause_container(&self, name: &str) -> Result<(), RuntimeError> {
        let key = format!("unpause-container:{}", name);
        self.begin(key.clone()).await?;
        if let Some(c) = self.state.lock().unwrap().containers.get(name) {
            if c.status != ContainerStatus::Paused {
                return Err(RuntimeError::fatal(format!("{} is not paused", name)));
            }
        }
        self.with_container(key, name, |c| c.status = ContainerStatus::Running)
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let key = format!("remove-container:{}", name);
        self.begin(key.clone()).await?;

        let mut state = self.state.lock().unwrap();
        if state.containers.remove(name).is_none() {
            return Err(RuntimeError::not_found(format!("no such container: {}", name)));
        }
        self.record(&mut state, key);
        Ok(())
    }

    fn supports_update(&self) -> bool {
        self.updates
    }

    async fn update_container(&self, name: &str, update: &ContainerUpdate) -> Result<(), RuntimeError> {
        if !self.updates {
            return Err(RuntimeError::not_supported("updates not supported"));
        }
        let key = format!("update-container:{}", name);
        self.begin(key.clone()).await?;
        self.with_container(key, name, |c| {
            for network in &update.connect {
                c.networks.insert(network.clone());
            }
            for network in &update.disconnect {
                c.networks.remove(network);
            }
            if let Some(policy) = update.restart_policy {
                c.restart_policy = policy.as_str().to_string();
            }
        })
    }

    async fn restart_container(&self, name: &str) -> Result<(), RuntimeError> {
        let key = format!("restart-container:{}", name);
        self.begin(key.clone()).await?;
        self.with_container(key, name, |c| {
            c.status = ContainerStatus::Running;
            c.health = HealthStatus::Starting;
        })
    }

    async fn probe(&self, container: &str, _probe: &HealthProbe) -> Result<bool, RuntimeError> {
        Ok(!self.state.lock().unwrap().unhealthy.contains(container))
    }
}

// ============================================================================
// MockFilesystem
// ============================================================================

/// In-Memory Host-Dateisystem für Tests
#[derive(Default)]
pub struct MockFilesystem {
    directories: Mutex<BTreeMap<PathBuf, DirectoryStat>>,
    failing: Mutex<BTreeSet<PathBuf>>,
}

impl MockFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_directory(&self, path: &str, stat: DirectoryStat) {
        self.directories.lock().unwrap().insert(PathBuf::from(path), stat);
    }

    /// Stat und Anlegen dieses Pfads schlagen fehl
    pub fn fail_path(&self, path: &str) {
        self.failing.lock().unwrap().insert(PathBuf::from(path));
    }

    pub fn exists(&self, path: &str) -> bool {
        self.directories.lock().unwrap().contains_key(Path::new(path))
    }

    pub fn stat(&self, path: &str) -> Option<DirectoryStat> {
        self.directories.lock().unwrap().get(Path::new(path)).cloned()
    }

    fn check(&self, path: &Path) -> Result<(), RuntimeError> {
        if self.failing.lock().unwrap().contains(path) {
            return Err(RuntimeError::fatal(format!("{}: permission denied", path.display())));
        }
        Ok(())
    }
}

#[async_trait]
impl HostFilesystem for MockFilesystem {
    async fn stat_directory(&self, path: &Path) -> Result<Option<DirectoryStat>, RuntimeError> {
        self.check(path)?;
        Ok(self.directories.lock().unwrap().get(path).cloned())
    }

    async fn ensure_directory(&self, directory: &Directory) -> Result<(), RuntimeError> {
        self.check(&directory.path)?;
        let mut directories = self.directories.lock().unwrap();
        let entry = directories
            .entry(directory.path.clone())
            .or_insert_with(|| DirectoryStat {
                mode: directory.mode,
                owner: "root".to_string(),
                group: "root".to_string(),
            });
        entry.mode = directory.mode;
        if let Some(owner) = &directory.owner {
            entry.owner = owner.clone();
        }
        if let Some(group) = &directory.group {
            entry.group = group.clone();
        }
        Ok(())
    }
}

// ============================================================================
// MockConnector
// ============================================================================

/// Liefert pro Host eine eigene MockRuntime und ein eigenes MockFilesystem
#[derive(Default)]
pub struct MockConnector {
    runtimes: Mutex<BTreeMap<String, Arc<MockRuntime>>>,
    filesystems: Mutex<BTreeMap<String, Arc<MockFilesystem>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runtime_for(&self, host: &str) -> Arc<MockRuntime> {
        self.runtimes
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    pub fn filesystem_for(&self, host: &str) -> Arc<MockFilesystem> {
        self.filesystems
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .clone()
    }
}

impl HostConnector for MockConnector {
    fn runtime(&self, profile: &HostProfile) -> Arc<dyn ContainerRuntime> {
        self.runtime_for(&profile.name)
    }

    fn filesystem(&self, profile: &HostProfile) -> Arc<dyn HostFilesystem> {
        self.filesystem_for(&profile.name)
    }
}
