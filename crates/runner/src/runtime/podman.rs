//! Podman CLI Backend
//!
//! Jeder Aufruf startet `podman` als Subprozess und liest JSON von stdout.
//! Fehlermeldungen auf stderr werden über [`classify_failure`] in
//! [`RuntimeErrorKind`] übersetzt.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use podfleet_config::{Container, HealthProbe, Network, RuntimeConfig};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{tcp_probe, ContainerRuntime, ContainerSummary, ContainerUpdate, RuntimeError};
use crate::state::{ActualContainer, ActualNetwork, ContainerStatus, HealthStatus};

/// Echte Podman-Implementierung über CLI
pub struct PodmanCli {
    pub bin_path: PathBuf,
    /// `podman --connection <name>` für Remote-Hosts
    pub connection: Option<String>,
    pub command_timeout: Duration,
}

impl PodmanCli {
    pub fn new(bin_path: PathBuf) -> Self {
        Self {
            bin_path,
            connection: None,
            command_timeout: Duration::from_secs(120),
        }
    }

    pub fn from_config(config: &RuntimeConfig, connection: Option<String>) -> Self {
        Self {
            bin_path: config.binary.clone(),
            connection,
            command_timeout: config.command_timeout(),
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        if let Some(connection) = &self.connection {
            cmd.arg("--connection").arg(connection);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Führt podman aus und gibt stdout zurück. Exit-Code != 0 wird klassifiziert.
    async fn run(&self, args: &[String]) -> Result<String, RuntimeError> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn output(&self, args: &[String]) -> Result<std::process::Output, RuntimeError> {
        debug!(binary = %self.bin_path.display(), args = ?args, "podman");

        match timeout(self.command_timeout, self.command(args).output()).await {
            Err(_) => Err(RuntimeError::transient(format!(
                "podman {} timed out after {}s",
                args.first().map(String::as_str).unwrap_or_default(),
                self.command_timeout.as_secs()
            ))),
            Ok(Err(e)) => Err(RuntimeError::fatal(format!(
                "failed to execute {}: {}",
                self.bin_path.display(),
                e
            ))),
            Ok(Ok(output)) => Ok(output),
        }
    }
}

fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[async_trait]
impl ContainerRuntime for PodmanCli {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let stdout = self.run(&args(["ps", "--all", "--format", "json"])).await?;
        parse_container_list(&stdout)
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ActualContainer>, RuntimeError> {
        match self
            .run(&args(["container", "inspect", "--format", "json", name]))
            .await
        {
            Ok(stdout) => parse_inspect(&stdout),
            Err(e) if e.kind == super::RuntimeErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_networks(&self) -> Result<Vec<ActualNetwork>, RuntimeError> {
        let stdout = self.run(&args(["network", "ls", "--format", "json"])).await?;
        parse_network_list(&stdout)
    }

    async fn create_network(&self, network: &Network) -> Result<(), RuntimeError> {
        self.run(&network_create_args(network)).await.map(|_| ())
    }

    async fn create_container(
        &self,
        container: &Container,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), RuntimeError> {
        self.run(&container_create_args(container, labels))
            .await
            .map(|_| ())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&args(["start", name])).await.map(|_| ())
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&args(["stop", name])).await.map(|_| ())
    }

    async fn unpause_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&args(["unpause", name])).await.map(|_| ())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&args(["rm", "--force", name])).await.map(|_| ())
    }

    fn supports_update(&self) -> bool {
        true
    }

    async fn update_container(
        &self,
        name: &str,
        update: &ContainerUpdate,
    ) -> Result<(), RuntimeError> {
        for network in &update.disconnect {
            self.run(&args(["network", "disconnect", network.as_str(), name]))
                .await?;
        }
        for network in &update.connect {
            match self
                .run(&args(["network", "connect", network.as_str(), name]))
                .await
            {
                Err(e) if e.kind == super::RuntimeErrorKind::AlreadyExists => {}
                other => {
                    other?;
                }
            }
        }
        if let Some(policy) = update.restart_policy {
            self.run(&args(["update", "--restart", policy.as_str(), name]))
                .await?;
        }
        Ok(())
    }

    async fn restart_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&args(["restart", name])).await.map(|_| ())
    }

    async fn probe(&self, container: &str, probe: &HealthProbe) -> Result<bool, RuntimeError> {
        match probe {
            HealthProbe::Port { host, port } => Ok(tcp_probe(host, *port).await),
            HealthProbe::Command { argv, exit_code } => {
                let mut exec = args(["exec", container]);
                exec.extend(argv.iter().cloned());
                let output = self.output(&exec).await?;
                Ok(output.status.code() == Some(*exit_code))
            }
        }
    }
}

// ============================================================================
// Argument-Aufbau
// ============================================================================

pub(crate) fn network_create_args(network: &Network) -> Vec<String> {
    let mut out = args(["network", "create"]);
    if let Some(driver) = &network.driver {
        out.push(format!("--driver={}", driver));
    }
    if let Some(subnet) = &network.subnet {
        out.push(format!("--subnet={}", subnet));
    }
    if let Some(gateway) = &network.gateway {
        out.push(format!("--gateway={}", gateway));
    }
    if network.internal {
        out.push("--internal".to_string());
    }
    out.push(network.name.clone());
    out
}

pub(crate) fn container_create_args(
    container: &Container,
    labels: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut out = args(["create", "--name"]);
    out.push(container.name.clone());

    for (key, value) in labels {
        out.push(format!("--label={}={}", key, value));
    }
    for port in &container.ports {
        out.push(format!("--publish={}", port));
    }
    for volume in &container.volumes {
        out.push(format!("--volume={}", volume));
    }
    for network in &container.networks {
        out.push(format!("--network={}", network));
    }
    for (key, value) in &container.environment {
        out.push(format!("--env={}={}", key, value));
    }
    for device in &container.devices {
        out.push(format!("--device={}", device));
    }
    for opt in &container.security_opts {
        out.push(format!("--security-opt={}", opt));
    }
    out.push(format!("--restart={}", container.restart_policy.as_str()));
    out.push(container.image.clone());
    out
}

// ============================================================================
// Fehlerklassifikation
// ============================================================================

/// Übersetzt stderr eines fehlgeschlagenen podman-Aufrufs in einen [`RuntimeError`].
pub fn classify_failure(stderr: &str) -> RuntimeError {
    let message = stderr.trim();
    let lower = message.to_lowercase();
    let message = if message.is_empty() {
        "podman exited with an error".to_string()
    } else {
        message.to_string()
    };

    const FATAL: &[&str] = &[
        "no such image",
        "image not known",
        "manifest unknown",
        "permission denied",
    ];
    const ALREADY_EXISTS: &[&str] = &["already exists", "already in use"];
    const NOT_FOUND: &[&str] = &["no such container", "no such network", "no container with name"];
    const TRANSIENT: &[&str] = &[
        "timed out",
        "timeout",
        "temporarily unavailable",
        "resource busy",
        "database is locked",
        "connection refused",
        "connection reset",
    ];

    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(FATAL) {
        RuntimeError::fatal(message)
    } else if has(ALREADY_EXISTS) {
        RuntimeError::already_exists(message)
    } else if has(NOT_FOUND) {
        RuntimeError::not_found(message)
    } else if has(TRANSIENT) {
        RuntimeError::transient(message)
    } else {
        RuntimeError::fatal(message)
    }
}

// ============================================================================
// JSON-Ausgabe von podman
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    name: String,
    #[serde(default)]
    image_name: Option<String>,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    host_config: InspectHostConfig,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default, alias = "Healthcheck")]
    health: Option<InspectHealth>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    restart_policy: Option<InspectRestartPolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct NetworkEntry {
    name: String,
    #[serde(default)]
    driver: Option<String>,
}

fn parse_error(what: &str, e: serde_json::Error) -> RuntimeError {
    RuntimeError::fatal(format!("failed to parse podman {} output: {}", what, e))
}

pub(crate) fn parse_container_list(stdout: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<PsEntry> = serde_json::from_str(stdout).map_err(|e| parse_error("ps", e))?;
    Ok(entries
        .into_iter()
        .filter_map(|e| {
            let name = e.names.into_iter().next()?;
            Some(ContainerSummary {
                name,
                labels: e.labels.unwrap_or_default(),
            })
        })
        .collect())
}

pub(crate) fn parse_inspect(stdout: &str) -> Result<Option<ActualContainer>, RuntimeError> {
    let entries: Vec<InspectEntry> =
        serde_json::from_str(stdout).map_err(|e| parse_error("inspect", e))?;

    Ok(entries.into_iter().next().map(|e| ActualContainer {
        name: e.name.trim_start_matches('/').to_string(),
        image: e.image_name.or(e.config.image).unwrap_or_default(),
        status: ContainerStatus::from_runtime(&e.state.status),
        health: e
            .state
            .health
            .map(|h| HealthStatus::from_runtime(&h.status))
            .unwrap_or_default(),
        labels: e.config.labels.unwrap_or_default(),
        restart_policy: e.host_config.restart_policy.map(|p| p.name).unwrap_or_default(),
        networks: e
            .network_settings
            .networks
            .map(|n| n.into_keys().collect())
            .unwrap_or_default(),
    }))
}

pub(crate) fn parse_network_list(stdout: &str) -> Result<Vec<ActualNetwork>, RuntimeError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<NetworkEntry> =
        serde_json::from_str(stdout).map_err(|e| parse_error("network ls", e))?;
    Ok(entries
        .into_iter()
        .map(|n| ActualNetwork {
            name: n.name,
            driver: n.driver,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeErrorKind;
    use podfleet_config::{HostDeclaration, HostProfile};

    fn web_container() -> Container {
        let yaml = r#"
networks:
  - name: app-net
containers:
  - name: web
    image: nginx:latest
    ports: ["8080:80"]
    volumes: ["/srv/web:/usr/share/nginx/html:ro"]
    networks: [app-net]
    environment:
      TZ: UTC
    restart_policy: always
"#;
        let decl = HostDeclaration::from_yaml(yaml).unwrap();
        let profile = HostProfile::from_declaration("web01", decl).unwrap();
        profile.containers[0].clone()
    }

    #[test]
    fn test_container_create_args() {
        let container = web_container();
        let labels = container.managed_labels("web01");
        let args = container_create_args(&container, &labels);

        assert_eq!(&args[..3], &["create", "--name", "web"]);
        assert!(args.contains(&"--label=podfleet.managed=true".to_string()));
        assert!(args.contains(&"--label=podfleet.profile=web01".to_string()));
        assert!(args.contains(&"--publish=8080:80/tcp".to_string()));
        assert!(args.contains(&"--volume=/srv/web:/usr/share/nginx/html:ro".to_string()));
        assert!(args.contains(&"--network=app-net".to_string()));
        assert!(args.contains(&"--env=TZ=UTC".to_string()));
        assert!(args.contains(&"--restart=always".to_string()));
        assert_eq!(args.last().unwrap(), "nginx:latest");
    }

    #[test]
    fn test_network_create_args() {
        let network = Network {
            name: "backend".to_string(),
            driver: Some("bridge".to_string()),
            subnet: Some("10.89.1.0/24".to_string()),
            gateway: None,
            internal: true,
        };
        assert_eq!(
            network_create_args(&network),
            vec![
                "network",
                "create",
                "--driver=bridge",
                "--subnet=10.89.1.0/24",
                "--internal",
                "backend"
            ]
        );
    }

    #[test]
    fn test_classify_failure() {
        let cases = [
            ("Error: creating container storage: the container name \"web\" is already in use", RuntimeErrorKind::AlreadyExists),
            ("Error: network name app-net already used: network already exists", RuntimeErrorKind::AlreadyExists),
            ("Error: no such container web", RuntimeErrorKind::NotFound),
            ("Error: docker.io/library/nginx:nope: image not known", RuntimeErrorKind::Fatal),
            ("Error: database is locked", RuntimeErrorKind::Transient),
            ("Cannot connect to Podman: connection refused", RuntimeErrorKind::Transient),
            ("Error: something unexpected", RuntimeErrorKind::Fatal),
            ("", RuntimeErrorKind::Fatal),
        ];
        for (stderr, kind) in cases {
            assert_eq!(classify_failure(stderr).kind, kind, "stderr: {stderr}");
        }
    }

    #[test]
    fn test_parse_container_list() {
        let json = r#"[
            {"Names": ["web"], "Labels": {"podfleet.managed": "true"}, "State": "running"},
            {"Names": ["infra"], "Labels": null},
            {"Names": []}
        ]"#;
        let list = parse_container_list(json).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].labels["podfleet.managed"], "true");
        assert!(list[1].labels.is_empty());
        assert!(parse_container_list("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_inspect() {
        let json = r#"[{
            "Id": "abc",
            "Name": "web",
            "ImageName": "docker.io/library/nginx:latest",
            "Config": {"Image": "nginx", "Labels": {"podfleet.spec-hash": "0000beef"}},
            "State": {"Status": "running", "Healthcheck": {"Status": "unhealthy"}},
            "HostConfig": {"RestartPolicy": {"Name": "always", "MaximumRetryCount": 0}},
            "NetworkSettings": {"Networks": {"app-net": {"IPAddress": "10.89.0.2"}}}
        }]"#;
        let c = parse_inspect(json).unwrap().unwrap();
        assert_eq!(c.name, "web");
        assert_eq!(c.image, "docker.io/library/nginx:latest");
        assert!(c.is_running());
        assert_eq!(c.health, HealthStatus::Unhealthy);
        assert_eq!(c.spec_hash(), Some("0000beef"));
        assert_eq!(c.restart_policy, "always");
        assert!(c.networks.contains("app-net"));
    }

    #[test]
    fn test_parse_inspect_minimal() {
        let json = r#"[{"Name": "db", "Config": {"Image": "postgres:16"}, "State": {"Status": "exited"}}]"#;
        let c = parse_inspect(json).unwrap().unwrap();
        assert_eq!(c.image, "postgres:16");
        assert_eq!(c.status, ContainerStatus::Stopped);
        assert_eq!(c.health, HealthStatus::None);
        assert!(c.networks.is_empty());

        assert!(parse_inspect("[]").unwrap().is_none());
        assert!(parse_inspect("not json").is_err());
    }

    #[test]
    fn test_parse_network_list() {
        let json = r#"[{"name": "podman", "driver": "bridge"}, {"name": "app-net", "driver": "bridge", "internal": false}]"#;
        let networks = parse_network_list(json).unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[1].name, "app-net");
    }
}
