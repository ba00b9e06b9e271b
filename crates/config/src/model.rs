//! Validated, typed model of a host's desired state.
//!
//! A [`HostProfile`] is produced by [`HostProfile::from_declaration`] and is
//! immutable afterwards. The reconciler receives it by value.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validate::ValidationError;

/// Marks containers created by podfleet.
pub const LABEL_MANAGED: &str = "podfleet.managed";
/// Scopes a managed container to the host profile that created it.
pub const LABEL_PROFILE: &str = "podfleet.profile";
/// CRC32 over the recreate-relevant fields of a container.
pub const LABEL_SPEC_HASH: &str = "podfleet.spec-hash";

/// A named target host and everything declared for it.
#[derive(Debug, Clone, PartialEq)]
pub struct HostProfile {
    pub name: String,
    pub connection: Option<String>,
    pub prune: bool,
    pub directories: Vec<Directory>,
    pub networks: Vec<Network>,
    pub containers: Vec<Container>,
}

impl HostProfile {
    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// The declared directory that contains `path`, if any.
    pub fn directory_covering(&self, path: &Path) -> Option<&Directory> {
        self.directories
            .iter()
            .filter(|d| path.starts_with(&d.path))
            .max_by_key(|d| d.path.components().count())
    }

    /// Bind-mount sources that no declared directory covers: (container, source).
    pub fn uncovered_volume_sources(&self) -> Vec<(&str, &Path)> {
        self.containers
            .iter()
            .flat_map(|c| {
                c.volumes.iter().filter_map(move |v| match &v.source {
                    VolumeSource::Path(p) if self.directory_covering(p).is_none() => {
                        Some((c.name.as_str(), p.as_path()))
                    }
                    _ => None,
                })
            })
            .collect()
    }

    /// Containers in creation order: every container comes after the
    /// containers it depends on. Ties keep declaration order.
    pub fn dependency_order(&self) -> Result<Vec<&Container>, ValidationError> {
        let index: HashMap<&str, usize> = self
            .containers
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();

        let mut pending: Vec<usize> = vec![0; self.containers.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.containers.len()];

        for (i, container) in self.containers.iter().enumerate() {
            for dep in container.dependencies() {
                let Some(&j) = index.get(dep) else {
                    return Err(ValidationError::UndeclaredContainer {
                        container: container.name.clone(),
                        target: dep.to_string(),
                    });
                };
                pending[i] += 1;
                dependents[j].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.containers.len())
            .filter(|&i| pending[i] == 0)
            .collect();
        let mut ordered = Vec::with_capacity(self.containers.len());

        while let Some(i) = ready.pop_first() {
            ordered.push(&self.containers[i]);
            for &d in &dependents[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if ordered.len() < self.containers.len() {
            return Err(ValidationError::DependencyCycle {
                cycle: self.find_cycle(&pending, &index),
            });
        }

        Ok(ordered)
    }

    /// Walks unresolved dependencies until a container repeats.
    fn find_cycle(&self, pending: &[usize], index: &HashMap<&str, usize>) -> Vec<String> {
        let Some(start) = pending.iter().position(|&p| p > 0) else {
            return Vec::new();
        };

        let mut path: Vec<usize> = vec![start];
        let mut current = start;
        loop {
            let next = self.containers[current]
                .dependencies()
                .into_iter()
                .filter_map(|d| index.get(d).copied())
                .find(|&j| pending[j] > 0);
            let Some(next) = next else {
                break;
            };
            if let Some(pos) = path.iter().position(|&p| p == next) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.containers[i].name.clone())
                    .collect();
                cycle.push(self.containers[next].name.clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }

        path.iter().map(|&i| self.containers[i].name.clone()).collect()
    }
}

/// A directory that must exist with the given mode and ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub path: PathBuf,
    pub mode: FileMode,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// Unix permission bits (`0o7777` at most).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

impl FileMode {
    pub const MAX: u32 = 0o7777;

    pub fn new(bits: u32) -> Option<Self> {
        (bits <= Self::MAX).then_some(Self(bits))
    }

    /// Parses an octal string such as "0750", "750" or "0o750".
    pub fn parse(s: &str) -> Option<Self> {
        let digits = s.trim();
        let digits = digits.strip_prefix("0o").unwrap_or(digits);
        if digits.is_empty() || digits.len() > 5 {
            return None;
        }
        u32::from_str_radix(digits, 8).ok().and_then(Self::new)
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// A container network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub driver: Option<String>,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub internal: bool,
}

/// Lifecycle state a container should end up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredLifecycle {
    #[default]
    Running,
    Stopped,
    Absent,
}

impl fmt::Display for DesiredLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Absent => "absent",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    OnFailure,
    #[default]
    No,
}

impl RestartPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::No => "no",
        }
    }

    /// Reads the policy name a runtime reports. An empty name means "no".
    pub fn from_runtime(name: &str) -> Option<Self> {
        match name {
            "always" => Some(Self::Always),
            "on-failure" => Some(Self::OnFailure),
            "no" | "" => Some(Self::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

/// `[ip:]host:container[/proto]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let (addr, protocol) = match spec.rsplit_once('/') {
            Some((addr, "tcp")) => (addr, Protocol::Tcp),
            Some((addr, "udp")) => (addr, Protocol::Udp),
            Some((addr, "sctp")) => (addr, Protocol::Sctp),
            Some((_, other)) => return Err(format!("unknown protocol '{}'", other)),
            None => (spec, Protocol::Tcp),
        };

        let parts: Vec<&str> = addr.split(':').collect();
        let (host_ip, host, container) = match parts.as_slice() {
            [host, container] => (None, *host, *container),
            [ip, host, container] if !ip.is_empty() => (Some(ip.to_string()), *host, *container),
            _ => return Err("expected host:container".to_string()),
        };

        Ok(Self {
            host_ip,
            host_port: parse_port(host)?,
            container_port: parse_port(container)?,
            protocol,
        })
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("'{}' is not a port between 1 and 65535", s)),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        write!(
            f,
            "{}:{}/{}",
            self.host_port,
            self.container_port,
            self.protocol.as_str()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VolumeSource {
    /// Bind mount of a host path
    Path(PathBuf),
    /// Named runtime volume
    Named(String),
}

/// `host:container[:opt,opt]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeMount {
    pub source: VolumeSource,
    pub target: PathBuf,
    pub options: Vec<String>,
}

impl VolumeMount {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, options) = match parts.as_slice() {
            [source, target] => (*source, *target, None),
            [source, target, options] => (*source, *target, Some(*options)),
            _ => return Err("expected host:container[:opts]".to_string()),
        };

        let source = if source.starts_with('/') {
            VolumeSource::Path(PathBuf::from(source))
        } else if is_volume_name(source) {
            VolumeSource::Named(source.to_string())
        } else {
            return Err(format!(
                "source '{}' is neither an absolute path nor a volume name",
                source
            ));
        };

        if !target.starts_with('/') {
            return Err(format!("target '{}' must be absolute", target));
        }

        let options = match options {
            Some(opts) => {
                let opts: Vec<String> = opts.split(',').map(str::to_string).collect();
                if opts.iter().any(|o| o.is_empty()) {
                    return Err("empty mount option".to_string());
                }
                opts
            }
            None => Vec::new(),
        };

        Ok(Self {
            source,
            target: PathBuf::from(target),
            options,
        })
    }
}

fn is_volume_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            VolumeSource::Path(p) => write!(f, "{}", p.display())?,
            VolumeSource::Named(n) => write!(f, "{}", n)?,
        }
        write!(f, ":{}", self.target.display())?;
        if !self.options.is_empty() {
            write!(f, ":{}", self.options.join(","))?;
        }
        Ok(())
    }
}

/// `host[:container[:perms]]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceMapping {
    pub host: PathBuf,
    pub container: PathBuf,
    pub permissions: Option<String>,
}

impl DeviceMapping {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (host, container, permissions) = match parts.as_slice() {
            [host] => (*host, *host, None),
            [host, container] => (*host, *container, None),
            [host, container, perms] => (*host, *container, Some(*perms)),
            _ => return Err("expected host[:container[:perms]]".to_string()),
        };

        if !host.starts_with('/') || !container.starts_with('/') {
            return Err("device paths must be absolute".to_string());
        }
        if let Some(perms) = permissions {
            if perms.is_empty() || !perms.chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
                return Err(format!("permissions '{}' must be a subset of 'rwm'", perms));
            }
        }

        Ok(Self {
            host: PathBuf::from(host),
            container: PathBuf::from(container),
            permissions: permissions.map(str::to_string),
        })
    }
}

impl fmt::Display for DeviceMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container.display())?;
        if let Some(perms) = &self.permissions {
            write!(f, ":{}", perms)?;
        }
        Ok(())
    }
}

/// One entry of a container's `networks` list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkAttachment {
    /// Membership in a declared network
    Network(String),
    /// Join another container's network namespace (`container:<name>`)
    Container(String),
}

impl NetworkAttachment {
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix("container:") {
            Some(name) => Self::Container(name.to_string()),
            None => Self::Network(spec.to_string()),
        }
    }
}

impl fmt::Display for NetworkAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(name) => f.write_str(name),
            Self::Container(name) => write!(f, "container:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthProbe {
    /// TCP connect succeeds
    Port { host: String, port: u16 },
    /// Command inside the container exits with `exit_code`
    Command { argv: Vec<String>, exit_code: i32 },
}

impl fmt::Display for HealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port { host, port } => write!(f, "tcp {}:{}", host, port),
            Self::Command { argv, exit_code } => {
                write!(f, "exec '{}' == {}", argv.join(" "), exit_code)
            }
        }
    }
}

/// Readiness probe. Unset timings fall back to the fleet defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub probe: HealthProbe,
    pub timeout: Option<Duration>,
    pub interval: Option<Duration>,
}

/// A validated container declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub state: DesiredLifecycle,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    pub networks: Vec<NetworkAttachment>,
    pub environment: BTreeMap<String, String>,
    pub devices: Vec<DeviceMapping>,
    pub security_opts: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub depends_on: Vec<String>,
    pub healthcheck: Option<HealthCheck>,
    pub labels: BTreeMap<String, String>,
}

impl Container {
    /// CRC32 of every field that can only change by recreating the container.
    ///
    /// Networks and the restart policy are compared directly since a runtime
    /// may change them in place.
    pub fn spec_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.image.as_bytes());
        for port in &self.ports {
            hasher.update(b"\0p");
            hasher.update(port.to_string().as_bytes());
        }
        for volume in &self.volumes {
            hasher.update(b"\0v");
            hasher.update(volume.to_string().as_bytes());
        }
        for (key, value) in &self.environment {
            hasher.update(b"\0e");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        for device in &self.devices {
            hasher.update(b"\0d");
            hasher.update(device.to_string().as_bytes());
        }
        for opt in &self.security_opts {
            hasher.update(b"\0s");
            hasher.update(opt.as_bytes());
        }
        for (key, value) in &self.labels {
            hasher.update(b"\0l");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        if let Some(NetworkAttachment::Container(target)) = self.networks.first() {
            hasher.update(b"\0n");
            hasher.update(target.as_bytes());
        }
        hasher.finalize()
    }

    /// Hex form used for the spec-hash label.
    pub fn spec_hash_label(&self) -> String {
        format!("{:08x}", self.spec_hash())
    }

    /// Names of declared networks the container joins.
    pub fn network_names(&self) -> BTreeSet<String> {
        self.networks
            .iter()
            .filter_map(|n| match n {
                NetworkAttachment::Network(name) => Some(name.clone()),
                NetworkAttachment::Container(_) => None,
            })
            .collect()
    }

    /// Containers that must exist before this one.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self.depends_on.iter().map(String::as_str).collect();
        for net in &self.networks {
            if let NetworkAttachment::Container(name) = net {
                if !deps.contains(&name.as_str()) {
                    deps.push(name);
                }
            }
        }
        deps
    }

    /// Labels podfleet attaches when creating the container.
    pub fn managed_labels(&self, profile: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_PROFILE.to_string(), profile.to_string());
        labels.insert(LABEL_SPEC_HASH.to_string(), self.spec_hash_label());
        labels
    }
}
