//! Raw per-host declarations as written in `host_vars/*.yml`.
//!
//! These types only describe the file format. Every struct rejects unknown
//! keys; semantic checks live in [`crate::validate`].

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::model::{DesiredLifecycle, RestartPolicy};

/// Everything declared for one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostDeclaration {
    /// Named runtime connection (e.g. a `podman system connection`)
    #[serde(default)]
    pub connection: Option<String>,
    /// Remove managed containers that are no longer declared
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub directories: Vec<DirectoryDeclaration>,
    #[serde(default)]
    pub networks: Vec<NetworkDeclaration>,
    #[serde(default)]
    pub containers: Vec<ContainerDeclaration>,
}

impl HostDeclaration {
    /// Parses a single YAML document. An empty document is an empty declaration.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Appends another file's declarations (used for `host_vars/<host>/*.yml`).
    pub fn merge(&mut self, other: HostDeclaration) {
        if other.connection.is_some() {
            self.connection = other.connection;
        }
        self.prune |= other.prune;
        self.directories.extend(other.directories);
        self.networks.extend(other.networks);
        self.containers.extend(other.containers);
    }
}

/// A directory that must exist on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryDeclaration {
    pub path: String,
    /// Octal permission bits, e.g. "0750" or 0o750, taken as written.
    #[serde(default = "default_directory_mode", deserialize_with = "deserialize_mode")]
    pub mode: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

fn default_directory_mode() -> String {
    "0755".to_string()
}

/// A container network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDeclaration {
    pub name: String,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub internal: bool,
}

/// A container as declared by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerDeclaration {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub state: DesiredLifecycle,
    /// `[ip:]host:container[/proto]`
    #[serde(default)]
    pub ports: Vec<String>,
    /// `host:container[:opts]`
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Network names or `container:<name>`
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_environment")]
    pub environment: BTreeMap<String, String>,
    /// `host[:container[:perms]]`
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub security_opts: Vec<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub healthcheck: Option<HealthCheckDeclaration>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Readiness probe for a container. Exactly one of `port` or `command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckDeclaration {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Seconds until the probe gives up
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Seconds between probe attempts
    #[serde(default)]
    pub interval: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s,
        }
    }
}

/// Reads the scalar as written, so an unquoted `0o750` is not turned into
/// the decimal `488` before it is parsed as octal.
fn deserialize_mode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    String::deserialize(deserializer)
}

/// Environment values may be written as YAML numbers or booleans; they all end up as strings.
fn deserialize_environment<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    let raw: BTreeMap<String, Scalar> = BTreeMap::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|(k, v)| (k, v.into_string())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_host_declaration() {
        let yaml = r#"
connection: edge-01
prune: true
directories:
  - path: /srv/web
    mode: "0750"
    owner: www
    group: www
networks:
  - name: app-net
    driver: bridge
    subnet: 10.89.0.0/24
containers:
  - name: web
    image: nginx:latest
    ports: ["8080:80"]
    volumes: ["/srv/web:/usr/share/nginx/html:ro,Z"]
    networks: [app-net]
    environment:
      WORKERS: 4
      DEBUG: false
      NAME: web
    restart_policy: on-failure
    healthcheck:
      port: 8080
      timeout: 30
"#;
        let decl = HostDeclaration::from_yaml(yaml).unwrap();

        assert_eq!(decl.connection.as_deref(), Some("edge-01"));
        assert!(decl.prune);
        assert_eq!(decl.directories[0].mode, "0750");
        assert_eq!(decl.networks[0].subnet.as_deref(), Some("10.89.0.0/24"));

        let web = &decl.containers[0];
        assert_eq!(web.state, DesiredLifecycle::Running);
        assert_eq!(web.restart_policy, RestartPolicy::OnFailure);
        assert_eq!(web.environment["WORKERS"], "4");
        assert_eq!(web.environment["DEBUG"], "false");
        assert_eq!(web.healthcheck.as_ref().unwrap().port, Some(8080));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let yaml = r#"
containers:
  - name: web
    image: nginx
    restart: always
"#;
        let err = HostDeclaration::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown field `restart`"));
    }

    #[test]
    fn test_integer_mode_is_read_as_digits() {
        let yaml = "directories:\n  - path: /data\n    mode: 700\n";
        let decl = HostDeclaration::from_yaml(yaml).unwrap();
        assert_eq!(decl.directories[0].mode, "700");
    }

    #[test]
    fn test_unquoted_octal_mode_keeps_its_digits() {
        let yaml = "directories:\n  - path: /a\n    mode: 0o750\n  - path: /b\n    mode: 0644\n";
        let decl = HostDeclaration::from_yaml(yaml).unwrap();
        assert_eq!(decl.directories[0].mode, "0o750");
        assert_eq!(decl.directories[1].mode, "0644");

        let profile = crate::HostProfile::from_declaration("web01", decl).unwrap();
        assert_eq!(profile.directories[0].mode.bits(), 0o750);
        assert_eq!(profile.directories[1].mode.bits(), 0o644);
    }

    #[test]
    fn test_default_directory_mode() {
        let yaml = "directories:\n  - path: /data\n";
        let decl = HostDeclaration::from_yaml(yaml).unwrap();
        assert_eq!(decl.directories[0].mode, "0755");
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(HostDeclaration::from_yaml("  \n").unwrap(), HostDeclaration::default());
    }

    #[test]
    fn test_merge_concatenates_and_ors_prune() {
        let mut a = HostDeclaration::from_yaml("networks:\n  - name: a\n").unwrap();
        let b = HostDeclaration::from_yaml("prune: true\nconnection: c\nnetworks:\n  - name: b\n")
            .unwrap();
        a.merge(b);

        assert!(a.prune);
        assert_eq!(a.connection.as_deref(), Some("c"));
        let names: Vec<_> = a.networks.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
