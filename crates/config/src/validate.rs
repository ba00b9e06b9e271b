//! Turns raw declarations into a [`HostProfile`].
//!
//! Validation has no side effects and stops at the first problem.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::declaration::{
    ContainerDeclaration, DirectoryDeclaration, HealthCheckDeclaration, HostDeclaration,
    NetworkDeclaration,
};
use crate::model::{
    Container, DeviceMapping, Directory, FileMode, HealthCheck, HealthProbe, HostProfile,
    Network, NetworkAttachment, PortMapping, VolumeMount, LABEL_MANAGED, LABEL_PROFILE,
    LABEL_SPEC_HASH,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("container '{container}' references undeclared network '{network}'")]
    UndeclaredNetwork { container: String, network: String },

    #[error("container '{container}' references undeclared container '{target}'")]
    UndeclaredContainer { container: String, target: String },

    #[error("directory '{0}' is not an absolute path")]
    RelativePath(String),

    #[error("directory '{path}' has invalid mode '{mode}'")]
    InvalidMode { path: String, mode: String },

    #[error("container '{container}' has invalid port '{spec}': {reason}")]
    InvalidPort {
        container: String,
        spec: String,
        reason: String,
    },

    #[error("container '{container}' has invalid volume '{spec}': {reason}")]
    InvalidVolume {
        container: String,
        spec: String,
        reason: String,
    },

    #[error("container '{container}' has invalid device '{spec}': {reason}")]
    InvalidDevice {
        container: String,
        spec: String,
        reason: String,
    },

    #[error("container '{container}': {reason}")]
    InvalidContainer { container: String, reason: String },

    #[error("dependency cycle between containers: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },
}

impl HostProfile {
    /// Validates `declaration` and builds the typed profile for host `name`.
    pub fn from_declaration(
        name: impl Into<String>,
        declaration: HostDeclaration,
    ) -> Result<Self, ValidationError> {
        let HostDeclaration {
            connection,
            prune,
            directories,
            networks,
            containers,
        } = declaration;

        unique("directory", directories.iter().map(|d| d.path.as_str()))?;
        unique("network", networks.iter().map(|n| n.name.as_str()))?;
        unique("container", containers.iter().map(|c| c.name.as_str()))?;

        let directories = directories
            .into_iter()
            .map(validate_directory)
            .collect::<Result<Vec<_>, _>>()?;
        let networks: Vec<Network> = networks.into_iter().map(network_from).collect();

        let network_names: HashSet<&str> = networks.iter().map(|n| n.name.as_str()).collect();
        let declared: Vec<String> = containers.iter().map(|c| c.name.clone()).collect();
        let container_names: HashSet<&str> = declared.iter().map(String::as_str).collect();

        let containers = containers
            .into_iter()
            .map(|c| validate_container(c, &network_names, &container_names))
            .collect::<Result<Vec<_>, _>>()?;

        let profile = Self {
            name: name.into(),
            connection,
            prune,
            directories,
            networks,
            containers,
        };

        profile.dependency_order()?;

        Ok(profile)
    }
}

fn unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ValidationError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn validate_directory(decl: DirectoryDeclaration) -> Result<Directory, ValidationError> {
    let path = PathBuf::from(&decl.path);
    if !path.is_absolute() {
        return Err(ValidationError::RelativePath(decl.path));
    }

    let mode = FileMode::parse(&decl.mode).ok_or_else(|| ValidationError::InvalidMode {
        path: decl.path.clone(),
        mode: decl.mode.clone(),
    })?;

    Ok(Directory {
        path,
        mode,
        owner: decl.owner,
        group: decl.group,
    })
}

fn network_from(decl: NetworkDeclaration) -> Network {
    Network {
        name: decl.name,
        driver: decl.driver,
        subnet: decl.subnet,
        gateway: decl.gateway,
        internal: decl.internal,
    }
}

fn validate_container(
    decl: ContainerDeclaration,
    networks: &HashSet<&str>,
    containers: &HashSet<&str>,
) -> Result<Container, ValidationError> {
    let name = decl.name;
    let invalid = |reason: String| ValidationError::InvalidContainer {
        container: name.clone(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }
    if decl.image.trim().is_empty() {
        return Err(invalid("image must not be empty".to_string()));
    }
    if decl.environment.keys().any(|k| k.is_empty() || k.contains('=')) {
        return Err(invalid("environment keys must be non-empty and without '='".to_string()));
    }
    if let Some(key) = decl
        .labels
        .keys()
        .find(|k| [LABEL_MANAGED, LABEL_PROFILE, LABEL_SPEC_HASH].contains(&k.as_str()))
    {
        return Err(invalid(format!("label '{}' is reserved", key)));
    }

    let ports = decl
        .ports
        .iter()
        .map(|spec| {
            PortMapping::parse(spec).map_err(|reason| ValidationError::InvalidPort {
                container: name.clone(),
                spec: spec.clone(),
                reason,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let volumes = decl
        .volumes
        .iter()
        .map(|spec| {
            VolumeMount::parse(spec).map_err(|reason| ValidationError::InvalidVolume {
                container: name.clone(),
                spec: spec.clone(),
                reason,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let devices = decl
        .devices
        .iter()
        .map(|spec| {
            DeviceMapping::parse(spec).map_err(|reason| ValidationError::InvalidDevice {
                container: name.clone(),
                spec: spec.clone(),
                reason,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let attachments: Vec<NetworkAttachment> =
        decl.networks.iter().map(|n| NetworkAttachment::parse(n)).collect();
    unique("network membership", decl.networks.iter().map(String::as_str))?;

    for attachment in &attachments {
        match attachment {
            NetworkAttachment::Network(network) if !networks.contains(network.as_str()) => {
                return Err(ValidationError::UndeclaredNetwork {
                    container: name.clone(),
                    network: network.clone(),
                });
            }
            NetworkAttachment::Container(target) => {
                if attachments.len() > 1 {
                    return Err(invalid(format!(
                        "'container:{}' cannot be combined with other networks",
                        target
                    )));
                }
                if !containers.contains(target.as_str()) {
                    return Err(ValidationError::UndeclaredContainer {
                        container: name.clone(),
                        target: target.clone(),
                    });
                }
                if !ports.is_empty() {
                    return Err(invalid(
                        "ports cannot be published when sharing another container's network"
                            .to_string(),
                    ));
                }
            }
            NetworkAttachment::Network(_) => {}
        }
    }

    for dep in &decl.depends_on {
        if dep == &name {
            return Err(invalid("a container cannot depend on itself".to_string()));
        }
        if !containers.contains(dep.as_str()) {
            return Err(ValidationError::UndeclaredContainer {
                container: name.clone(),
                target: dep.clone(),
            });
        }
    }

    let healthcheck = decl
        .healthcheck
        .map(|hc| validate_healthcheck(hc).map_err(&invalid))
        .transpose()?;

    Ok(Container {
        name: name.clone(),
        image: decl.image,
        state: decl.state,
        ports,
        volumes,
        networks: attachments,
        environment: decl.environment,
        devices,
        security_opts: decl.security_opts,
        restart_policy: decl.restart_policy,
        depends_on: decl.depends_on,
        healthcheck,
        labels: decl.labels,
    })
}

fn validate_healthcheck(decl: HealthCheckDeclaration) -> Result<HealthCheck, String> {
    let probe = match (decl.port, decl.command) {
        (Some(port), None) => {
            if decl.exit_code.is_some() {
                return Err("healthcheck 'exit_code' requires 'command'".to_string());
            }
            HealthProbe::Port {
                host: decl.host.unwrap_or_else(|| "127.0.0.1".to_string()),
                port,
            }
        }
        (None, Some(argv)) => {
            if argv.is_empty() {
                return Err("healthcheck command must not be empty".to_string());
            }
            if decl.host.is_some() {
                return Err("healthcheck 'host' requires 'port'".to_string());
            }
            HealthProbe::Command {
                argv,
                exit_code: decl.exit_code.unwrap_or(0),
            }
        }
        (Some(_), Some(_)) => {
            return Err("healthcheck needs either 'port' or 'command', not both".to_string())
        }
        (None, None) => return Err("healthcheck needs 'port' or 'command'".to_string()),
    };

    if decl.timeout == Some(0) || decl.interval == Some(0) {
        return Err("healthcheck timings must be positive".to_string());
    }

    Ok(HealthCheck {
        probe,
        timeout: decl.timeout.map(Duration::from_secs),
        interval: decl.interval.map(Duration::from_secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DesiredLifecycle, RestartPolicy};

    fn profile(yaml: &str) -> Result<HostProfile, ValidationError> {
        HostProfile::from_declaration("edge-01", HostDeclaration::from_yaml(yaml).unwrap())
    }

    #[test]
    fn test_valid_profile() {
        let p = profile(
            r#"
directories:
  - path: /srv/web
    mode: "0750"
networks:
  - name: app-net
containers:
  - name: web
    image: nginx:latest
    ports: ["8080:80"]
    volumes: ["/srv/web/html:/usr/share/nginx/html:ro"]
    networks: [app-net]
    restart_policy: always
"#,
        )
        .unwrap();

        assert_eq!(p.name, "edge-01");
        assert_eq!(p.directories[0].mode.bits(), 0o750);
        let web = p.container("web").unwrap();
        assert_eq!(web.state, DesiredLifecycle::Running);
        assert_eq!(web.restart_policy, RestartPolicy::Always);
        assert_eq!(web.ports[0].host_port, 8080);
        assert!(p.uncovered_volume_sources().is_empty());
    }

    #[test]
    fn test_duplicate_container_name() {
        let err = profile(
            r#"
containers:
  - name: web
    image: nginx
  - name: web
    image: httpd
"#,
        )
        .unwrap_err();

        assert_eq!(
            err,
            ValidationError::Duplicate {
                kind: "container",
                name: "web".to_string()
            }
        );
    }

    #[test]
    fn test_duplicate_network_name() {
        let err = profile("networks:\n  - name: a\n  - name: a\n").unwrap_err();
        assert!(matches!(err, ValidationError::Duplicate { kind: "network", .. }));
    }

    #[test]
    fn test_undeclared_network() {
        let err = profile(
            r#"
containers:
  - name: web
    image: nginx
    networks: [missing]
"#,
        )
        .unwrap_err();

        assert!(matches!(err, ValidationError::UndeclaredNetwork { ref network, .. } if network == "missing"));
    }

    #[test]
    fn test_invalid_mode() {
        let err = profile("directories:\n  - path: /data\n    mode: \"0999\"\n").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidMode { .. }));
    }

    #[test]
    fn test_relative_directory() {
        let err = profile("directories:\n  - path: data\n").unwrap_err();
        assert_eq!(err, ValidationError::RelativePath("data".to_string()));
    }

    #[test]
    fn test_invalid_port_and_volume() {
        let err = profile("containers:\n  - name: a\n    image: x\n    ports: [\"80\"]\n")
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPort { .. }));

        let err = profile("containers:\n  - name: a\n    image: x\n    volumes: [\"/a\"]\n")
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidVolume { .. }));
    }

    #[test]
    fn test_dependency_cycle() {
        let err = profile(
            r#"
containers:
  - name: a
    image: x
    depends_on: [b]
  - name: b
    image: x
    depends_on: [c]
  - name: c
    image: x
    depends_on: [a]
"#,
        )
        .unwrap_err();

        let cycle = match err {
            ValidationError::DependencyCycle { cycle } => cycle,
            other => panic!("expected a cycle, got {other:?}"),
        };
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_dependency_order_respects_container_network() {
        let p = profile(
            r#"
containers:
  - name: app
    image: x
    networks: ["container:vpn"]
  - name: vpn
    image: y
"#,
        )
        .unwrap();

        let order: Vec<_> = p.dependency_order().unwrap().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(order, vec!["vpn", "app"]);
    }

    #[test]
    fn test_container_network_cannot_mix() {
        let err = profile(
            r#"
networks:
  - name: n
containers:
  - name: app
    image: x
    networks: ["container:vpn", n]
  - name: vpn
    image: y
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidContainer { .. }));
    }

    #[test]
    fn test_self_dependency() {
        let err = profile("containers:\n  - name: a\n    image: x\n    depends_on: [a]\n")
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidContainer { .. }));
    }

    #[test]
    fn test_depends_on_resolves_later_containers() {
        let p = profile(
            "containers:\n  - name: app\n    image: x\n    depends_on: [db]\n  - name: db\n    image: y\n",
        )
        .unwrap();
        assert_eq!(p.container("app").unwrap().depends_on, vec!["db"]);

        let err = profile("containers:\n  - name: app\n    image: x\n    depends_on: [cache]\n")
            .unwrap_err();
        assert!(
            matches!(err, ValidationError::UndeclaredContainer { ref target, .. } if target == "cache"),
            "{err:?}"
        );
    }

    #[test]
    fn test_reserved_label() {
        let err = profile(
            "containers:\n  - name: a\n    image: x\n    labels:\n      podfleet.managed: \"false\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidContainer { .. }));
    }

    #[test]
    fn test_healthcheck_variants() {
        let p = profile(
            r#"
containers:
  - name: a
    image: x
    healthcheck:
      command: ["pg_isready"]
      interval: 1
"#,
        )
        .unwrap();
        let hc = p.containers[0].healthcheck.as_ref().unwrap();
        assert_eq!(
            hc.probe,
            HealthProbe::Command {
                argv: vec!["pg_isready".to_string()],
                exit_code: 0
            }
        );
        assert_eq!(hc.interval, Some(Duration::from_secs(1)));

        let err = profile(
            "containers:\n  - name: a\n    image: x\n    healthcheck:\n      port: 80\n      command: [x]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidContainer { .. }));
    }

    #[test]
    fn test_uncovered_volume_source() {
        let p = profile(
            "containers:\n  - name: a\n    image: x\n    volumes: [\"/opt/a:/a\", \"named:/b\"]\n",
        )
        .unwrap();
        let uncovered = p.uncovered_volume_sources();
        assert_eq!(uncovered.len(), 1);
        assert_eq!(uncovered[0].0, "a");
    }
}
