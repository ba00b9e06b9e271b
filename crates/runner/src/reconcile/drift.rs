//! Drift-Erkennung zwischen deklariertem und laufendem Container.

use std::fmt;

use podfleet_config::{Container, NetworkAttachment, RestartPolicy};
use serde::Serialize;

use crate::runtime::ContainerUpdate;
use crate::state::ActualContainer;

/// Eine Abweichung vom deklarierten Container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Drift {
    /// Anderes Image
    Image { declared: String, live: String },
    /// Spec-Hash fehlt oder weicht ab (Ports, Volumes, Environment, ...)
    Spec { declared: String, live: Option<String> },
    /// Andere Netzwerk-Mitgliedschaften
    Networks {
        missing: Vec<String>,
        extra: Vec<String>,
    },
    RestartPolicy {
        declared: RestartPolicy,
        live: String,
    },
}

impl Drift {
    /// Kann diese Abweichung ohne Neuerstellung behoben werden?
    pub fn is_updatable(&self) -> bool {
        matches!(self, Self::Networks { .. } | Self::RestartPolicy { .. })
    }

    /// Die Änderung die diese Abweichung in-place behebt.
    pub fn as_update(&self) -> Option<ContainerUpdate> {
        match self {
            Self::Networks { missing, extra } => Some(ContainerUpdate {
                connect: missing.clone(),
                disconnect: extra.clone(),
                restart_policy: None,
            }),
            Self::RestartPolicy { declared, .. } => Some(ContainerUpdate {
                restart_policy: Some(*declared),
                ..ContainerUpdate::default()
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image { declared, live } => write!(f, "image {} -> {}", live, declared),
            Self::Spec { live: None, .. } => f.write_str("not created by podfleet"),
            Self::Spec { declared, live: Some(live) } => {
                write!(f, "spec {} -> {}", live, declared)
            }
            Self::Networks { missing, extra } => {
                let mut parts = Vec::new();
                if !missing.is_empty() {
                    parts.push(format!("+{}", missing.join(",+")));
                }
                if !extra.is_empty() {
                    parts.push(format!("-{}", extra.join(",-")));
                }
                write!(f, "networks {}", parts.join(" "))
            }
            Self::RestartPolicy { declared, live } => {
                let live = if live.is_empty() { "no" } else { live.as_str() };
                write!(f, "restart-policy {} -> {}", live, declared.as_str())
            }
        }
    }
}

/// Alle Abweichungen zwischen `declared` und `live`.
pub fn container_drift(declared: &Container, live: &ActualContainer) -> Vec<Drift> {
    let mut drift = Vec::new();

    if normalize_image(&declared.image) != normalize_image(&live.image) {
        drift.push(Drift::Image {
            declared: declared.image.clone(),
            live: live.image.clone(),
        });
    }

    let hash = declared.spec_hash_label();
    if live.spec_hash() != Some(hash.as_str()) {
        drift.push(Drift::Spec {
            declared: hash,
            live: live.spec_hash().map(str::to_string),
        });
    }

    // Ohne deklarierte Netzwerke entscheidet die Runtime (Default-Netzwerk);
    // `container:<name>` ist im Spec-Hash enthalten.
    let uses_container_network = declared
        .networks
        .iter()
        .any(|n| matches!(n, NetworkAttachment::Container(_)));
    if !declared.networks.is_empty() && !uses_container_network {
        let wanted = declared.network_names();
        let missing: Vec<String> = wanted.difference(&live.networks).cloned().collect();
        let extra: Vec<String> = live.networks.difference(&wanted).cloned().collect();
        if !missing.is_empty() || !extra.is_empty() {
            drift.push(Drift::Networks { missing, extra });
        }
    }

    if RestartPolicy::from_runtime(&live.restart_policy) != Some(declared.restart_policy) {
        drift.push(Drift::RestartPolicy {
            declared: declared.restart_policy,
            live: live.restart_policy.clone(),
        });
    }

    drift
}

/// Vollständige Form einer Image-Referenz: `nginx` und
/// `docker.io/library/nginx:latest` sind dasselbe Image.
pub fn normalize_image(reference: &str) -> String {
    let (name, digest) = match reference.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (reference, None),
    };

    let (registry, path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => ("docker.io".to_string(), name.to_string()),
    };

    let path = if registry == "docker.io" && !path.contains('/') {
        format!("library/{}", path)
    } else {
        path
    };

    let last = path.rsplit('/').next().unwrap_or_default();
    let path = if digest.is_none() && !last.contains(':') {
        format!("{}:latest", path)
    } else {
        path
    };

    match digest {
        Some(digest) => format!("{}/{}@{}", registry, path, digest),
        None => format!("{}/{}", registry, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{managed_container, profile_from_yaml};

    const PROFILE: &str = r#"
networks:
  - name: app-net
  - name: backend
containers:
  - name: web
    image: nginx:latest
    networks: [app-net]
    restart_policy: always
"#;

    #[test]
    fn test_normalize_image() {
        assert_eq!(normalize_image("nginx"), "docker.io/library/nginx:latest");
        assert_eq!(normalize_image("nginx:1.24"), "docker.io/library/nginx:1.24");
        assert_eq!(
            normalize_image("docker.io/library/nginx:latest"),
            "docker.io/library/nginx:latest"
        );
        assert_eq!(normalize_image("grafana/grafana"), "docker.io/grafana/grafana:latest");
        assert_eq!(
            normalize_image("quay.io/prometheus/node-exporter:v1.8.0"),
            "quay.io/prometheus/node-exporter:v1.8.0"
        );
        assert_eq!(
            normalize_image("localhost:5000/app"),
            "localhost:5000/app:latest"
        );
        assert_eq!(
            normalize_image("alpine@sha256:abc"),
            "docker.io/library/alpine@sha256:abc"
        );
    }

    #[test]
    fn test_no_drift_for_matching_container() {
        let profile = profile_from_yaml("web01", PROFILE);
        let web = profile.container("web").unwrap();
        let live = managed_container("web01", web, true);

        assert!(container_drift(web, &live).is_empty());
    }

    #[test]
    fn test_image_change_drifts_image_and_spec() {
        let profile = profile_from_yaml("web01", PROFILE);
        let web = profile.container("web").unwrap();
        let mut old = web.clone();
        old.image = "nginx:1.24".to_string();
        let live = managed_container("web01", &old, true);

        let drift = container_drift(web, &live);
        assert_eq!(drift.len(), 2);
        assert!(matches!(drift[0], Drift::Image { .. }));
        assert!(matches!(drift[1], Drift::Spec { .. }));
    }

    #[test]
    fn test_network_drift_is_updatable() {
        let profile = profile_from_yaml("web01", PROFILE);
        let web = profile.container("web").unwrap();
        let mut live = managed_container("web01", web, true);
        live.networks = ["backend".to_string()].into_iter().collect();

        let drift = container_drift(web, &live);
        assert_eq!(
            drift,
            vec![Drift::Networks {
                missing: vec!["app-net".to_string()],
                extra: vec!["backend".to_string()],
            }]
        );
        assert!(drift[0].is_updatable());
        let update = drift[0].as_update().unwrap();
        assert_eq!(update.connect, vec!["app-net"]);
        assert_eq!(drift[0].to_string(), "networks +app-net -backend");
    }

    #[test]
    fn test_unlabelled_container_drifts_spec() {
        let profile = profile_from_yaml("web01", PROFILE);
        let web = profile.container("web").unwrap();
        let mut live = managed_container("web01", web, true);
        live.labels.clear();

        let drift = container_drift(web, &live);
        assert_eq!(
            drift,
            vec![Drift::Spec {
                declared: web.spec_hash_label(),
                live: None
            }]
        );
    }

    #[test]
    fn test_restart_policy_drift() {
        let profile = profile_from_yaml("web01", PROFILE);
        let web = profile.container("web").unwrap();
        let mut live = managed_container("web01", web, true);
        live.restart_policy = String::new();

        let drift = container_drift(web, &live);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].to_string(), "restart-policy no -> always");
    }
}
