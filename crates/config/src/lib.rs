use std::path::PathBuf;
use thiserror::Error;

pub mod declaration;
pub mod discover;
pub mod fleet;
pub mod model;
pub mod validate;

pub use declaration::{
    ContainerDeclaration, DirectoryDeclaration, HealthCheckDeclaration, HostDeclaration,
    NetworkDeclaration,
};
pub use discover::{discover_hosts, select_hosts, DiscoveredHost};
pub use fleet::{ExecutorConfig, FleetConfig, HealthConfig, RuntimeConfig};
pub use model::{
    Container, DesiredLifecycle, DeviceMapping, Directory, FileMode, HealthCheck, HealthProbe,
    HostProfile, Network, NetworkAttachment, PortMapping, Protocol, RestartPolicy, VolumeMount,
    VolumeSource, LABEL_MANAGED, LABEL_PROFILE, LABEL_SPEC_HASH,
};
pub use validate::ValidationError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to parse fleet config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("WalkDir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("host_vars directory not found: {0}")]
    MissingHostVars(PathBuf),

    #[error("Unknown host '{0}'")]
    UnknownHost(String),

    #[error("host '{host}': {source}")]
    Validation {
        host: String,
        #[source]
        source: ValidationError,
    },
}

impl ConfigError {
    /// The validation error behind this config error, if any.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation { source, .. } => Some(source),
            _ => None,
        }
    }
}
