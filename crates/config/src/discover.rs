//! Discovery of per-host declaration files.
//!
//! Layout follows Ansible's `host_vars`:
//! - `host_vars/<host>.yml` declares one host
//! - `host_vars/<host>/*.yml` are merged into one host, in file name order

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::declaration::HostDeclaration;
use crate::model::HostProfile;
use crate::ConfigError;

/// A host found under `host_vars`, not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub name: String,
    /// Declaration files, in merge order
    pub sources: Vec<PathBuf>,
}

impl DiscoveredHost {
    /// Reads and merges all source files.
    pub fn read_declaration(&self) -> Result<HostDeclaration, ConfigError> {
        let mut merged = HostDeclaration::default();
        for path in &self.sources {
            let content = std::fs::read_to_string(path)?;
            let decl = HostDeclaration::from_yaml(&content).map_err(|source| ConfigError::Yaml {
                path: path.clone(),
                source,
            })?;
            merged.merge(decl);
        }
        Ok(merged)
    }

    /// Reads, merges and validates this host's declarations.
    pub fn load(&self) -> Result<HostProfile, ConfigError> {
        let declaration = self.read_declaration()?;
        HostProfile::from_declaration(self.name.clone(), declaration).map_err(|source| {
            ConfigError::Validation {
                host: self.name.clone(),
                source,
            }
        })
    }
}

/// Finds all hosts below `host_vars`, sorted by name.
pub fn discover_hosts(host_vars: &Path) -> Result<Vec<DiscoveredHost>, ConfigError> {
    if !host_vars.is_dir() {
        return Err(ConfigError::MissingHostVars(host_vars.to_path_buf()));
    }

    let mut hosts: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    for entry in WalkDir::new(host_vars)
        .min_depth(1)
        .max_depth(2)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = entry?;
        let path = entry.path();

        if !entry.file_type().is_file() || !is_yaml(path) {
            continue;
        }

        let host = if entry.depth() == 1 {
            path.file_stem().and_then(|s| s.to_str())
        } else {
            path.parent()
                .and_then(|p| p.file_name())
                .and_then(|s| s.to_str())
        };

        if let Some(host) = host {
            hosts.entry(host.to_string()).or_default().push(path.to_path_buf());
        }
    }

    Ok(hosts
        .into_iter()
        .map(|(name, sources)| DiscoveredHost { name, sources })
        .collect())
}

/// Keeps only the requested hosts. An empty selection keeps everything.
pub fn select_hosts(
    hosts: Vec<DiscoveredHost>,
    selection: &[String],
) -> Result<Vec<DiscoveredHost>, ConfigError> {
    if selection.is_empty() {
        return Ok(hosts);
    }

    if let Some(unknown) = selection.iter().find(|s| !hosts.iter().any(|h| &h.name == *s)) {
        return Err(ConfigError::UnknownHost(unknown.clone()));
    }

    Ok(hosts
        .into_iter()
        .filter(|h| selection.contains(&h.name))
        .collect())
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}
