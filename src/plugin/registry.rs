//! Plugin registry: the installed plugins and what they declare
//!
//! The registry file is produced by whatever installs plugins. The host only
//! reads it:
//!
//! ```yaml
//! plugins:
//!   - name: aws-public
//!     source: github.com/example/aws-public@v0.3.0
//!     executable: bin/aws-public
//!     tier: fallback
//!     capabilities: ["aws:*"]
//!     protocol_version: 1
//! ```

use crate::error::ConfigError;
use crate::plugin::capability::{CapabilityPattern, CapabilitySet};
use crate::plugin::discovery;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Which kind of pricing data a plugin serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Embedded or public list prices, no credentials needed
    Fallback,
    /// Live billing API, credentials required
    Production,
}

impl Tier {
    pub fn opposite(self) -> Tier {
        match self {
            Tier::Fallback => Tier::Production,
            Tier::Production => Tier::Fallback,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Fallback => f.write_str("fallback"),
            Tier::Production => f.write_str("production"),
        }
    }
}

/// An installed plugin. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    pub name: String,
    /// Where the plugin came from (repository, package reference)
    pub source: String,
    pub executable: PathBuf,
    pub tier: Tier,
    pub capabilities: CapabilitySet,
    pub protocol_version: u32,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Raw registry entry as written on disk
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryEntry {
    name: String,
    #[serde(default)]
    source: Option<String>,
    executable: String,
    tier: Tier,
    capabilities: Vec<String>,
    protocol_version: u32,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFile {
    #[serde(default)]
    plugins: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<PluginDescriptor>>,
}

impl PluginRegistry {
    pub fn new(plugins: Vec<PluginDescriptor>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for plugin in &plugins {
            if !seen.insert(plugin.name.as_str()) {
                return Err(ConfigError::DuplicatePlugin(plugin.name.clone()));
            }
        }

        Ok(Self {
            plugins: plugins.into_iter().map(Arc::new).collect(),
        })
    }

    /// Load a registry file. Relative executable paths resolve against the
    /// directory holding the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        Self::from_yaml(&content, base_dir).map_err(|err| match err {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_yaml(content: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let file: RegistryFile = serde_yaml::from_str(content).map_err(|err| ConfigError::Parse {
            path: "<registry>".into(),
            message: err.to_string(),
        })?;

        let descriptors = file
            .plugins
            .into_iter()
            .map(|entry| descriptor_from_entry(entry, base_dir))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Loaded {} plugin descriptors", descriptors.len());
        Self::new(descriptors)
    }

    pub fn plugins(&self) -> &[Arc<PluginDescriptor>] {
        &self.plugins
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PluginDescriptor>> {
        self.plugins.iter().find(|p| p.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }
}

fn descriptor_from_entry(
    entry: RegistryEntry,
    base_dir: &Path,
) -> Result<PluginDescriptor, ConfigError> {
    let invalid = |reason: String, help: &str| ConfigError::InvalidEntry {
        plugin: entry.name.clone(),
        reason,
        help: help.to_string(),
    };

    if entry.name.trim().is_empty() || entry.name.chars().any(char::is_whitespace) {
        return Err(invalid(
            "name must be non-empty and contain no whitespace".to_string(),
            "Use a short identifier such as 'aws-public'",
        ));
    }

    if entry.capabilities.is_empty() {
        return Err(invalid(
            "no capabilities declared".to_string(),
            "List the resource-type patterns this plugin prices, e.g. [\"aws:ec2/*\"]",
        ));
    }

    let patterns = entry
        .capabilities
        .iter()
        .map(|raw| CapabilityPattern::parse(raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            invalid(
                err.to_string(),
                "Patterns are resource types where '*' matches any run of characters",
            )
        })?;

    if entry.protocol_version == 0 {
        return Err(invalid(
            "protocol_version must be at least 1".to_string(),
            "Use the protocol version the plugin was built against",
        ));
    }

    let executable = discovery::resolve_executable(&entry.executable, base_dir).map_err(|err| {
        invalid(
            format!("{err:#}"),
            "Point 'executable' at an existing file, or put the binary on PATH",
        )
    })?;

    Ok(PluginDescriptor {
        source: entry.source.unwrap_or_else(|| entry.executable.clone()),
        name: entry.name,
        executable,
        tier: entry.tier,
        capabilities: CapabilitySet::new(patterns),
        protocol_version: entry.protocol_version,
        args: entry.args,
        env: entry.env,
    })
}
