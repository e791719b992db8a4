//! Docker Compose configuration types
//!
//! Only the parts of the compose format the engine inspects are typed;
//! everything else is kept as opaque YAML.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Docker Compose file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version
    #[serde(default)]
    pub version: Option<String>,
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(default)]
    pub networks: HashMap<String, serde_yaml::Value>,
    /// Volumes
    #[serde(default)]
    pub volumes: HashMap<String, serde_yaml::Value>,
    /// Secrets
    #[serde(default)]
    pub secrets: HashMap<String, serde_yaml::Value>,
    /// Configs
    #[serde(default)]
    pub configs: HashMap<String, serde_yaml::Value>,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            version: Some("3.8".to_string()),
            name: None,
            services: BTreeMap::new(),
            networks: HashMap::new(),
            volumes: HashMap::new(),
            secrets: HashMap::new(),
            configs: HashMap::new(),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Build configuration (ignored by stack deploys)
    #[serde(default)]
    pub build: Option<serde_yaml::Value>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Container labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// Deploy configuration
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Shell(String),
    Exec(Vec<String>),
}

/// Labels configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    Array(Vec<String>),
    Map(HashMap<String, String>),
}

impl LabelsConfig {
    /// Labels as key/value pairs
    pub fn to_map(&self) -> HashMap<String, String> {
        match self {
            LabelsConfig::Map(map) => map.clone(),
            LabelsConfig::Array(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
        }
    }
}

/// Deploy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Deployment mode (replicated, global)
    #[serde(default)]
    pub mode: Option<String>,
    /// Number of replicas
    #[serde(default)]
    pub replicas: Option<u32>,
    /// Service labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_to_map() {
        let labels = LabelsConfig::Array(vec!["tier=web".to_string(), "flag".to_string()]);
        let map = labels.to_map();
        assert_eq!(map.get("tier").map(String::as_str), Some("web"));
        assert_eq!(map.get("flag").map(String::as_str), Some(""));
    }
}
