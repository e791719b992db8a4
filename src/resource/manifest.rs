//! Raw operator input
//!
//! A manifest is a YAML document listing resources in the order the
//! orchestrator wants them applied:
//!
//! ```yaml
//! resources:
//!   - kind: image
//!     name: busybox
//!   - kind: container
//!     name: container_3_6
//!     image: busybox
//!     command: sleep 100
//!   - kind: stack
//!     name: web
//!     compose_files: [/tmp/docker-stack.yml]
//! ```

use super::Kind;
use crate::error::{MoorError, Result};
use serde::Deserialize;
use std::path::Path;

/// Manifest file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<RawResource>,
}

impl Manifest {
    /// Parse manifest from path
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MoorError::Validation(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        Self::parse_str(&content)
    }

    /// Parse manifest from string
    pub fn parse_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| MoorError::Validation(format!("malformed manifest: {}", e)))
    }
}

/// One unvalidated resource declaration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawResource {
    Image(RawImage),
    Container(RawContainer),
    SwarmNode(RawSwarmNode),
    Stack(RawStack),
}

impl RawResource {
    pub fn kind(&self) -> Kind {
        match self {
            RawResource::Image(_) => Kind::Image,
            RawResource::Container(_) => Kind::Container,
            RawResource::SwarmNode(_) => Kind::SwarmNode,
            RawResource::Stack(_) => Kind::Stack,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RawResource::Image(r) => &r.name,
            RawResource::Container(r) => &r.name,
            RawResource::SwarmNode(r) => &r.name,
            RawResource::Stack(r) => &r.name,
        }
    }

    pub fn ensure(&self) -> Option<&str> {
        match self {
            RawResource::Image(r) => r.ensure.as_deref(),
            RawResource::Container(r) => r.ensure.as_deref(),
            RawResource::SwarmNode(r) => r.ensure.as_deref(),
            RawResource::Stack(r) => r.ensure.as_deref(),
        }
    }

    /// Override `ensure` with `absent` (used to tear a manifest down)
    pub fn force_absent(mut self) -> Self {
        let absent = Some("absent".to_string());
        match &mut self {
            RawResource::Image(r) => r.ensure = absent,
            RawResource::Container(r) => r.ensure = absent,
            RawResource::SwarmNode(r) => r.ensure = absent,
            RawResource::Stack(r) => r.ensure = absent,
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawImage {
    pub name: String,
    #[serde(default)]
    pub ensure: Option<String>,
    /// Image repository, defaults to `name`
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawContainer {
    pub name: String,
    #[serde(default)]
    pub ensure: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub restart: Option<String>,
    #[serde(default)]
    pub net: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub extra_parameters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSwarmNode {
    pub name: String,
    #[serde(default)]
    pub ensure: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub init: bool,
    #[serde(default)]
    pub advertise_addr: Option<String>,
    #[serde(default)]
    pub listen_addr: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub manager_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawStack {
    pub name: String,
    #[serde(default)]
    pub ensure: Option<String>,
    #[serde(default)]
    pub compose_files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let yaml = r#"
resources:
  - kind: image
    name: busybox
  - kind: container
    name: container_3_6
    image: busybox
    command: sleep 100
    ensure: present
  - kind: swarm_node
    name: cluster_manager
    init: true
    advertise_addr: 10.0.0.5
    listen_addr: 10.0.0.5
  - kind: stack
    name: web
    compose_files:
      - /tmp/docker-stack.yml
      - /tmp/docker-stack-override.yml
"#;

        let manifest = Manifest::parse_str(yaml).unwrap();
        assert_eq!(manifest.resources.len(), 4);
        assert_eq!(manifest.resources[1].kind(), Kind::Container);
        assert_eq!(manifest.resources[1].name(), "container_3_6");
        match &manifest.resources[3] {
            RawResource::Stack(stack) => assert_eq!(stack.compose_files.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        let yaml = r#"
resources:
  - kind: container
    name: c1
    image: busybox
    comand: sleep 100
"#;
        assert!(matches!(
            Manifest::parse_str(yaml),
            Err(MoorError::Validation(_))
        ));
    }

    #[test]
    fn test_force_absent() {
        let manifest = Manifest::parse_str("resources: [{kind: stack, name: web}]").unwrap();
        let raw = manifest.resources[0].clone().force_absent();
        assert_eq!(raw.ensure(), Some("absent"));
    }
}
