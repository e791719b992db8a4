//! Kind-specific resource parameters

use super::fingerprint::{self, Fingerprint};
use super::Kind;
use crate::error::Result;
use crate::image::ImageReference;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Node role in the swarm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Worker node
    #[default]
    Worker,
    /// Manager node
    Manager,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Worker => write!(f, "worker"),
            NodeRole::Manager => write!(f, "manager"),
        }
    }
}

/// Parameters of a validated resource
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    Image(ImageSpec),
    Container(ContainerSpec),
    SwarmNode(SwarmNodeSpec),
    Stack(StackSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> Kind {
        match self {
            ResourceSpec::Image(_) => Kind::Image,
            ResourceSpec::Container(_) => Kind::Container,
            ResourceSpec::SwarmNode(_) => Kind::SwarmNode,
            ResourceSpec::Stack(_) => Kind::Stack,
        }
    }

    /// Name the engine knows the live object by
    pub fn identity(&self, name: &str) -> String {
        match self {
            ResourceSpec::Image(spec) => spec.reference.to_string(),
            ResourceSpec::Container(_) => sanitize_container_name(name),
            ResourceSpec::SwarmNode(_) | ResourceSpec::Stack(_) => name.to_string(),
        }
    }

    pub fn fingerprint(&self) -> Result<Fingerprint> {
        match self {
            ResourceSpec::Image(spec) => fingerprint::image(&spec.reference),
            ResourceSpec::Container(spec) => Fingerprint::of(&(Kind::Container, spec)),
            ResourceSpec::SwarmNode(spec) => {
                fingerprint::membership(
                spec.role,
                spec.advertise_host().as_deref(),
                spec.manager_host().as_deref(),
            )
            }
            ResourceSpec::Stack(spec) => Fingerprint::of(&(Kind::Stack, spec)),
        }
    }
}

/// Image in the local cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSpec {
    pub reference: ImageReference,
}

/// Container run configuration. Every field is part of the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSpec {
    pub image: ImageReference,
    pub command: Option<String>,
    pub restart: Option<String>,
    pub net: Option<String>,
    pub env: Vec<String>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub hostname: Option<String>,
    pub extra_parameters: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: ImageReference) -> Self {
        Self {
            image,
            command: None,
            restart: None,
            net: None,
            env: Vec::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            hostname: None,
            extra_parameters: Vec::new(),
        }
    }

    /// Set command to run
    pub fn command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    /// Add port mapping
    pub fn port(mut self, mapping: &str) -> Self {
        self.ports.push(mapping.to_string());
        self
    }
}

/// Swarm membership of this host
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmNodeSpec {
    pub role: NodeRole,
    /// Initialize a new swarm instead of joining one
    pub init: bool,
    pub advertise_addr: Option<String>,
    pub listen_addr: Option<String>,
    pub token: Option<String>,
    pub manager_ip: Option<String>,
}

impl SwarmNodeSpec {
    /// Host part of `advertise_addr` when it is an IP literal. Interface
    /// names cannot be compared against the engine's view and yield `None`.
    pub fn advertise_host(&self) -> Option<String> {
        self.advertise_addr.as_deref().and_then(host_ip)
    }

    /// Host part of `manager_ip` for a joining node. A node that initializes
    /// its own swarm has no join target.
    pub fn manager_host(&self) -> Option<String> {
        if self.init {
            return None;
        }
        self.manager_ip.as_deref().and_then(host_ip)
    }
}

/// Host part of an address as reported by the engine (`10.0.0.1:2377` or
/// `10.0.0.1`)
pub fn host_ip(addr: &str) -> Option<String> {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Some(socket.ip().to_string());
    }
    addr.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Stack deployed from ordered compose overlays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackSpec {
    pub compose_files: Vec<ComposeSource>,
}

impl StackSpec {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.compose_files.iter().map(|f| f.path.clone()).collect()
    }
}

/// A rendered compose file and the digest of its content
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeSource {
    pub path: PathBuf,
    pub digest: String,
}

/// Container names only allow `[A-Za-z0-9.-]`; everything else becomes `-`
pub fn sanitize_container_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(image: &str) -> ContainerSpec {
        ContainerSpec::new(ImageReference::parse(image).unwrap())
    }

    #[test]
    fn test_sanitize_container_name() {
        assert_eq!(sanitize_container_name("container_3_6"), "container-3-6");
        assert_eq!(sanitize_container_name("web.app-1"), "web.app-1");
        assert_eq!(sanitize_container_name("a b/c"), "a-b-c");
    }

    #[test]
    fn test_container_identity_is_sanitized() {
        let spec = ResourceSpec::Container(container("busybox"));
        assert_eq!(spec.identity("container_3_6"), "container-3-6");
    }

    #[test]
    fn test_container_fingerprint_tracks_every_parameter() {
        let base = ResourceSpec::Container(container("busybox").command("sleep 100"));
        let same = ResourceSpec::Container(container("busybox").command("sleep 100"));
        assert_eq!(base.fingerprint().unwrap(), same.fingerprint().unwrap());

        let variants = vec![
            container("busybox").command("sleep 200"),
            container("alpine").command("sleep 100"),
            container("busybox").command("sleep 100").env("A", "1"),
            container("busybox").command("sleep 100").port("80:80"),
            {
                let mut c = container("busybox").command("sleep 100");
                c.restart = Some("always".to_string());
                c
            },
            {
                let mut c = container("busybox").command("sleep 100");
                c.net = Some("nat".to_string());
                c
            },
        ];
        for variant in variants {
            assert_ne!(
                base.fingerprint().unwrap(),
                ResourceSpec::Container(variant).fingerprint().unwrap()
            );
        }
    }

    #[test]
    fn test_env_order_matters() {
        let ab = ResourceSpec::Container(container("busybox").env("A", "1").env("B", "2"));
        let ba = ResourceSpec::Container(container("busybox").env("B", "2").env("A", "1"));
        assert_ne!(ab.fingerprint().unwrap(), ba.fingerprint().unwrap());
    }

    #[test]
    fn test_advertise_host() {
        let mut spec = SwarmNodeSpec {
            role: NodeRole::Manager,
            init: true,
            advertise_addr: Some("10.0.0.5:2377".to_string()),
            listen_addr: Some("0.0.0.0:2377".to_string()),
            token: None,
            manager_ip: None,
        };
        assert_eq!(spec.advertise_host().as_deref(), Some("10.0.0.5"));

        spec.advertise_addr = Some("eth0".to_string());
        assert_eq!(spec.advertise_host(), None);
    }

    #[test]
    fn test_manager_host_only_when_joining() {
        let mut spec = SwarmNodeSpec {
            role: NodeRole::Worker,
            init: false,
            advertise_addr: None,
            listen_addr: None,
            token: Some("SWMTKN-1-x".to_string()),
            manager_ip: Some("10.0.0.1:2377".to_string()),
        };
        assert_eq!(spec.manager_host().as_deref(), Some("10.0.0.1"));
        let joined = ResourceSpec::SwarmNode(spec.clone()).fingerprint().unwrap();

        spec.manager_ip = Some("10.9.9.9:2377".to_string());
        assert_ne!(ResourceSpec::SwarmNode(spec.clone()).fingerprint().unwrap(), joined);

        spec.init = true;
        assert_eq!(spec.manager_host(), None);
    }
}
