//! Query and command channel to the container engine
//!
//! Everything moor knows about the host goes through [`Engine`]. The
//! production implementation drives the `docker` CLI ([`cli::DockerCli`]);
//! [`memory::MemoryEngine`] simulates a host in-process for tests.

pub mod classify;
pub mod cli;
pub mod memory;

use crate::resource::spec::SwarmNodeSpec;
use crate::resource::NodeRole;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use classify::Classifier;
pub use cli::{DockerCli, DockerConfig};
pub use memory::MemoryEngine;

/// How an engine failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The engine binary is not installed on this host
    NotInstalled,
    /// The daemon cannot be reached
    Unavailable,
    /// Likely to succeed if tried again
    Transient,
    /// Retrying will not help
    Fatal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureClass::NotInstalled => "not installed",
            FailureClass::Unavailable => "unavailable",
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// A classified engine failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct EngineError {
    pub class: FailureClass,
    pub message: String,
}

impl EngineError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn not_installed(message: impl Into<String>) -> Self {
        Self::new(FailureClass::NotInstalled, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Unavailable, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Fatal, message)
    }

    /// Whether the executor may try the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class,
            FailureClass::Transient | FailureClass::Unavailable
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Container runtime state as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Other(String),
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            other => ContainerState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Local swarm state of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmState {
    Inactive,
    Pending,
    Active,
    Error,
    Locked,
}

impl SwarmState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "active" => SwarmState::Active,
            "pending" => SwarmState::Pending,
            "error" => SwarmState::Error,
            "locked" => SwarmState::Locked,
            _ => SwarmState::Inactive,
        }
    }
}

/// An image in the local cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    /// `name@sha256:...` entries the image was pulled as
    pub repo_digests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    /// Id of the image the container was created from
    pub image_id: String,
    pub labels: BTreeMap<String, String>,
}

/// This node's view of the swarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmInfo {
    pub local_state: SwarmState,
    pub node_id: String,
    /// Address the node advertises, without port
    pub node_addr: String,
    pub cluster_id: Option<String>,
    pub is_manager: bool,
    /// Managers this node knows of, without port
    pub managers: Vec<String>,
}

impl SwarmInfo {
    pub fn inactive() -> Self {
        Self {
            local_state: SwarmState::Inactive,
            node_id: String::new(),
            node_addr: String::new(),
            cluster_id: None,
            is_manager: false,
            managers: Vec::new(),
        }
    }
}

/// A swarm service belonging to a stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Everything needed to start a detached container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub command: Option<String>,
    pub restart: Option<String>,
    pub net: Option<String>,
    pub env: Vec<String>,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub hostname: Option<String>,
    pub extra_parameters: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// The container engine
#[async_trait]
pub trait Engine: Send + Sync {
    /// Inspect a local image by reference, `None` if not cached
    async fn inspect_image(&self, reference: &str) -> EngineResult<Option<ImageInfo>>;

    /// Inspect a container by name, `None` if it does not exist
    async fn inspect_container(&self, name: &str) -> EngineResult<Option<ContainerInfo>>;

    /// Swarm membership of this node
    async fn swarm_info(&self) -> EngineResult<SwarmInfo>;

    /// Services of a deployed stack. Only valid on a manager.
    async fn stack_services(&self, stack: &str) -> EngineResult<Vec<ServiceInfo>>;

    async fn pull_image(&self, reference: &str) -> EngineResult<()>;

    async fn remove_image(&self, id: &str) -> EngineResult<()>;

    /// Start a detached container, returning its id
    async fn run_container(&self, spec: &RunSpec) -> EngineResult<String>;

    /// Force-remove a container
    async fn remove_container(&self, id: &str) -> EngineResult<()>;

    async fn swarm_init(&self, spec: &SwarmNodeSpec) -> EngineResult<()>;

    async fn swarm_join(&self, spec: &SwarmNodeSpec) -> EngineResult<()>;

    /// Leave the swarm, forcing it on managers
    async fn swarm_leave(&self) -> EngineResult<()>;

    /// Promote or demote a node
    async fn set_node_role(&self, node_id: &str, role: NodeRole) -> EngineResult<()>;

    /// Deploy a stack from compose files in order, pruning services that are
    /// no longer described
    async fn stack_deploy(&self, stack: &str, compose_files: &[PathBuf]) -> EngineResult<()>;

    /// Add or replace a label on a swarm service
    async fn label_service(&self, service: &str, key: &str, value: &str) -> EngineResult<()>;

    async fn stack_remove(&self, stack: &str) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(EngineError::transient("x").is_retryable());
        assert!(EngineError::unavailable("x").is_retryable());
        assert!(!EngineError::fatal("x").is_retryable());
        assert!(!EngineError::not_installed("x").is_retryable());
    }

    #[test]
    fn test_container_state_parse() {
        assert_eq!(ContainerState::parse("running"), ContainerState::Running);
        assert_eq!(ContainerState::parse("Exited"), ContainerState::Exited);
        assert_eq!(
            ContainerState::parse("removing"),
            ContainerState::Other("removing".to_string())
        );
    }

    #[test]
    fn test_swarm_state_parse() {
        assert_eq!(SwarmState::parse("active"), SwarmState::Active);
        assert_eq!(SwarmState::parse("locked"), SwarmState::Locked);
        assert_eq!(SwarmState::parse(""), SwarmState::Inactive);
    }
}
