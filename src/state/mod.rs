//! Observed state
//!
//! What the engine reports for a resource right now. Observed state is read
//! fresh for every pass and never cached.

pub mod reader;

pub use reader::StateReader;

use crate::engine::ContainerState;
use crate::resource::{Fingerprint, NodeRole, ResourceRef};
use serde::Serialize;

/// Normalized view of one live object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservedState {
    /// Engine id (image id, container id, node id, stack name)
    pub id: String,
    /// Fingerprint of the live configuration, when the object carries one
    pub fingerprint: Option<Fingerprint>,
    pub status: Status,
}

/// Kind-specific details of a live object
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Status {
    Image {
        image_id: String,
        repo_digests: Vec<String>,
    },
    Container {
        state: ContainerState,
        image_id: String,
    },
    SwarmNode {
        node_id: String,
        role: NodeRole,
        /// Advertised address, without port
        addr: String,
        cluster_id: Option<String>,
        /// Known managers, without port
        managers: Vec<String>,
    },
    Stack {
        services: Vec<String>,
    },
}

/// Everything the differ needs to decide on an action
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// The target object, `None` when it does not exist
    pub observed: Option<ObservedState>,
    /// Referenced resources that do not exist
    pub missing: Vec<ResourceRef>,
    /// Current upstream manifest digest (images with `ensure => latest`)
    pub upstream_digest: Option<String>,
    /// Id the container's image reference resolves to locally
    pub current_image_id: Option<String>,
}

impl Snapshot {
    pub fn exists(&self) -> bool {
        self.observed.is_some()
    }
}
