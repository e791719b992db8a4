//! Simulated container host
//!
//! `MemoryEngine` keeps an image cache, containers, swarm membership and
//! stacks in memory and behaves like a single-node docker host. Failures can
//! be injected per operation, and every call is logged so tests can assert
//! on the exact sequence of queries and commands.

use super::{
    ContainerInfo, ContainerState, Engine, EngineError, EngineResult, ImageInfo, RunSpec,
    ServiceInfo, SwarmInfo, SwarmState,
};
use crate::compose::config::LabelsConfig;
use crate::compose::ComposeParser;
use crate::error::Result;
use crate::image::{ImageReference, UpstreamDigests};
use crate::resource::fingerprint::digest_bytes;
use crate::resource::spec::{host_ip, SwarmNodeSpec};
use crate::resource::NodeRole;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Engine operations, as recorded in the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    InspectImage,
    InspectContainer,
    SwarmInfo,
    StackServices,
    PullImage,
    RemoveImage,
    RunContainer,
    RemoveContainer,
    SwarmInit,
    SwarmJoin,
    SwarmLeave,
    SetNodeRole,
    StackDeploy,
    LabelService,
    StackRemove,
    UpstreamDigest,
}

impl Op {
    /// Whether the operation only reads state
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Op::InspectImage
                | Op::InspectContainer
                | Op::SwarmInfo
                | Op::StackServices
                | Op::UpstreamDigest
        )
    }
}

struct HostState {
    installed: bool,
    reachable: bool,
    /// Local image cache keyed by normalized reference
    images: BTreeMap<String, ImageInfo>,
    /// Upstream registry: normalized reference to manifest digest
    registry: BTreeMap<String, String>,
    containers: BTreeMap<String, ContainerInfo>,
    swarm: SwarmInfo,
    stacks: BTreeMap<String, Vec<ServiceInfo>>,
    tokens: HashMap<String, NodeRole>,
    faults: HashMap<Op, VecDeque<EngineError>>,
    calls: Vec<Op>,
    drop_labels: bool,
    next_id: u64,
}

impl HostState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:012x}", prefix, self.next_id)
    }
}

/// In-memory docker host
pub struct MemoryEngine {
    state: Mutex<HostState>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// An empty, reachable host outside any swarm
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                installed: true,
                reachable: true,
                images: BTreeMap::new(),
                registry: BTreeMap::new(),
                containers: BTreeMap::new(),
                swarm: SwarmInfo::inactive(),
                stacks: BTreeMap::new(),
                tokens: HashMap::new(),
                faults: HashMap::new(),
                calls: Vec::new(),
                drop_labels: false,
                next_id: 0,
            }),
        }
    }

    fn host(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a daemon call and apply availability and injected faults
    fn enter(&self, op: Op) -> EngineResult<MutexGuard<'_, HostState>> {
        let mut host = self.host();
        host.calls.push(op);
        if !host.installed {
            return Err(EngineError::not_installed("docker is not installed"));
        }
        if !host.reachable {
            return Err(EngineError::unavailable(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
            ));
        }
        if let Some(err) = host.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(host)
    }

    /// Publish `digest` as the current upstream manifest of `reference`
    pub fn publish(&self, reference: &str, digest: &str) {
        self.host()
            .registry
            .insert(image_key(reference), digest.to_string());
    }

    /// Publish `reference` upstream and pull it into the local cache
    pub fn with_image(&self, reference: &str, digest: &str) {
        self.publish(reference, digest);
        let key = image_key(reference);
        let mut host = self.host();
        let info = pulled_image(&key, digest);
        host.images.insert(key, info);
    }

    /// Issue a join token for `role`
    pub fn issue_token(&self, role: NodeRole) -> String {
        let mut host = self.host();
        let token = host.next_id(&format!("SWMTKN-1-{}-", role));
        host.tokens.insert(token.clone(), role);
        token
    }

    /// Fail the next call of `op` with `err`. Calls queue up.
    pub fn fail_next(&self, op: Op, err: EngineError) {
        self.host().faults.entry(op).or_default().push_back(err);
    }

    /// Fail the next `times` calls of `op` with `err`
    pub fn fail_times(&self, op: Op, times: usize, err: EngineError) {
        for _ in 0..times {
            self.fail_next(op, err.clone());
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.host().reachable = reachable;
    }

    pub fn set_installed(&self, installed: bool) {
        self.host().installed = installed;
    }

    /// Accept runs and label updates but silently discard their labels
    pub fn drop_labels(&self, drop: bool) {
        self.host().drop_labels = drop;
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Op> {
        self.host().calls.clone()
    }

    /// Number of calls of `op` made so far
    pub fn count(&self, op: Op) -> usize {
        self.host().calls.iter().filter(|c| **c == op).count()
    }

    /// Number of state-changing calls made so far
    pub fn mutations(&self) -> usize {
        self.host().calls.iter().filter(|c| !c.is_query()).count()
    }

    pub fn clear_calls(&self) {
        self.host().calls.clear();
    }

    pub fn image(&self, reference: &str) -> Option<ImageInfo> {
        self.host().images.get(&image_key(reference)).cloned()
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.host().containers.get(name).cloned()
    }

    pub fn stack(&self, name: &str) -> Option<Vec<ServiceInfo>> {
        self.host().stacks.get(name).cloned()
    }

    pub fn swarm(&self) -> SwarmInfo {
        self.host().swarm.clone()
    }

    /// Change a container's runtime state behind the engine's back
    pub fn set_container_state(&self, name: &str, state: ContainerState) {
        if let Some(container) = self.host().containers.get_mut(name) {
            container.state = state;
        }
    }

    /// Overwrite a container label behind the engine's back
    pub fn set_container_label(&self, name: &str, key: &str, value: &str) {
        if let Some(container) = self.host().containers.get_mut(name) {
            container.labels.insert(key.to_string(), value.to_string());
        }
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn inspect_image(&self, reference: &str) -> EngineResult<Option<ImageInfo>> {
        let host = self.enter(Op::InspectImage)?;
        Ok(host.images.get(&image_key(reference)).cloned())
    }

    async fn inspect_container(&self, name: &str) -> EngineResult<Option<ContainerInfo>> {
        let host = self.enter(Op::InspectContainer)?;
        if let Some(container) = host.containers.get(name) {
            return Ok(Some(container.clone()));
        }
        // the daemon falls back to a unique id prefix
        let mut by_id = host.containers.values().filter(|c| c.id.starts_with(name));
        match (by_id.next(), by_id.next()) {
            (Some(container), None) => Ok(Some(container.clone())),
            _ => Ok(None),
        }
    }

    async fn swarm_info(&self) -> EngineResult<SwarmInfo> {
        let host = self.enter(Op::SwarmInfo)?;
        Ok(host.swarm.clone())
    }

    async fn stack_services(&self, stack: &str) -> EngineResult<Vec<ServiceInfo>> {
        let host = self.enter(Op::StackServices)?;
        require_manager(&host)?;
        Ok(host.stacks.get(stack).cloned().unwrap_or_default())
    }

    async fn pull_image(&self, reference: &str) -> EngineResult<()> {
        let mut host = self.enter(Op::PullImage)?;
        let key = image_key(reference);
        let digest = host.registry.get(&key).cloned().ok_or_else(|| {
            EngineError::fatal(format!(
                "Error response from daemon: manifest for {} not found: manifest unknown",
                reference
            ))
        })?;
        let info = pulled_image(&key, &digest);
        host.images.insert(key, info);
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> EngineResult<()> {
        let mut host = self.enter(Op::RemoveImage)?;
        let key = host
            .images
            .iter()
            .find(|(reference, info)| **reference == image_key(id) || info.id == id)
            .map(|(reference, _)| reference.clone());
        let Some(key) = key else { return Ok(()) };

        let image_id = host.images[&key].id.clone();
        if let Some(user) = host.containers.values().find(|c| c.image_id == image_id) {
            return Err(EngineError::fatal(format!(
                "Error response from daemon: conflict: unable to remove repository reference \"{}\" (must force) - container {} is using its referenced image",
                key, user.id
            )));
        }
        host.images.remove(&key);
        Ok(())
    }

    async fn run_container(&self, spec: &RunSpec) -> EngineResult<String> {
        let mut host = self.enter(Op::RunContainer)?;
        if host.containers.contains_key(&spec.name) {
            return Err(EngineError::fatal(format!(
                "docker: Error response from daemon: Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        let image_id = host
            .images
            .get(&image_key(&spec.image))
            .map(|i| i.id.clone())
            .ok_or_else(|| {
                EngineError::fatal(format!(
                    "docker: Error response from daemon: No such image: {}",
                    spec.image
                ))
            })?;

        let id = host.next_id("c");
        let labels = if host.drop_labels {
            BTreeMap::new()
        } else {
            spec.labels.clone()
        };
        host.containers.insert(
            spec.name.clone(),
            ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                state: ContainerState::Running,
                image_id,
                labels,
            },
        );
        Ok(id)
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        let mut host = self.enter(Op::RemoveContainer)?;
        host.containers.retain(|name, c| c.id != id && name != id);
        Ok(())
    }

    async fn swarm_init(&self, spec: &SwarmNodeSpec) -> EngineResult<()> {
        let mut host = self.enter(Op::SwarmInit)?;
        if host.swarm.local_state != SwarmState::Inactive {
            return Err(already_in_swarm());
        }
        let node_id = host.next_id("node");
        let cluster_id = host.next_id("cluster");
        let addr = node_addr(spec);
        host.swarm = SwarmInfo {
            local_state: SwarmState::Active,
            node_id,
            node_addr: addr.clone(),
            cluster_id: Some(cluster_id),
            is_manager: true,
            managers: vec![addr],
        };
        Ok(())
    }

    async fn swarm_join(&self, spec: &SwarmNodeSpec) -> EngineResult<()> {
        let mut host = self.enter(Op::SwarmJoin)?;
        if host.swarm.local_state != SwarmState::Inactive {
            return Err(already_in_swarm());
        }
        let Some(manager) = spec.manager_ip.as_deref() else {
            return Err(EngineError::fatal("swarm join requires a manager address"));
        };
        let manager = host_ip(manager).unwrap_or_else(|| manager.to_string());
        let role = spec
            .token
            .as_deref()
            .and_then(|t| host.tokens.get(t).copied())
            .ok_or_else(|| {
                EngineError::fatal(
                    "Error response from daemon: rpc error: code = InvalidArgument desc = A valid join token is necessary to join this cluster",
                )
            })?;
        let node_id = host.next_id("node");
        let cluster_id = host.next_id("cluster");
        host.swarm = SwarmInfo {
            local_state: SwarmState::Active,
            node_id,
            node_addr: node_addr(spec),
            cluster_id: Some(cluster_id),
            is_manager: role == NodeRole::Manager,
            managers: vec![manager],
        };
        Ok(())
    }

    async fn swarm_leave(&self) -> EngineResult<()> {
        let mut host = self.enter(Op::SwarmLeave)?;
        host.swarm = SwarmInfo::inactive();
        host.stacks.clear();
        Ok(())
    }

    async fn set_node_role(&self, node_id: &str, role: NodeRole) -> EngineResult<()> {
        let mut host = self.enter(Op::SetNodeRole)?;
        if host.swarm.local_state != SwarmState::Active || host.swarm.node_id != node_id {
            return Err(EngineError::fatal(format!(
                "Error response from daemon: node {} not found",
                node_id
            )));
        }
        host.swarm.is_manager = role == NodeRole::Manager;
        Ok(())
    }

    async fn stack_deploy(&self, stack: &str, compose_files: &[PathBuf]) -> EngineResult<()> {
        let mut host = self.enter(Op::StackDeploy)?;
        require_manager(&host)?;
        let config = ComposeParser::parse_files(compose_files)
            .map_err(|e| EngineError::fatal(e.to_string()))?;

        let previous = host.stacks.get(stack).cloned().unwrap_or_default();
        let mut services = Vec::with_capacity(config.services.len());
        for (service, service_config) in &config.services {
            let name = format!("{}_{}", stack, service);
            let id = match previous.iter().find(|s| s.name == name) {
                Some(existing) => existing.id.clone(),
                None => host.next_id("svc"),
            };
            let mut labels: BTreeMap<String, String> = service_config
                .deploy
                .as_ref()
                .and_then(|d| d.labels.as_ref())
                .map(LabelsConfig::to_map)
                .unwrap_or_default()
                .into_iter()
                .collect();
            labels.insert(
                "com.docker.stack.namespace".to_string(),
                stack.to_string(),
            );
            services.push(ServiceInfo { id, name, labels });
        }
        host.stacks.insert(stack.to_string(), services);
        Ok(())
    }

    async fn label_service(&self, service: &str, key: &str, value: &str) -> EngineResult<()> {
        let mut host = self.enter(Op::LabelService)?;
        require_manager(&host)?;
        let drop_labels = host.drop_labels;
        let target = host
            .stacks
            .values_mut()
            .flat_map(|services| services.iter_mut())
            .find(|s| s.name == service || s.id == service)
            .ok_or_else(|| {
                EngineError::fatal(format!(
                    "Error response from daemon: service {} not found",
                    service
                ))
            })?;
        if !drop_labels {
            target.labels.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn stack_remove(&self, stack: &str) -> EngineResult<()> {
        let mut host = self.enter(Op::StackRemove)?;
        require_manager(&host)?;
        host.stacks.remove(stack);
        Ok(())
    }
}

#[async_trait]
impl UpstreamDigests for MemoryEngine {
    async fn upstream_digest(&self, reference: &ImageReference) -> Result<Option<String>> {
        let mut host = self.host();
        host.calls.push(Op::UpstreamDigest);
        if let Some(err) = host
            .faults
            .get_mut(&Op::UpstreamDigest)
            .and_then(VecDeque::pop_front)
        {
            return Err(crate::error::MoorError::Unavailable(err.message));
        }
        Ok(host.registry.get(&reference.to_string()).cloned())
    }
}

fn image_key(reference: &str) -> String {
    ImageReference::parse(reference)
        .map(|r| r.to_string())
        .unwrap_or_else(|_| reference.to_string())
}

/// Local image as it looks after pulling `key` at `digest`
fn pulled_image(key: &str, digest: &str) -> ImageInfo {
    let name = match (key.split_once('@'), key.rsplit_once(':')) {
        (Some((name, _)), _) => name,
        (None, Some((name, tag))) if !tag.contains('/') => name,
        _ => key,
    };
    ImageInfo {
        id: digest_bytes(digest.as_bytes()),
        repo_digests: vec![format!("{}@{}", name, digest)],
    }
}

fn node_addr(spec: &SwarmNodeSpec) -> String {
    spec.advertise_host()
        .or_else(|| spec.listen_addr.as_deref().and_then(host_ip))
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

fn already_in_swarm() -> EngineError {
    EngineError::fatal(
        "Error response from daemon: This node is already part of a swarm. Use \"docker swarm leave\" to leave this swarm and join another one.",
    )
}

fn require_manager(host: &HostState) -> EngineResult<()> {
    if host.swarm.local_state == SwarmState::Active && host.swarm.is_manager {
        Ok(())
    } else {
        Err(EngineError::fatal(
            "Error response from daemon: This node is not a swarm manager.",
        ))
    }
}
