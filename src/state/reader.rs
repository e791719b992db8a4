//! Read-only queries against the engine

use super::{ObservedState, Snapshot, Status};
use crate::engine::{Engine, EngineError, EngineResult, FailureClass, SwarmState};
use crate::error::{MoorError, Result};
use crate::image::{ImageReference, UpstreamDigests};
use crate::resource::fingerprint::{self, Fingerprint, FINGERPRINT_LABEL};
use crate::resource::spec::host_ip;
use crate::resource::{Ensure, Kind, NodeRole, Resource, ResourceRef, ResourceSpec};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reads observed state. Never mutates anything.
#[derive(Clone)]
pub struct StateReader {
    engine: Arc<dyn Engine>,
    upstream: Arc<dyn UpstreamDigests>,
}

impl StateReader {
    pub fn new(engine: Arc<dyn Engine>, upstream: Arc<dyn UpstreamDigests>) -> Self {
        Self { engine, upstream }
    }

    /// Observed state of the object the engine knows as `identity`.
    ///
    /// Returns `None` when it does not exist, which includes a host without
    /// the engine installed. An unreachable daemon is an error: absence
    /// cannot be told apart from not knowing.
    pub async fn read(&self, kind: Kind, identity: &str) -> Result<Option<ObservedState>> {
        let observed = match kind {
            Kind::Image => self.read_image(identity).await,
            Kind::Container => self.read_container(identity).await,
            Kind::SwarmNode => self.read_swarm_node().await,
            Kind::Stack => self.read_stack(identity).await,
        };

        match observed {
            Ok(observed) => {
                debug!(
                    kind = %kind,
                    identity,
                    exists = observed.is_some(),
                    "Read observed state"
                );
                Ok(observed)
            }
            Err(e) if e.class == FailureClass::NotInstalled => {
                debug!(kind = %kind, identity, "Engine not installed, treating as absent");
                Ok(None)
            }
            Err(e) => Err(MoorError::Unavailable(format!(
                "cannot read {} '{}': {}",
                kind, identity, e
            ))),
        }
    }

    /// Observed state of `desired` plus everything the differ needs besides
    pub async fn snapshot(&self, desired: &Resource) -> Result<Snapshot> {
        let mut snapshot = Snapshot {
            observed: self.read(desired.kind(), desired.identity()).await?,
            ..Snapshot::default()
        };

        match desired.spec() {
            Some(ResourceSpec::Container(spec)) => {
                let image = spec.image.to_string();
                match self.read(Kind::Image, &image).await? {
                    Some(observed) => {
                        if desired.ensure() == Ensure::Latest {
                            snapshot.current_image_id = Some(observed.id);
                        }
                    }
                    None => snapshot.missing.push(ResourceRef::new(Kind::Image, image)),
                }
            }
            Some(ResourceSpec::Image(spec))
                if desired.ensure() == Ensure::Latest && snapshot.exists() =>
            {
                snapshot.upstream_digest = self.upstream_digest(&spec.reference).await;
            }
            _ => {}
        }

        Ok(snapshot)
    }

    /// Unknown upstream state is not an error; it just never counts as newer
    async fn upstream_digest(&self, reference: &ImageReference) -> Option<String> {
        match self.upstream.upstream_digest(reference).await {
            Ok(digest) => digest,
            Err(e) => {
                warn!(image = %reference, "Upstream digest unknown: {}", e);
                None
            }
        }
    }

    async fn read_image(&self, identity: &str) -> EngineResult<Option<ObservedState>> {
        let Some(info) = self.engine.inspect_image(identity).await? else {
            return Ok(None);
        };
        let fingerprint = ImageReference::parse(identity)
            .ok()
            .and_then(|r| fingerprint::image(&r).ok());
        Ok(Some(ObservedState {
            id: info.id.clone(),
            fingerprint,
            status: Status::Image {
                image_id: info.id,
                repo_digests: info.repo_digests,
            },
        }))
    }

    async fn read_container(&self, identity: &str) -> EngineResult<Option<ObservedState>> {
        let Some(info) = self.engine.inspect_container(identity).await? else {
            return Ok(None);
        };
        // inspect also matches id prefixes, which would be someone else's container
        if info.name != identity {
            debug!(container = identity, matched = %info.name, "Ignoring container matched by id");
            return Ok(None);
        }
        Ok(Some(ObservedState {
            id: info.id,
            fingerprint: info
                .labels
                .get(FINGERPRINT_LABEL)
                .and_then(|v| Fingerprint::parse(v)),
            status: Status::Container {
                state: info.state,
                image_id: info.image_id,
            },
        }))
    }

    async fn read_swarm_node(&self) -> EngineResult<Option<ObservedState>> {
        let swarm = self.engine.swarm_info().await?;
        match swarm.local_state {
            SwarmState::Inactive => return Ok(None),
            SwarmState::Active => {}
            state => {
                return Err(EngineError::unavailable(format!(
                    "swarm membership is {:?}",
                    state
                )))
            }
        }

        let role = if swarm.is_manager {
            NodeRole::Manager
        } else {
            NodeRole::Worker
        };
        let addr = host_ip(&swarm.node_addr).unwrap_or_else(|| swarm.node_addr.clone());
        let managers: Vec<String> = swarm
            .managers
            .iter()
            .map(|m| host_ip(m).unwrap_or_else(|| m.clone()))
            .collect();
        Ok(Some(ObservedState {
            id: swarm.node_id.clone(),
            fingerprint: fingerprint::membership(role, Some(&addr), managers.first().map(String::as_str))
                .ok(),
            status: Status::SwarmNode {
                node_id: swarm.node_id,
                role,
                addr,
                cluster_id: swarm.cluster_id,
                managers,
            },
        }))
    }

    async fn read_stack(&self, identity: &str) -> EngineResult<Option<ObservedState>> {
        let swarm = self.engine.swarm_info().await?;
        match swarm.local_state {
            SwarmState::Inactive => return Ok(None),
            SwarmState::Active if swarm.is_manager => {}
            SwarmState::Active => {
                return Err(EngineError::unavailable(
                    "stacks can only be read on a swarm manager",
                ))
            }
            state => {
                return Err(EngineError::unavailable(format!(
                    "swarm membership is {:?}",
                    state
                )))
            }
        }

        let services = self.engine.stack_services(identity).await?;
        if services.is_empty() {
            return Ok(None);
        }

        // A stack is only as converged as its least converged service
        let mut labels = services
            .iter()
            .map(|s| s.labels.get(FINGERPRINT_LABEL).and_then(|v| Fingerprint::parse(v)));
        let first = labels.next().flatten();
        let fingerprint = if labels.all(|fp| fp == first) {
            first
        } else {
            None
        };

        Ok(Some(ObservedState {
            id: identity.to_string(),
            fingerprint,
            status: Status::Stack {
                services: services.into_iter().map(|s| s.name).collect(),
            },
        }))
    }
}
