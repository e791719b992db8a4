//! Action execution with retries
//!
//! Each action maps to one logical operation on the engine. Transient
//! failures are retried with backoff; before every retry the resource is
//! read and diffed again, so a retry never repeats work that already took
//! effect.

use super::action::Action;
use super::differ::diff;
use super::retry::RetryPolicy;
use crate::engine::{Engine, EngineError, RunSpec};
use crate::error::{MoorError, Result};
use crate::resource::fingerprint::FINGERPRINT_LABEL;
use crate::resource::spec::{host_ip, ContainerSpec, SwarmNodeSpec};
use crate::resource::{Kind, Resource, ResourceSpec};
use crate::state::StateReader;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a successful execution
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// Number of times an action was performed
    pub attempts: u32,
    /// The last action performed
    pub performed: Action,
    /// A re-read before a retry found the resource already converged
    pub already_converged: bool,
}

/// A failed execution
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    /// Number of times an action was performed before giving up
    pub attempts: u32,
    pub error: MoorError,
}

/// Why one attempt failed
enum Failure {
    Engine(EngineError),
    /// Retrying cannot help, e.g. a recreate that removed the old object
    Fatal(String),
}

type Attempt = std::result::Result<(), Failure>;

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure::Engine(e)
    }
}

/// Runs actions against the engine
#[derive(Clone)]
pub struct Executor {
    engine: Arc<dyn Engine>,
    reader: StateReader,
    policy: RetryPolicy,
}

impl Executor {
    pub fn new(engine: Arc<dyn Engine>, reader: StateReader, policy: RetryPolicy) -> Self {
        Self {
            engine,
            reader,
            policy,
        }
    }

    /// Execute `action` for `desired`, retrying transient failures
    pub async fn execute(
        &self,
        desired: &Resource,
        action: Action,
    ) -> std::result::Result<Execution, ExecutionFailure> {
        let mut attempts = 0;
        let result = self.retry(desired, action, &mut attempts).await;
        result.map_err(|error| ExecutionFailure { attempts, error })
    }

    async fn retry(
        &self,
        desired: &Resource,
        action: Action,
        attempts: &mut u32,
    ) -> Result<Execution> {
        if action.is_noop() {
            return Ok(Execution {
                attempts: 0,
                performed: action,
                already_converged: true,
            });
        }

        let mut action = action;
        loop {
            *attempts += 1;
            let attempt = *attempts;
            info!(
                resource = %desired.reference(),
                action = %action,
                attempt,
                "Executing action"
            );

            let err = match self.perform(desired, &action).await {
                Ok(()) => {
                    return Ok(Execution {
                        attempts: attempt,
                        performed: action,
                        already_converged: false,
                    })
                }
                Err(Failure::Fatal(message)) => return Err(MoorError::FatalExecution(message)),
                Err(Failure::Engine(e)) if !e.is_retryable() => {
                    return Err(MoorError::FatalExecution(format!(
                        "{} {}: {}",
                        action.verb(),
                        desired.reference(),
                        e
                    )))
                }
                Err(Failure::Engine(e)) => e,
            };

            if !self.policy.should_retry(attempt) {
                return Err(MoorError::TransientExecution {
                    attempts: attempt,
                    message: format!("{} {}: {}", action.verb(), desired.reference(), err),
                });
            }

            let delay = self.policy.delay(attempt);
            warn!(
                resource = %desired.reference(),
                action = action.verb(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying: {}",
                err
            );
            tokio::time::sleep(delay).await;

            match self.reader.snapshot(desired).await {
                Ok(snapshot) => {
                    let next = diff(desired, &snapshot)?;
                    if next.is_noop() {
                        info!(
                            resource = %desired.reference(),
                            "Already converged after {} attempt(s)",
                            attempt
                        );
                        return Ok(Execution {
                            attempts: attempt,
                            performed: action,
                            already_converged: true,
                        });
                    }
                    action = next;
                }
                Err(MoorError::Unavailable(e)) => {
                    debug!(resource = %desired.reference(), "Re-read failed, keeping action: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn perform(&self, desired: &Resource, action: &Action) -> Attempt {
        match action {
            Action::NoOp => Ok(()),
            Action::Remove { id } => self.remove(desired, id).await,
            Action::Create(spec) => self.create(desired, spec).await,
            Action::Recreate { old_id, spec } => match spec {
                ResourceSpec::Image(image) => {
                    Ok(self.engine.pull_image(&image.reference.to_string()).await?)
                }
                ResourceSpec::Container(container) => {
                    self.engine.remove_container(old_id).await?;
                    let run = run_spec(desired, container);
                    self.engine.run_container(&run).await.map(drop).map_err(|e| {
                        Failure::Fatal(format!(
                            "{} was removed but could not be started again, left absent: {}",
                            desired.reference(),
                            e
                        ))
                    })
                }
                _ => Err(unsupported(desired, action)),
            },
            Action::Redeploy { old_id, spec } => match spec {
                ResourceSpec::Stack(_) => self.create(desired, spec).await,
                ResourceSpec::SwarmNode(node) => self.rejoin(desired, old_id, node).await,
                _ => Err(unsupported(desired, action)),
            },
        }
    }

    async fn create(&self, desired: &Resource, spec: &ResourceSpec) -> Attempt {
        match spec {
            ResourceSpec::Image(image) => {
                Ok(self.engine.pull_image(&image.reference.to_string()).await?)
            }
            ResourceSpec::Container(container) => {
                let run = run_spec(desired, container);
                let id = self.engine.run_container(&run).await?;
                debug!(container = %run.name, id = %id, "Container started");
                Ok(())
            }
            ResourceSpec::SwarmNode(node) => self.join(node).await,
            ResourceSpec::Stack(stack) => {
                let stack_name = desired.identity();
                self.engine.stack_deploy(stack_name, &stack.paths()).await?;
                let fingerprint = desired
                    .fingerprint()
                    .map(|fp| fp.to_string())
                    .unwrap_or_default();
                for service in self.engine.stack_services(stack_name).await? {
                    self.engine
                        .label_service(&service.name, FINGERPRINT_LABEL, &fingerprint)
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn remove(&self, desired: &Resource, id: &str) -> Attempt {
        let identity = desired.identity();
        let result = match desired.kind() {
            Kind::Image => self.engine.remove_image(identity).await,
            Kind::Container => self.engine.remove_container(id).await,
            Kind::SwarmNode => self.engine.swarm_leave().await,
            Kind::Stack => self.engine.stack_remove(identity).await,
        };
        Ok(result?)
    }

    async fn join(&self, node: &SwarmNodeSpec) -> Attempt {
        if node.init {
            self.engine.swarm_init(node).await?;
        } else {
            self.engine.swarm_join(node).await?;
        }
        Ok(())
    }

    /// Change membership in place: a role change is a promotion or demotion,
    /// anything else means leaving and joining again
    async fn rejoin(
        &self,
        desired: &Resource,
        node_id: &str,
        node: &SwarmNodeSpec,
    ) -> Attempt {
        let swarm = self.engine.swarm_info().await?;
        let address_matches = match node.advertise_host() {
            None => true,
            Some(host) => host_ip(&swarm.node_addr).as_deref() == Some(host.as_str()),
        };
        let target_matches = match node.manager_host() {
            None => true,
            Some(host) => swarm
                .managers
                .iter()
                .any(|m| host_ip(m).as_deref().unwrap_or(m.as_str()) == host),
        };

        if address_matches && target_matches {
            return Ok(self.engine.set_node_role(node_id, node.role).await?);
        }

        self.engine.swarm_leave().await?;
        self.join(node).await.map_err(|e| {
            let cause = match e {
                Failure::Engine(e) => e.message,
                Failure::Fatal(message) => message,
            };
            Failure::Fatal(format!(
                "{} left the swarm but could not join again: {}",
                desired.reference(),
                cause
            ))
        })
    }
}

/// `docker run` parameters for a container resource
fn run_spec(desired: &Resource, spec: &ContainerSpec) -> RunSpec {
    let mut labels = BTreeMap::new();
    if let Some(fp) = desired.fingerprint() {
        labels.insert(FINGERPRINT_LABEL.to_string(), fp.to_string());
    }
    RunSpec {
        name: desired.identity().to_string(),
        image: spec.image.to_string(),
        command: spec.command.clone(),
        restart: spec.restart.clone(),
        net: spec.net.clone(),
        env: spec.env.clone(),
        ports: spec.ports.clone(),
        volumes: spec.volumes.clone(),
        hostname: spec.hostname.clone(),
        extra_parameters: spec.extra_parameters.clone(),
        labels,
    }
}

fn unsupported(desired: &Resource, action: &Action) -> Failure {
    Failure::Fatal(format!(
        "cannot {} {}",
        action.verb(),
        desired.reference()
    ))
}
