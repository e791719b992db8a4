//! Desired versus observed state
//!
//! `diff` is a pure function: the same resource and snapshot always give the
//! same action, and it never touches the engine.
//!
//! | ensure         | exists | fingerprint matches  | action              |
//! |----------------|--------|----------------------|---------------------|
//! | present/latest | no     |                      | create              |
//! | present        | yes    | yes                  | noop                |
//! | present/latest | yes    | no                   | recreate / redeploy |
//! | latest         | yes    | yes, upstream newer  | recreate            |
//! | absent         | no     |                      | noop                |
//! | absent         | yes    |                      | remove              |
//!
//! A missing referenced resource fails the diff before any create or
//! recreate.

use super::action::Action;
use crate::error::{MoorError, Result};
use crate::resource::fingerprint::{self, Fingerprint};
use crate::resource::spec::SwarmNodeSpec;
use crate::resource::{Ensure, Kind, NodeRole, Resource, ResourceSpec};
use crate::state::{ObservedState, Snapshot, Status};

/// Decide the action that moves `desired` towards convergence
pub fn diff(desired: &Resource, snapshot: &Snapshot) -> Result<Action> {
    let observed = snapshot.observed.as_ref();

    if desired.ensure() == Ensure::Absent {
        return Ok(match observed {
            None => Action::NoOp,
            Some(o) => Action::Remove { id: o.id.clone() },
        });
    }

    let spec = desired.spec().ok_or_else(|| {
        MoorError::Validation(format!("{} has no parameters", desired.reference()))
    })?;

    let action = match observed {
        None => Action::Create(spec.clone()),
        Some(o) if !fingerprint_matches(desired, spec, o)? => replace(spec, o),
        Some(o) if desired.ensure() == Ensure::Latest && upstream_newer(spec, snapshot, o) => {
            Action::Recreate {
                old_id: o.id.clone(),
                spec: spec.clone(),
            }
        }
        Some(_) => Action::NoOp,
    };

    if matches!(action, Action::Create(_) | Action::Recreate { .. }) {
        if let Some(missing) = snapshot.missing.first() {
            return Err(MoorError::Dependency(missing.clone()));
        }
    }

    Ok(action)
}

/// Containers and images are immutable, stacks and membership are updated
/// in place
fn replace(spec: &ResourceSpec, observed: &ObservedState) -> Action {
    let old_id = observed.id.clone();
    let spec = spec.clone();
    match spec.kind() {
        Kind::Image | Kind::Container => Action::Recreate { old_id, spec },
        Kind::SwarmNode | Kind::Stack => Action::Redeploy { old_id, spec },
    }
}

fn fingerprint_matches(
    desired: &Resource,
    spec: &ResourceSpec,
    observed: &ObservedState,
) -> Result<bool> {
    let observed_fp = match (spec, &observed.status) {
        (
            ResourceSpec::SwarmNode(node),
            Status::SwarmNode {
                role,
                addr,
                managers,
                ..
            },
        ) => Some(project_membership(node, *role, addr, managers)?),
        _ => observed.fingerprint.clone(),
    };
    Ok(observed_fp.as_ref() == desired.fingerprint())
}

/// Membership fingerprint restricted to what the desired state pins down.
/// A pinned join target matches when it is any of the known managers.
fn project_membership(
    node: &SwarmNodeSpec,
    role: NodeRole,
    addr: &str,
    managers: &[String],
) -> Result<Fingerprint> {
    let advertise = node.advertise_host().map(|_| addr);
    let target = node.manager_host().map(|wanted| {
        if managers.contains(&wanted) {
            wanted
        } else {
            managers.join(",")
        }
    });
    fingerprint::membership(role, advertise, target.as_deref())
}

/// Unknown upstream state never counts as newer
fn upstream_newer(spec: &ResourceSpec, snapshot: &Snapshot, observed: &ObservedState) -> bool {
    match (spec, &observed.status) {
        (ResourceSpec::Image(image), Status::Image { repo_digests, .. }) => snapshot
            .upstream_digest
            .as_deref()
            .is_some_and(|digest| !image.reference.has_repo_digest(repo_digests, digest)),
        (ResourceSpec::Container(_), Status::Container { image_id, .. }) => snapshot
            .current_image_id
            .as_deref()
            .is_some_and(|current| current != image_id),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ContainerState;
    use crate::image::ImageReference;
    use crate::resource::spec::{ComposeSource, ContainerSpec, ImageSpec, StackSpec};
    use crate::resource::ResourceRef;

    fn container(ensure: Ensure) -> Resource {
        let spec = ContainerSpec::new(ImageReference::parse("busybox").unwrap()).command("sleep 60");
        Resource::new("web", ensure, ResourceSpec::Container(spec)).unwrap()
    }

    fn image(ensure: Ensure) -> Resource {
        let spec = ImageSpec {
            reference: ImageReference::parse("busybox").unwrap(),
        };
        Resource::new("busybox", ensure, ResourceSpec::Image(spec)).unwrap()
    }

    fn running(fingerprint: Option<Fingerprint>, image_id: &str) -> Snapshot {
        Snapshot {
            observed: Some(ObservedState {
                id: "c1".to_string(),
                fingerprint,
                status: Status::Container {
                    state: ContainerState::Running,
                    image_id: image_id.to_string(),
                },
            }),
            ..Snapshot::default()
        }
    }

    fn cached_image(desired: &Resource, digest: &str) -> Snapshot {
        Snapshot {
            observed: Some(ObservedState {
                id: "sha256:i1".to_string(),
                fingerprint: desired.fingerprint().cloned(),
                status: Status::Image {
                    image_id: "sha256:i1".to_string(),
                    repo_digests: vec![format!("docker.io/library/busybox@{}", digest)],
                },
            }),
            ..Snapshot::default()
        }
    }

    #[test]
    fn test_create_when_missing() {
        let desired = container(Ensure::Present);
        let action = diff(&desired, &Snapshot::default()).unwrap();
        assert_eq!(action.verb(), "create");
    }

    #[test]
    fn test_noop_when_fingerprint_matches() {
        let desired = container(Ensure::Present);
        let snapshot = running(desired.fingerprint().cloned(), "sha256:i1");
        assert_eq!(diff(&desired, &snapshot).unwrap(), Action::NoOp);
    }

    #[test]
    fn test_stopped_container_with_matching_fingerprint_is_noop() {
        let desired = container(Ensure::Present);
        let mut snapshot = running(desired.fingerprint().cloned(), "sha256:i1");
        if let Some(ObservedState {
            status: Status::Container { state, .. },
            ..
        }) = snapshot.observed.as_mut()
        {
            *state = ContainerState::Exited;
        }
        assert_eq!(diff(&desired, &snapshot).unwrap(), Action::NoOp);
    }

    #[test]
    fn test_recreate_on_drift() {
        let desired = container(Ensure::Present);
        let snapshot = running(Some(Fingerprint::of("other").unwrap()), "sha256:i1");
        assert!(matches!(
            diff(&desired, &snapshot).unwrap(),
            Action::Recreate { ref old_id, .. } if old_id == "c1"
        ));

        // an unlabelled container was not created from this configuration
        let unlabelled = running(None, "sha256:i1");
        assert_eq!(diff(&desired, &unlabelled).unwrap().verb(), "recreate");
    }

    #[test]
    fn test_absent() {
        let desired = container(Ensure::Present).to_absent();
        assert_eq!(diff(&desired, &Snapshot::default()).unwrap(), Action::NoOp);
        let snapshot = running(None, "sha256:i1");
        assert_eq!(
            diff(&desired, &snapshot).unwrap(),
            Action::Remove {
                id: "c1".to_string()
            }
        );
    }

    #[test]
    fn test_dependency_wins_before_create() {
        let desired = container(Ensure::Present);
        let snapshot = Snapshot {
            missing: vec![ResourceRef::new(Kind::Image, "docker.io/library/busybox:latest")],
            ..Snapshot::default()
        };
        let err = diff(&desired, &snapshot).unwrap_err();
        assert!(matches!(err, MoorError::Dependency(ref r) if r.kind == Kind::Image));
    }

    #[test]
    fn test_latest_image() {
        let desired = image(Ensure::Latest);
        let mut snapshot = cached_image(&desired, "sha256:old");

        // upstream unknown: not newer
        assert_eq!(diff(&desired, &snapshot).unwrap(), Action::NoOp);

        snapshot.upstream_digest = Some("sha256:old".to_string());
        assert_eq!(diff(&desired, &snapshot).unwrap(), Action::NoOp);

        snapshot.upstream_digest = Some("sha256:new".to_string());
        assert_eq!(diff(&desired, &snapshot).unwrap().verb(), "recreate");
    }

    #[test]
    fn test_present_image_ignores_upstream() {
        let desired = image(Ensure::Present);
        let mut snapshot = cached_image(&desired, "sha256:old");
        snapshot.upstream_digest = Some("sha256:new".to_string());
        assert_eq!(diff(&desired, &snapshot).unwrap(), Action::NoOp);
    }

    #[test]
    fn test_latest_container_follows_local_image() {
        let desired = container(Ensure::Latest);
        let mut snapshot = running(desired.fingerprint().cloned(), "sha256:i1");
        snapshot.current_image_id = Some("sha256:i1".to_string());
        assert_eq!(diff(&desired, &snapshot).unwrap(), Action::NoOp);

        snapshot.current_image_id = Some("sha256:i2".to_string());
        assert_eq!(diff(&desired, &snapshot).unwrap().verb(), "recreate");
    }

    #[test]
    fn test_stack_redeploys_in_place() {
        let spec = StackSpec {
            compose_files: vec![ComposeSource {
                path: "a.yml".into(),
                digest: "sha256:a".to_string(),
            }],
        };
        let desired = Resource::new("web", Ensure::Present, ResourceSpec::Stack(spec)).unwrap();
        let snapshot = Snapshot {
            observed: Some(ObservedState {
                id: "web".to_string(),
                fingerprint: None,
                status: Status::Stack {
                    services: vec!["web_app".to_string()],
                },
            }),
            ..Snapshot::default()
        };
        assert_eq!(diff(&desired, &snapshot).unwrap().verb(), "redeploy");
    }

    fn member(role: NodeRole, advertise_addr: Option<&str>) -> Resource {
        let spec = SwarmNodeSpec {
            role,
            init: true,
            advertise_addr: advertise_addr.map(str::to_string),
            listen_addr: Some("0.0.0.0:2377".to_string()),
            token: None,
            manager_ip: None,
        };
        Resource::new("swarm", Ensure::Present, ResourceSpec::SwarmNode(spec)).unwrap()
    }

    fn joined(role: NodeRole, addr: &str) -> Snapshot {
        joined_via(role, addr, &[addr])
    }

    fn joined_via(role: NodeRole, addr: &str, managers: &[&str]) -> Snapshot {
        Snapshot {
            observed: Some(ObservedState {
                id: "node1".to_string(),
                fingerprint: None,
                status: Status::SwarmNode {
                    node_id: "node1".to_string(),
                    role,
                    addr: addr.to_string(),
                    cluster_id: Some("cluster1".to_string()),
                    managers: managers.iter().map(|m| m.to_string()).collect(),
                },
            }),
            ..Snapshot::default()
        }
    }

    #[test]
    fn test_swarm_projection() {
        // interface names cannot be compared, so only the role counts
        let desired = member(NodeRole::Manager, Some("eth0"));
        assert_eq!(
            diff(&desired, &joined(NodeRole::Manager, "10.0.0.9")).unwrap(),
            Action::NoOp
        );

        let pinned = member(NodeRole::Manager, Some("10.0.0.1:2377"));
        assert_eq!(
            diff(&pinned, &joined(NodeRole::Manager, "10.0.0.1")).unwrap(),
            Action::NoOp
        );
        assert_eq!(
            diff(&pinned, &joined(NodeRole::Manager, "10.0.0.9")).unwrap().verb(),
            "redeploy"
        );
        assert_eq!(
            diff(&pinned, &joined(NodeRole::Worker, "10.0.0.1")).unwrap().verb(),
            "redeploy"
        );
    }

    fn worker_of(manager_ip: &str) -> Resource {
        let spec = SwarmNodeSpec {
            role: NodeRole::Worker,
            init: false,
            advertise_addr: None,
            listen_addr: None,
            token: Some("SWMTKN-1-worker".to_string()),
            manager_ip: Some(manager_ip.to_string()),
        };
        Resource::new("swarm", Ensure::Present, ResourceSpec::SwarmNode(spec)).unwrap()
    }

    #[test]
    fn test_swarm_join_target() {
        let snapshot = joined_via(NodeRole::Worker, "10.0.0.5", &["10.0.0.1", "10.0.0.2"]);
        assert_eq!(
            diff(&worker_of("10.0.0.2:2377"), &snapshot).unwrap(),
            Action::NoOp
        );
        assert_eq!(
            diff(&worker_of("10.9.9.9:2377"), &snapshot).unwrap().verb(),
            "redeploy"
        );

        // a hostname target cannot be compared against the engine's view
        assert_eq!(
            diff(&worker_of("manager.internal:2377"), &snapshot).unwrap(),
            Action::NoOp
        );
    }
}
