//! Applying a whole manifest
//!
//! Resources are converged one at a time in declared order (reverse order
//! when tearing down). Ordering between unrelated resources is the caller's
//! business; this runner only adds an optional pass-level retry for failures
//! whose message matches a pattern.

use crate::converge::{Action, Controller, PassReport};
use crate::error::Result;
use crate::resource::{validate_all, RawResource, Resource, ResourceRef};
use regex::Regex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// How a manifest is applied
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Re-run a failed pass when its error matches
    pub retry_on: Option<Regex>,
    /// Extra passes allowed per resource when `retry_on` matches
    pub retries: u32,
    pub retry_delay: Duration,
    /// Force `ensure => absent` on every resource
    pub destroy: bool,
}

/// Result of applying a manifest
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub passes: Vec<PassReport>,
    /// Resources skipped because the run was cancelled
    pub skipped: Vec<ResourceRef>,
}

impl ApplyReport {
    pub fn changes(&self) -> usize {
        self.passes.iter().filter(|p| p.changed()).count()
    }

    pub fn failures(&self) -> usize {
        self.passes.iter().filter(|p| p.failed()).count()
    }

    /// Detailed exit code: 0 nothing to do, 2 changes, 4 failures,
    /// 6 changes and failures
    pub fn exit_code(&self) -> i32 {
        let mut code = 0;
        if self.changes() > 0 {
            code |= 2;
        }
        if self.failures() > 0 || !self.skipped.is_empty() {
            code |= 4;
        }
        code
    }
}

/// Validate raw resources, honouring `destroy`
pub fn prepare(raws: Vec<RawResource>, destroy: bool) -> Result<Vec<Resource>> {
    let raws: Vec<RawResource> = if destroy {
        raws.into_iter().rev().map(RawResource::force_absent).collect()
    } else {
        raws
    };
    validate_all(&raws)
}

/// Decide what each resource would need without changing anything
pub async fn plan(
    controller: &Controller,
    resources: &[Resource],
) -> Vec<(ResourceRef, Result<Action>)> {
    let mut plans = Vec::with_capacity(resources.len());
    for resource in resources {
        let action = controller.plan(resource).await.map(|(_, action)| action);
        plans.push((resource.reference(), action));
    }
    plans
}

/// Converge every resource in order. Setting `shutdown` to `true` abandons
/// the current pass and skips the rest.
pub async fn apply(
    controller: &Controller,
    resources: &[Resource],
    options: &ApplyOptions,
    shutdown: watch::Receiver<bool>,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for (index, resource) in resources.iter().enumerate() {
        if *shutdown.borrow() {
            report
                .skipped
                .extend(resources[index..].iter().map(Resource::reference));
            break;
        }

        let mut retries_left = options.retries;
        let pass = loop {
            let mut signal = shutdown.clone();
            let cancelled = async move {
                // a dropped sender means nobody can cancel any more
                if signal.wait_for(|stop| *stop).await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let pass = controller.converge_until(resource, cancelled).await;

            let retry = match (&options.retry_on, pass.error()) {
                (Some(pattern), Some(e)) if retries_left > 0 && !*shutdown.borrow() => {
                    pattern.is_match(&e.to_string())
                }
                _ => false,
            };
            if !retry {
                break pass;
            }

            retries_left -= 1;
            warn!(
                resource = %resource.reference(),
                retries_left,
                "Pass failed with a retryable error, running it again: {}",
                pass.summary()
            );
            tokio::time::sleep(options.retry_delay).await;
        };
        report.passes.push(pass);
    }

    info!(
        changes = report.changes(),
        failures = report.failures(),
        skipped = report.skipped.len(),
        "Apply finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converge::RetryPolicy;
    use crate::engine::memory::{MemoryEngine, Op};
    use crate::engine::EngineError;
    use crate::resource::Manifest;
    use std::sync::Arc;

    const MANIFEST: &str = r#"
resources:
  - kind: image
    name: busybox
  - kind: container
    name: web
    image: busybox
    command: sleep 600
"#;

    fn setup() -> (Arc<MemoryEngine>, Controller) {
        let engine = Arc::new(MemoryEngine::new());
        engine.publish("busybox", "sha256:aaa");
        let controller = Controller::new(engine.clone(), engine.clone(), RetryPolicy::once());
        (engine, controller)
    }

    fn resources(destroy: bool) -> Vec<Resource> {
        let manifest = Manifest::parse_str(MANIFEST).unwrap();
        prepare(manifest.resources, destroy).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_codes() {
        let (_engine, controller) = setup();
        let (_tx, rx) = watch::channel(false);

        let first = apply(&controller, &resources(false), &ApplyOptions::default(), rx.clone()).await;
        assert_eq!(first.changes(), 2);
        assert_eq!(first.exit_code(), 2);

        let second = apply(&controller, &resources(false), &ApplyOptions::default(), rx).await;
        assert_eq!(second.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_runs_in_reverse() {
        let (engine, controller) = setup();
        let (_tx, rx) = watch::channel(false);
        apply(&controller, &resources(false), &ApplyOptions::default(), rx.clone()).await;

        let teardown = resources(true);
        assert_eq!(teardown[0].name(), "web");
        let report = apply(&controller, &teardown, &ApplyOptions::default(), rx).await;
        assert_eq!(report.exit_code(), 2, "{:?}", report);
        assert!(engine.container("web").is_none());
        assert!(engine.image("busybox").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_level_retry_on_matching_error() {
        let (engine, controller) = setup();
        let (_tx, rx) = watch::channel(false);
        engine.fail_next(
            Op::PullImage,
            EngineError::fatal("Error response from daemon: connection failure running pull"),
        );
        let options = ApplyOptions {
            retry_on: Some(Regex::new("connection failure").unwrap()),
            retries: 2,
            retry_delay: Duration::from_secs(5),
            destroy: false,
        };

        let report = apply(&controller, &resources(false), &options, rx).await;
        assert_eq!(report.failures(), 0);
        assert_eq!(engine.count(Op::PullImage), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_changes() {
        let (engine, controller) = setup();
        let (_tx, rx) = watch::channel(false);
        engine.fail_next(Op::RunContainer, EngineError::fatal("invalid argument"));

        let report = apply(&controller, &resources(false), &ApplyOptions::default(), rx).await;
        assert_eq!(report.changes(), 1);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.exit_code(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_skips_remaining() {
        let (engine, controller) = setup();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = apply(&controller, &resources(false), &ApplyOptions::default(), rx).await;
        assert!(report.passes.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.exit_code(), 4);
        assert!(engine.calls().is_empty());
    }
}
