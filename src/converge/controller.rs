//! One convergence pass
//!
//! `Start → Reading → Diffing → (Converged | Executing → Verifying →
//! (Converged | Failed))`. The controller keeps nothing between passes: every
//! pass reads observed state from scratch, and a pass never loops.

use super::action::Action;
use super::differ::diff;
use super::executor::Executor;
use super::retry::RetryPolicy;
use crate::engine::Engine;
use crate::error::{MoorError, Result};
use crate::image::UpstreamDigests;
use crate::resource::{Resource, ResourceRef};
use crate::state::{Snapshot, StateReader};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Phase of a convergence pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassState {
    Start,
    Reading,
    Diffing,
    Executing,
    Verifying,
    Converged,
    Failed,
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PassState::Start => "starting",
            PassState::Reading => "reading",
            PassState::Diffing => "diffing",
            PassState::Executing => "executing",
            PassState::Verifying => "verifying",
            PassState::Converged => "converged",
            PassState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a pass is, as seen from outside it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub state: PassState,
    /// Verb of the decided action, once diffed
    pub action: Option<&'static str>,
}

/// How a pass ended
#[derive(Debug)]
pub enum Outcome {
    /// Already converged, nothing was done
    Unchanged,
    Changed,
    Failed(MoorError),
}

/// Caller-facing result of one pass
#[derive(Debug)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub resource: ResourceRef,
    /// Verb of the action taken or attempted
    pub action: &'static str,
    pub attempts: u32,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl PassReport {
    pub fn changed(&self) -> bool {
        matches!(self.outcome, Outcome::Changed)
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }

    pub fn error(&self) -> Option<&MoorError> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// One line for operators
    pub fn summary(&self) -> String {
        let plural = if self.attempts == 1 { "" } else { "s" };
        match &self.outcome {
            Outcome::Unchanged => format!("{}: unchanged", self.resource),
            Outcome::Changed => format!(
                "{}: {} succeeded after {} attempt{} ({} ms)",
                self.resource,
                self.action,
                self.attempts,
                plural,
                self.elapsed.as_millis()
            ),
            Outcome::Failed(e) => format!(
                "{}: {} failed after {} attempt{} [{}]: {}",
                self.resource,
                self.action,
                self.attempts,
                plural,
                e.cause(),
                e
            ),
        }
    }
}

/// Drives single convergence passes
#[derive(Clone)]
pub struct Controller {
    reader: StateReader,
    executor: Executor,
}

impl Controller {
    pub fn new(
        engine: Arc<dyn Engine>,
        upstream: Arc<dyn UpstreamDigests>,
        policy: RetryPolicy,
    ) -> Self {
        let reader = StateReader::new(engine.clone(), upstream);
        let executor = Executor::new(engine, reader.clone(), policy);
        Self { reader, executor }
    }

    pub fn reader(&self) -> &StateReader {
        &self.reader
    }

    /// Read and diff only
    pub async fn plan(&self, desired: &Resource) -> Result<(Snapshot, Action)> {
        let snapshot = self.reader.snapshot(desired).await?;
        let action = diff(desired, &snapshot)?;
        Ok((snapshot, action))
    }

    /// Run one pass to completion
    pub async fn converge(&self, desired: &Resource) -> PassReport {
        self.converge_until(desired, std::future::pending::<()>())
            .await
    }

    /// Run one pass, abandoning it at the next suspension point once
    /// `cancel` completes
    pub async fn converge_until<F>(&self, desired: &Resource, cancel: F) -> PassReport
    where
        F: Future<Output = ()>,
    {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let (progress_tx, progress) = watch::channel(Progress {
            state: PassState::Start,
            action: None,
        });
        let span = info_span!("pass", id = %pass_id, resource = %desired.reference());

        let (result, attempts) = tokio::select! {
            biased;
            _ = cancel => {
                let at = *progress.borrow();
                warn!(pass = %pass_id, resource = %desired.reference(), "Pass cancelled while {}", at.state);
                (Err(MoorError::Cancelled(at.state.to_string())), 0)
            }
            done = self.run(desired, progress_tx).instrument(span) => done,
        };

        let at = *progress.borrow();
        let outcome = match result {
            Ok(true) => Outcome::Changed,
            Ok(false) => Outcome::Unchanged,
            Err(e) => Outcome::Failed(e),
        };
        let report = PassReport {
            pass_id,
            resource: desired.reference(),
            action: at.action.unwrap_or("none"),
            attempts,
            outcome,
            started_at,
            elapsed: started.elapsed(),
        };
        if report.failed() {
            warn!(pass = %pass_id, "{}", report.summary());
        } else {
            info!(pass = %pass_id, "{}", report.summary());
        }
        report
    }

    /// The pass itself. Returns whether anything changed, and how many times
    /// an action was performed.
    async fn run(
        &self,
        desired: &Resource,
        progress: watch::Sender<Progress>,
    ) -> (Result<bool>, u32) {
        let enter = |state: PassState| {
            progress.send_modify(|p| p.state = state);
            debug!("Pass {}", state);
        };

        enter(PassState::Reading);
        let snapshot = match self.reader.snapshot(desired).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                enter(PassState::Failed);
                return (Err(e), 0);
            }
        };

        enter(PassState::Diffing);
        let action = match diff(desired, &snapshot) {
            Ok(action) => action,
            Err(e) => {
                enter(PassState::Failed);
                return (Err(e), 0);
            }
        };
        progress.send_modify(|p| p.action = Some(action.verb()));
        if action.is_noop() {
            enter(PassState::Converged);
            return (Ok(false), 0);
        }

        enter(PassState::Executing);
        let execution = match self.executor.execute(desired, action).await {
            Ok(execution) => execution,
            Err(failure) => {
                enter(PassState::Failed);
                return (Err(failure.error), failure.attempts);
            }
        };
        progress.send_modify(|p| p.action = Some(execution.performed.verb()));

        enter(PassState::Verifying);
        let attempts = execution.attempts;
        if let Err(e) = self.verify(desired).await {
            enter(PassState::Failed);
            return (Err(e), attempts);
        }

        enter(PassState::Converged);
        (Ok(true), attempts)
    }

    /// After a reported success the resource must diff to nothing
    async fn verify(&self, desired: &Resource) -> Result<()> {
        let snapshot = self.reader.snapshot(desired).await?;
        let check = diff(desired, &snapshot)?;
        if check.is_noop() {
            return Ok(());
        }

        let expected = desired
            .fingerprint()
            .map(|fp| fp.to_string())
            .unwrap_or_else(|| "absent".to_string());
        let found = match &snapshot.observed {
            None => "absent".to_string(),
            Some(o) => o
                .fingerprint
                .as_ref()
                .map(|fp| fp.to_string())
                .unwrap_or_else(|| "no fingerprint".to_string()),
        };
        Err(MoorError::Verification { expected, found })
    }
}
