//! Server lifecycle state machine and bounded polling.
//!
//! [`ManagedBackend`] wraps one adapter and enforces the stage order:
//!
//! ```text
//! Built ──provision──▶ Provisioned ──activate──▶ Activated ──ready──▶ Serving
//!   ▲                                                                    │
//!   └──────────── provision (revive) ◀── Decommissioned ◀──decommission──┘
//! ```
//!
//! Re-entering a stage that already completed is allowed and delegated to the
//! adapter, which must treat it idempotently. A pending outcome leaves the
//! stage where it was so the caller can simply retry.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::backend::{
    Answer, AnswerMode, Backend, BackendError, InstanceName, Readiness, StageOutcome,
};

/// Default interval between readiness probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle stage of a managed adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Built,
    Provisioned,
    Activated,
    Serving,
    Decommissioned,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Built => "built",
            Stage::Provisioned => "provisioned",
            Stage::Activated => "activated",
            Stage::Serving => "serving",
            Stage::Decommissioned => "decommissioned",
        };
        f.write_str(name)
    }
}

/// Errors from driving an adapter through its lifecycle.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{instance}: cannot {attempted} while {current}")]
    OutOfOrder {
        instance: InstanceName,
        attempted: &'static str,
        current: Stage,
    },

    #[error("{instance}: {source}")]
    Backend {
        instance: InstanceName,
        #[source]
        source: BackendError,
    },
}

/// An adapter together with its lifecycle stage.
pub struct ManagedBackend {
    backend: Box<dyn Backend>,
    stage: Stage,
}

impl ManagedBackend {
    /// Take ownership of a freshly built adapter.
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            stage: Stage::Built,
        }
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The wrapped adapter.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Derived instance name.
    pub fn instance_name(&self) -> &InstanceName {
        self.backend.instance_name()
    }

    /// Whether the provision stage has not completed yet.
    pub fn needs_provision(&self) -> bool {
        matches!(self.stage, Stage::Built | Stage::Decommissioned)
    }

    /// Whether the activate stage has not completed yet.
    pub fn needs_activation(&self) -> bool {
        self.stage < Stage::Activated || self.stage == Stage::Decommissioned
    }

    /// Run the provision stage.
    pub async fn provision(&mut self) -> Result<StageOutcome, LifecycleError> {
        let outcome = self
            .backend
            .provision()
            .await
            .map_err(|source| self.backend_error(source))?;

        self.settle("provision", &outcome, Stage::Provisioned);
        Ok(outcome)
    }

    /// Run the activate stage, bounded by `max_wait`.
    pub async fn activate(&mut self, max_wait: Duration) -> Result<StageOutcome, LifecycleError> {
        if self.needs_provision() {
            return Err(LifecycleError::OutOfOrder {
                instance: self.instance_name().clone(),
                attempted: "activate",
                current: self.stage,
            });
        }

        let outcome = self
            .backend
            .activate(max_wait)
            .await
            .map_err(|source| self.backend_error(source))?;

        self.settle("activate", &outcome, Stage::Activated);
        Ok(outcome)
    }

    /// Probe readiness. A decommissioned adapter is never ready.
    pub async fn check_ready(&self) -> Result<Readiness, LifecycleError> {
        if self.stage == Stage::Decommissioned {
            return Ok(Readiness::not_ready("decommissioned"));
        }

        self.backend
            .check_ready()
            .await
            .map_err(|source| self.backend_error(source))
    }

    /// Record that the adapter answered ready after activation.
    pub fn mark_serving(&mut self) {
        if self.stage == Stage::Activated {
            self.stage = Stage::Serving;
        }
    }

    /// Answer one query through the adapter.
    pub async fn answer(&self, query: &str, mode: AnswerMode) -> Answer {
        if self.stage != Stage::Serving {
            tracing::debug!(
                instance = %self.instance_name(),
                stage = %self.stage,
                "Answering outside the serving stage"
            );
        }
        self.backend.answer(query, mode).await
    }

    /// Release the resource. Repeating it is a no-op.
    pub async fn decommission(&mut self) -> Result<(), LifecycleError> {
        if self.stage == Stage::Decommissioned {
            tracing::debug!(instance = %self.instance_name(), "Already decommissioned");
            return Ok(());
        }

        self.backend
            .decommission()
            .await
            .map_err(|source| self.backend_error(source))?;
        self.stage = Stage::Decommissioned;
        Ok(())
    }

    fn settle(&mut self, step: &'static str, outcome: &StageOutcome, target: Stage) {
        match outcome {
            StageOutcome::Completed => {
                if self.stage == Stage::Decommissioned || self.stage < target {
                    self.stage = target;
                }
            }
            StageOutcome::Pending { reason } => {
                tracing::warn!(
                    instance = %self.instance_name(),
                    step,
                    reason = %reason,
                    "Stage pending, retry later"
                );
            }
        }
    }

    fn backend_error(&self, source: BackendError) -> LifecycleError {
        LifecycleError::Backend {
            instance: self.instance_name().clone(),
            source,
        }
    }
}

impl fmt::Debug for ManagedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedBackend")
            .field("instance", self.instance_name())
            .field("kind", &self.backend.kind())
            .field("stage", &self.stage)
            .finish()
    }
}

/// Fixed-interval polling with an optional overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between probes
    pub interval: Duration,

    /// Give up after this long; `None` polls until done or dropped
    pub deadline: Option<Duration>,
}

impl PollPolicy {
    /// Poll every `interval` with no deadline.
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Poll every `interval` for at most `max_wait`.
    pub fn bounded(interval: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            deadline: Some(max_wait),
        }
    }

    /// Set the overall deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::every(DEFAULT_POLL_INTERVAL)
    }
}

/// A poll that reached its deadline.
#[derive(Debug, Clone)]
pub struct PollTimeout<W> {
    /// Probes made
    pub attempts: u32,

    /// Time spent polling
    pub elapsed: Duration,

    /// The last observation
    pub last: W,
}

/// Probe until it returns `Ok`, sleeping `policy.interval` between attempts.
///
/// The probe is always invoked at least once, even with a zero deadline.
/// There is no cancellation primitive: drop the future to abandon the poll.
pub async fn poll_until<T, W, F, Fut>(policy: PollPolicy, mut probe: F) -> Result<T, PollTimeout<W>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, W>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let last = match probe().await {
            Ok(done) => return Ok(done),
            Err(last) => last,
        };

        let elapsed = started.elapsed();
        let wait = match policy.deadline {
            Some(deadline) if elapsed >= deadline => {
                return Err(PollTimeout {
                    attempts,
                    elapsed,
                    last,
                });
            }
            Some(deadline) => policy.interval.min(deadline - elapsed),
            None => policy.interval,
        };

        tokio::time::sleep(wait).await;
    }
}
