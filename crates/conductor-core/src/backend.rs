//! The backend adapter contract.
//!
//! Every deployment target (self-hosted VM, managed endpoint, hosted API,
//! fixed-response double) implements [`Backend`]. The orchestrator drives all
//! of them through the same stages in the same order; a stage that has no
//! meaning for a backend is a logged no-op, never skipped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::{BackendConfig, ConfigError};

/// Text returned in place of an answer when the backend call fails.
pub const APOLOGY: &str =
    "Sorry, I couldn't process your request. Too many requests for me to handle!";

/// Errors from backend adapters.
///
/// Transport failures during `answer` never surface here; they become
/// [`APOLOGY`].
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend call failed: {0}")]
    Transport(String),

    #[error("Resource error: {0}")]
    Resource(String),
}

/// The part an adapter plays in the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Selects an expert for each query
    Orchestrator,

    /// Answers routed queries
    Expert,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Orchestrator => f.write_str("orchestrator"),
            Role::Expert => f.write_str("expert"),
        }
    }
}

/// Deterministic name of an adapter's backing resource.
///
/// Derived as `"{role}-{model_id}"`; resource reuse keys off it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceName(String);

impl InstanceName {
    /// Derive the name for a role and model.
    pub fn derive(role: Role, model_id: &str) -> Self {
        Self(format!("{role}-{model_id}"))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a readiness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    /// Whether the backend accepts queries
    pub ready: bool,

    /// Free-text status, e.g. "running", "loading", "connection error"
    pub status: String,
}

impl Readiness {
    /// A ready status.
    pub fn ready(status: impl Into<String>) -> Self {
        Self {
            ready: true,
            status: status.into(),
        }
    }

    /// A not-ready status.
    pub fn not_ready(status: impl Into<String>) -> Self {
        Self {
            ready: false,
            status: status.into(),
        }
    }

    /// The canonical ready status.
    pub fn running() -> Self {
        Self::ready("running")
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, '{}')", self.ready, self.status)
    }
}

/// How an answer should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerMode {
    /// One complete string
    #[default]
    Buffered,

    /// A lazy sequence of text deltas
    Streaming,
}

/// Lazy, single-pass sequence of answer fragments.
///
/// Fragments are deltas: each one is new text, and concatenating all of them
/// yields the full answer.
pub type AnswerStream = BoxStream<'static, String>;

/// An answer in either delivery mode.
pub enum Answer {
    /// The complete answer text
    Complete(String),

    /// Incremental fragments
    Stream(AnswerStream),
}

impl Answer {
    /// Wrap a known text in the requested mode.
    ///
    /// In streaming mode the text is yielded as a single fragment.
    pub fn from_text(mode: AnswerMode, text: impl Into<String>) -> Self {
        let text = text.into();
        match mode {
            AnswerMode::Buffered => Answer::Complete(text),
            AnswerMode::Streaming => Answer::Stream(stream::once(async move { text }).boxed()),
        }
    }

    /// The fixed apology in the requested mode.
    pub fn apology(mode: AnswerMode) -> Self {
        Self::from_text(mode, APOLOGY)
    }

    /// Whether this is a streamed answer.
    pub fn is_stream(&self) -> bool {
        matches!(self, Answer::Stream(_))
    }

    /// Drain the answer into one string.
    pub async fn into_text(self) -> String {
        match self {
            Answer::Complete(text) => text,
            Answer::Stream(fragments) => fragments.collect::<Vec<_>>().await.concat(),
        }
    }
}

impl fmt::Debug for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            Answer::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Outcome of a provision or activation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage finished
    Completed,

    /// The resource is not there yet; re-invoke the step later
    Pending { reason: String },
}

impl StageOutcome {
    /// A pending outcome with a reason.
    pub fn pending(reason: impl Into<String>) -> Self {
        StageOutcome::Pending {
            reason: reason.into(),
        }
    }

    /// Whether the stage finished.
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed)
    }
}

/// An informational lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    /// When the event was recorded
    pub at: DateTime<Utc>,

    /// What happened
    pub message: String,
}

/// Append-only log of lifecycle events. Never used for control decisions.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<LifecycleEvent>,
}

impl EventLog {
    /// All events, oldest first.
    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    /// Event messages, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(|e| e.message.as_str())
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no event was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn push(&mut self, message: String) {
        self.events.push(LifecycleEvent {
            at: Utc::now(),
            message,
        });
    }
}

/// Fields every adapter carries: its config, its instance name and its log.
#[derive(Debug, Clone)]
pub struct BackendState {
    /// The adapter's own config, including recorded runtime state
    pub config: BackendConfig,

    /// Derived resource name
    pub instance_name: InstanceName,

    events: EventLog,
}

impl BackendState {
    /// Create the shared state for an adapter.
    pub fn new(config: BackendConfig, instance_name: InstanceName) -> Self {
        Self {
            config,
            instance_name,
            events: EventLog::default(),
        }
    }

    /// The configured model id.
    pub fn model_id(&self) -> Result<&str, ConfigError> {
        self.config.model_id()
    }

    /// Append an event and emit it as a log line.
    pub fn record(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(instance = %self.instance_name, "{}", message);
        self.events.push(message);
    }

    /// The event log.
    pub fn events(&self) -> &EventLog {
        &self.events
    }
}

/// The lifecycle contract every backend kind honors.
///
/// # Stage order
/// `provision` -> `activate` -> `check_ready` (polled) -> `answer` ->
/// `decommission`. Each stage must tolerate re-entry.
///
/// # Error policy
/// - `provision`/`activate`: resource-state problems return
///   [`StageOutcome::Pending`]; only misconfiguration is an `Err`.
/// - `check_ready`: ordinary unreadiness is `Ok(Readiness { ready: false, .. })`.
/// - `answer`: never fails; transport errors yield [`APOLOGY`].
/// - `decommission`: failures propagate.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The backend kind selector this adapter implements.
    fn kind(&self) -> &'static str;

    /// Shared adapter state.
    fn state(&self) -> &BackendState;

    /// Derived instance name.
    fn instance_name(&self) -> &InstanceName {
        &self.state().instance_name
    }

    /// The adapter's config, including recorded runtime state.
    fn config(&self) -> &BackendConfig {
        &self.state().config
    }

    /// Lifecycle event log.
    fn events(&self) -> &EventLog {
        self.state().events()
    }

    /// Acquire or reuse the serving resource.
    async fn provision(&mut self) -> Result<StageOutcome, BackendError>;

    /// Bring the serving process up, waiting at most `max_wait`.
    async fn activate(&mut self, max_wait: Duration) -> Result<StageOutcome, BackendError>;

    /// Side-effect-free readiness probe.
    async fn check_ready(&self) -> Result<Readiness, BackendError>;

    /// Answer one query.
    async fn answer(&self, query: &str, mode: AnswerMode) -> Answer;

    /// Release the serving resource.
    async fn decommission(&mut self) -> Result<(), BackendError>;
}
