//! # conductor-core
//!
//! Expert-routing orchestration over heterogeneous inference backends.
//!
//! A query goes to a router model, which answers with an expert id; the
//! query is then forwarded to that expert, which produces the answer. Each
//! model runs behind a backend adapter that owns the lifecycle of its
//! serving resource.
//!
//! ## Key Guarantees
//!
//! 1. **Uniform lifecycle**: every adapter goes provision -> activate ->
//!    ready -> answer -> decommission, in that order
//! 2. **Idempotent stages**: re-running a stage reuses what already exists
//! 3. **Answers never fail**: transport errors become a fixed apology
//! 4. **No shared state**: each adapter owns its own clients and config
//!
//! ## Example
//!
//! ```rust,ignore
//! use conductor_core::{AnswerMode, BackendRegistry, Orchestrator, OrchestratorConfig, PollPolicy};
//!
//! let config = OrchestratorConfig::from_path("experts.yaml")?;
//! let mut orchestrator = Orchestrator::from_config(&config, &BackendRegistry::with_defaults())?;
//!
//! orchestrator.provision_all().await?;
//! orchestrator.activate_all(Duration::from_secs(120)).await?;
//! orchestrator.wait_until_ready(PollPolicy::default()).await?;
//!
//! let answer = orchestrator.answer("hello", AnswerMode::Buffered).await?;
//! println!("{}", answer.into_text().await);
//!
//! orchestrator.decommission_all().await?;
//! ```

pub mod backend;
pub mod config;
pub mod fixed;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;

// Re-export main types at crate root
pub use backend::{
    Answer, AnswerMode, AnswerStream, Backend, BackendError, BackendState, EventLog,
    InstanceName, LifecycleEvent, Readiness, Role, StageOutcome, APOLOGY,
};
pub use config::{BackendConfig, ConfigError, ExpertId, OrchestratorConfig};
pub use fixed::{FixedExpert, FixedExpertFactory, FixedRouter, FixedRouterFactory, SAMPLE_RESPONSE};
pub use lifecycle::{
    poll_until, LifecycleError, ManagedBackend, PollPolicy, PollTimeout, Stage,
    DEFAULT_POLL_INTERVAL,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorError, ServerStatus};
pub use registry::{BackendFactory, BackendRegistry};
