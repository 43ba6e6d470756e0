//! Expert-routing orchestrator.
//!
//! Owns one router adapter and a mapping of expert ids to expert adapters,
//! drives them through their lifecycle stages, and answers queries by
//! asking the router for an expert id and forwarding the query to it.
//!
//! # Execution Flow
//! 1. `from_config`: validate, build every adapter through the registry
//! 2. `provision_all`: router first, then experts in config order; a
//!    pending adapter is retried by `provision_until_complete`
//! 3. `activate_all`: same order, each bounded by `max_wait`; pending
//!    activations are retried by `activate_until_complete`
//! 4. `wait_until_ready`: poll every adapter until all report ready
//! 5. `answer`: route, then dispatch
//! 6. `decommission_all`: release everything

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::backend::{Answer, AnswerMode, Backend, Readiness, Role, StageOutcome};
use crate::config::{ConfigError, ExpertId, OrchestratorConfig};
use crate::lifecycle::{poll_until, LifecycleError, ManagedBackend, PollPolicy};
use crate::registry::BackendRegistry;

/// Errors from the orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Router chose unknown expert '{0}'")]
    UnknownExpert(ExpertId),

    #[error("Not all servers ready after {elapsed:?}; still waiting on {pending:?}")]
    ReadinessTimeout {
        elapsed: Duration,
        pending: Vec<String>,
    },

    #[error("{step} still pending after {elapsed:?} for {pending:?}")]
    StepTimeout {
        step: &'static str,
        elapsed: Duration,
        pending: Vec<String>,
    },

    #[error("Orchestrator has no router")]
    MissingRouter,
}

/// Readiness of one adapter, as reported by [`Orchestrator::statuses`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    /// Instance name of the adapter
    pub instance: String,

    /// Expert id, `None` for the router
    pub expert_id: Option<ExpertId>,

    /// Probe result
    pub readiness: Readiness,
}

/// Routes queries to experts and manages their servers.
#[derive(Debug)]
pub struct Orchestrator {
    router: ManagedBackend,
    experts: BTreeMap<ExpertId, ManagedBackend>,
    order: Vec<ExpertId>,
}

impl Orchestrator {
    /// Build an orchestrator from a validated config.
    ///
    /// Fails on an unknown backend kind, a missing required field, or two
    /// adapters that would claim the same external resource.
    pub fn from_config(
        config: &OrchestratorConfig,
        registry: &BackendRegistry,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let mut router_config = config.orchestrator.clone();
        if !router_config.contains("num_experts") {
            router_config.set("num_experts", config.experts.len() as u64);
        }

        let mut claimed = BTreeSet::new();
        let mut claim = |key: Option<String>| -> Result<(), ConfigError> {
            match key {
                Some(key) if !claimed.insert(key.clone()) => Err(ConfigError::DuplicateResource(key)),
                _ => Ok(()),
            }
        };

        claim(registry.resource_key(&router_config, Role::Orchestrator)?)?;
        for expert in &config.experts {
            claim(registry.resource_key(expert, Role::Expert)?)?;
        }

        let mut builder = OrchestratorBuilder::new()
            .router(registry.build(router_config, Role::Orchestrator)?);
        for expert in &config.experts {
            let id = expert.expert_id()?;
            builder = builder.expert(id, registry.build(expert.clone(), Role::Expert)?);
        }

        builder.build()
    }

    /// Start building an orchestrator from ready-made adapters.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// The router.
    pub fn router(&self) -> &ManagedBackend {
        &self.router
    }

    /// An expert by id.
    pub fn expert(&self, id: &ExpertId) -> Option<&ManagedBackend> {
        self.experts.get(id)
    }

    /// Expert ids in config order.
    pub fn expert_ids(&self) -> &[ExpertId] {
        &self.order
    }

    /// Number of experts.
    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Provision the router.
    pub async fn provision_router(&mut self) -> Result<StageOutcome, OrchestratorError> {
        Ok(self.router.provision().await?)
    }

    /// Provision every expert in config order.
    ///
    /// Returns the number of experts whose provisioning is still pending.
    pub async fn provision_experts(&mut self) -> Result<usize, OrchestratorError> {
        let mut pending = 0;
        for id in &self.order {
            if let Some(expert) = self.experts.get_mut(id) {
                if !expert.provision().await?.is_completed() {
                    pending += 1;
                }
            }
        }
        Ok(pending)
    }

    /// Provision the router, then every expert.
    ///
    /// Returns the number of adapters whose provisioning is still pending.
    pub async fn provision_all(&mut self) -> Result<usize, OrchestratorError> {
        let router_pending = !self.provision_router().await?.is_completed();
        let experts_pending = self.provision_experts().await?;
        Ok(experts_pending + usize::from(router_pending))
    }

    /// Activate the router, then every expert, each bounded by `max_wait`.
    ///
    /// Adapters whose provisioning has not completed are skipped and counted
    /// as pending. Returns the number of adapters still pending.
    pub async fn activate_all(&mut self, max_wait: Duration) -> Result<usize, OrchestratorError> {
        let mut pending = usize::from(!activate_provisioned(&mut self.router, max_wait).await?);
        for id in &self.order {
            if let Some(expert) = self.experts.get_mut(id) {
                if !activate_provisioned(expert, max_wait).await? {
                    pending += 1;
                }
            }
        }
        Ok(pending)
    }

    /// Provision until no adapter is pending, retrying only the pending ones
    /// every `policy.interval`.
    pub async fn provision_until_complete(&mut self, policy: PollPolicy) -> Result<(), OrchestratorError> {
        self.retry_pending(Step::Provision, policy).await
    }

    /// Activate until no adapter is pending, retrying only the pending ones
    /// every `policy.interval`. Each attempt is bounded by `max_wait`.
    pub async fn activate_until_complete(
        &mut self,
        max_wait: Duration,
        policy: PollPolicy,
    ) -> Result<(), OrchestratorError> {
        self.retry_pending(Step::Activate(max_wait), policy).await
    }

    async fn retry_pending(&mut self, step: Step, policy: PollPolicy) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        loop {
            let pending = self.advance_pending(step).await?;
            if pending.is_empty() {
                return Ok(());
            }

            let elapsed = started.elapsed();
            let wait = match policy.deadline {
                Some(deadline) if elapsed >= deadline => {
                    return Err(OrchestratorError::StepTimeout {
                        step: step.name(),
                        elapsed,
                        pending,
                    });
                }
                Some(deadline) => policy.interval.min(deadline - elapsed),
                None => policy.interval,
            };

            tracing::info!(step = step.name(), ?pending, ?wait, "Retrying pending adapters");
            tokio::time::sleep(wait).await;
        }
    }

    /// Run `step` on every adapter that has not completed it, router first,
    /// and return the instance names still pending.
    async fn advance_pending(&mut self, step: Step) -> Result<Vec<String>, OrchestratorError> {
        let mut pending = Vec::new();
        if !advance(&mut self.router, step).await? {
            pending.push(self.router.instance_name().to_string());
        }
        for id in &self.order {
            if let Some(expert) = self.experts.get_mut(id) {
                if !advance(expert, step).await? {
                    pending.push(expert.instance_name().to_string());
                }
            }
        }
        Ok(pending)
    }

    /// Decommission the router, then every expert.
    ///
    /// Every adapter is attempted; the first failure is returned.
    pub async fn decommission_all(&mut self) -> Result<(), OrchestratorError> {
        let mut first_error = None;
        if let Err(e) = self.router.decommission().await {
            tracing::error!(instance = %self.router.instance_name(), error = %e, "Router decommission failed");
            first_error = Some(e);
        }
        for id in &self.order {
            if let Some(expert) = self.experts.get_mut(id) {
                if let Err(e) = expert.decommission().await {
                    tracing::error!(expert_id = %id, error = %e, "Decommission failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    /// Probe every adapter, router first.
    ///
    /// No probe is skipped because an earlier one failed or was not ready.
    pub async fn statuses(&self) -> Result<Vec<ServerStatus>, OrchestratorError> {
        let mut statuses = Vec::with_capacity(self.experts.len() + 1);
        let mut first_error = None;

        let probes = std::iter::once((None, &self.router)).chain(
            self.order
                .iter()
                .filter_map(|id| self.experts.get(id).map(|e| (Some(id), e))),
        );

        for (expert_id, managed) in probes {
            let readiness = match managed.check_ready().await {
                Ok(readiness) => readiness,
                Err(e) => {
                    tracing::warn!(instance = %managed.instance_name(), error = %e, "Readiness probe failed");
                    let readiness = Readiness::not_ready(e.to_string());
                    first_error.get_or_insert(e);
                    readiness
                }
            };

            tracing::info!(
                instance = %managed.instance_name(),
                ready = readiness.ready,
                status = %readiness.status,
                "Server state"
            );

            statuses.push(ServerStatus {
                instance: managed.instance_name().to_string(),
                expert_id: expert_id.cloned(),
                readiness,
            });
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(statuses),
        }
    }

    /// Whether the router and every expert are ready.
    pub async fn check_ready(&self) -> Result<bool, OrchestratorError> {
        let statuses = self.statuses().await?;
        Ok(statuses.iter().all(|s| s.readiness.ready))
    }

    /// Poll until every adapter is ready, then mark them serving.
    ///
    /// Probe errors count as "not ready" and polling continues. With a
    /// deadline in `policy`, gives up with [`OrchestratorError::ReadinessTimeout`].
    pub async fn wait_until_ready(&mut self, policy: PollPolicy) -> Result<(), OrchestratorError> {
        let this = &*self;
        let result = poll_until(policy, || async move {
            match this.statuses().await {
                Ok(statuses) if statuses.iter().all(|s| s.readiness.ready) => Ok(()),
                Ok(statuses) => Err(statuses
                    .into_iter()
                    .filter(|s| !s.readiness.ready)
                    .map(|s| s.instance)
                    .collect::<Vec<_>>()),
                Err(e) => {
                    tracing::warn!(error = %e, "Readiness check failed, will retry");
                    Err(vec![e.to_string()])
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                self.router.mark_serving();
                for expert in self.experts.values_mut() {
                    expert.mark_serving();
                }
                tracing::info!("All servers ready");
                Ok(())
            }
            Err(timeout) => Err(OrchestratorError::ReadinessTimeout {
                elapsed: timeout.elapsed,
                pending: timeout.last,
            }),
        }
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Ask the router which expert should take `query`.
    ///
    /// The router is always consulted in buffered mode.
    pub async fn route(&self, query: &str) -> ExpertId {
        let raw = self
            .router
            .answer(query, AnswerMode::Buffered)
            .await
            .into_text()
            .await;
        let id = ExpertId::parse(&raw);
        tracing::info!(expert_id = %id, "Router selected expert");
        id
    }

    /// Forward `query` to a specific expert.
    pub async fn dispatch(
        &self,
        query: &str,
        id: &ExpertId,
        mode: AnswerMode,
    ) -> Result<Answer, OrchestratorError> {
        let expert = self
            .experts
            .get(id)
            .ok_or_else(|| OrchestratorError::UnknownExpert(id.clone()))?;
        Ok(expert.answer(query, mode).await)
    }

    /// Route `query` and return the chosen expert's answer.
    pub async fn answer(&self, query: &str, mode: AnswerMode) -> Result<Answer, OrchestratorError> {
        let id = self.route(query).await;
        self.dispatch(query, &id, mode).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Provision,
    Activate(Duration),
}

impl Step {
    fn name(self) -> &'static str {
        match self {
            Step::Provision => "provision",
            Step::Activate(_) => "activate",
        }
    }
}

/// Run `step` on `backend` if it has not completed it yet.
async fn advance(backend: &mut ManagedBackend, step: Step) -> Result<bool, OrchestratorError> {
    match step {
        Step::Provision if backend.needs_provision() => Ok(backend.provision().await?.is_completed()),
        Step::Activate(max_wait) if backend.needs_activation() => {
            activate_provisioned(backend, max_wait).await
        }
        _ => Ok(true),
    }
}

/// Activate `backend` unless it still waits on provisioning.
///
/// Returns whether activation completed.
async fn activate_provisioned(
    backend: &mut ManagedBackend,
    max_wait: Duration,
) -> Result<bool, OrchestratorError> {
    if backend.needs_provision() {
        tracing::warn!(instance = %backend.instance_name(), stage = %backend.stage(), "Not provisioned yet, skipping activation");
        return Ok(false);
    }
    Ok(backend.activate(max_wait).await?.is_completed())
}

/// Builder for assembling an [`Orchestrator`] from adapters directly.
#[derive(Default)]
pub struct OrchestratorBuilder {
    router: Option<Box<dyn Backend>>,
    experts: Vec<(ExpertId, Box<dyn Backend>)>,
}

impl OrchestratorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the router.
    pub fn router(mut self, backend: Box<dyn Backend>) -> Self {
        self.router = Some(backend);
        self
    }

    /// Add an expert.
    pub fn expert(mut self, id: impl Into<ExpertId>, backend: Box<dyn Backend>) -> Self {
        self.experts.push((id.into(), backend));
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let router = self.router.ok_or(OrchestratorError::MissingRouter)?;

        let mut experts = BTreeMap::new();
        let mut order = Vec::with_capacity(self.experts.len());
        for (id, backend) in self.experts {
            if experts.contains_key(&id) {
                return Err(ConfigError::DuplicateExpertId(id).into());
            }
            order.push(id.clone());
            experts.insert(id, ManagedBackend::new(backend));
        }

        Ok(Orchestrator {
            router: ManagedBackend::new(router),
            experts,
            order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::lifecycle::Stage;

    fn registry() -> BackendRegistry {
        BackendRegistry::with_defaults()
    }

    fn config(num_experts: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            orchestrator: BackendConfig::new()
                .with("model_id", "r")
                .with("backend", "dummy_orchestrator"),
            experts: (0..num_experts)
                .map(|i| {
                    BackendConfig::new()
                        .with("expert_id", i as u64)
                        .with("model_id", format!("e{i}"))
                        .with("backend", "dummy_expert")
                })
                .collect(),
        }
    }

    #[test]
    fn test_router_learns_expert_count() {
        let orchestrator = Orchestrator::from_config(&config(2), &registry()).unwrap();
        assert_eq!(orchestrator.num_experts(), 2);
        assert_eq!(
            orchestrator.router().backend().config().u64_or("num_experts", 0).unwrap(),
            2
        );
    }

    #[test]
    fn test_builder_requires_router() {
        let result = OrchestratorBuilder::new().build();
        assert!(matches!(result, Err(OrchestratorError::MissingRouter)));
    }

    #[tokio::test]
    async fn test_stages_advance_together() {
        let mut orchestrator = Orchestrator::from_config(&config(3), &registry()).unwrap();

        assert_eq!(orchestrator.provision_all().await.unwrap(), 0);
        assert_eq!(orchestrator.activate_all(Duration::from_secs(1)).await.unwrap(), 0);
        assert_eq!(orchestrator.router().stage(), Stage::Activated);

        orchestrator.wait_until_ready(PollPolicy::default()).await.unwrap();
        for id in orchestrator.expert_ids() {
            assert_eq!(orchestrator.expert(id).unwrap().stage(), Stage::Serving);
        }

        orchestrator.decommission_all().await.unwrap();
        assert_eq!(orchestrator.router().stage(), Stage::Decommissioned);
        assert!(!orchestrator.check_ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_activate_before_provision_counts_pending() {
        let mut orchestrator = Orchestrator::from_config(&config(1), &registry()).unwrap();
        assert_eq!(orchestrator.activate_all(Duration::ZERO).await.unwrap(), 2);
        assert_eq!(orchestrator.router().stage(), Stage::Built);
    }
}
