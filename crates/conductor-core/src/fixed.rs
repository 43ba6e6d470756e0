//! Fixed-response backends for offline runs and tests.
//!
//! `dummy_orchestrator` picks an expert uniformly at random;
//! `dummy_expert` always answers [`SAMPLE_RESPONSE`]. Neither touches any
//! external resource, but both still walk every lifecycle stage.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::backend::{
    Answer, AnswerMode, Backend, BackendError, BackendState, InstanceName, Readiness,
    StageOutcome,
};
use crate::config::{BackendConfig, ConfigError};
use crate::registry::BackendFactory;

/// The fixed expert's answer.
pub const SAMPLE_RESPONSE: &str = "Hello! This is sample response!";

/// Router count used when the config does not say how many experts exist.
pub const DEFAULT_NUM_EXPERTS: u64 = 3;

fn read_ready(config: &BackendConfig) -> Result<bool, ConfigError> {
    config.bool_or("ready", true)
}

fn fixed_readiness(ready: bool) -> Readiness {
    if ready {
        Readiness::running()
    } else {
        Readiness::not_ready("not ready")
    }
}

/// Router that answers a uniformly random id in `0..num_experts`.
#[derive(Debug)]
pub struct FixedRouter {
    state: BackendState,
    num_experts: u64,
    ready: bool,
}

impl FixedRouter {
    /// Create a router from its config.
    pub fn new(config: BackendConfig, instance_name: InstanceName) -> Result<Self, ConfigError> {
        let num_experts = config.u64_or("num_experts", DEFAULT_NUM_EXPERTS)?;
        if num_experts == 0 {
            return Err(ConfigError::InvalidField {
                field: "num_experts".to_string(),
                expected: "a positive integer",
            });
        }
        let ready = read_ready(&config)?;

        Ok(Self {
            state: BackendState::new(config, instance_name),
            num_experts,
            ready,
        })
    }

    /// Number of experts this router chooses between.
    pub fn num_experts(&self) -> u64 {
        self.num_experts
    }

    fn pick(&self) -> u64 {
        rand::thread_rng().gen_range(0..self.num_experts)
    }
}

#[async_trait]
impl Backend for FixedRouter {
    fn kind(&self) -> &'static str {
        "dummy_orchestrator"
    }

    fn state(&self) -> &BackendState {
        &self.state
    }

    async fn provision(&mut self) -> Result<StageOutcome, BackendError> {
        self.state.record("no server to launch");
        Ok(StageOutcome::Completed)
    }

    async fn activate(&mut self, _max_wait: Duration) -> Result<StageOutcome, BackendError> {
        self.state.record("no inference endpoint to start");
        Ok(StageOutcome::Completed)
    }

    async fn check_ready(&self) -> Result<Readiness, BackendError> {
        Ok(fixed_readiness(self.ready))
    }

    async fn answer(&self, _query: &str, mode: AnswerMode) -> Answer {
        Answer::from_text(mode, self.pick().to_string())
    }

    async fn decommission(&mut self) -> Result<(), BackendError> {
        self.state.record("server stopped");
        Ok(())
    }
}

/// Expert that always answers [`SAMPLE_RESPONSE`].
#[derive(Debug)]
pub struct FixedExpert {
    state: BackendState,
    ready: bool,
}

impl FixedExpert {
    /// Create an expert from its config.
    pub fn new(config: BackendConfig, instance_name: InstanceName) -> Result<Self, ConfigError> {
        let ready = read_ready(&config)?;
        Ok(Self {
            state: BackendState::new(config, instance_name),
            ready,
        })
    }
}

#[async_trait]
impl Backend for FixedExpert {
    fn kind(&self) -> &'static str {
        "dummy_expert"
    }

    fn state(&self) -> &BackendState {
        &self.state
    }

    async fn provision(&mut self) -> Result<StageOutcome, BackendError> {
        self.state.record("no server to launch");
        Ok(StageOutcome::Completed)
    }

    async fn activate(&mut self, _max_wait: Duration) -> Result<StageOutcome, BackendError> {
        self.state.record("no inference endpoint to start");
        Ok(StageOutcome::Completed)
    }

    async fn check_ready(&self) -> Result<Readiness, BackendError> {
        Ok(fixed_readiness(self.ready))
    }

    async fn answer(&self, _query: &str, mode: AnswerMode) -> Answer {
        Answer::from_text(mode, SAMPLE_RESPONSE)
    }

    async fn decommission(&mut self) -> Result<(), BackendError> {
        self.state.record("server stopped");
        Ok(())
    }
}

/// Factory for [`FixedRouter`].
#[derive(Debug, Default)]
pub struct FixedRouterFactory;

impl BackendFactory for FixedRouterFactory {
    fn backend_kind(&self) -> &'static str {
        "dummy_orchestrator"
    }

    fn create(
        &self,
        config: BackendConfig,
        instance_name: InstanceName,
    ) -> Result<Box<dyn Backend>, ConfigError> {
        Ok(Box::new(FixedRouter::new(config, instance_name)?))
    }

    fn description(&self) -> &'static str {
        "Random router over the configured experts"
    }
}

/// Factory for [`FixedExpert`].
#[derive(Debug, Default)]
pub struct FixedExpertFactory;

impl BackendFactory for FixedExpertFactory {
    fn backend_kind(&self) -> &'static str {
        "dummy_expert"
    }

    fn create(
        &self,
        config: BackendConfig,
        instance_name: InstanceName,
    ) -> Result<Box<dyn Backend>, ConfigError> {
        Ok(Box::new(FixedExpert::new(config, instance_name)?))
    }

    fn description(&self) -> &'static str {
        "Constant sample answer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Role;
    use proptest::prelude::*;

    fn router(num_experts: u64) -> FixedRouter {
        let config = BackendConfig::new()
            .with("model_id", "r")
            .with("num_experts", num_experts);
        FixedRouter::new(config, InstanceName::derive(Role::Orchestrator, "r")).unwrap()
    }

    #[tokio::test]
    async fn test_expert_answers_constant() {
        let config = BackendConfig::new().with("model_id", "e");
        let expert = FixedExpert::new(config, InstanceName::derive(Role::Expert, "e")).unwrap();

        let buffered = expert.answer("anything", AnswerMode::Buffered).await;
        assert_eq!(buffered.into_text().await, SAMPLE_RESPONSE);

        let streamed = expert.answer("anything", AnswerMode::Streaming).await;
        assert!(streamed.is_stream());
        assert_eq!(streamed.into_text().await, SAMPLE_RESPONSE);
    }

    #[tokio::test]
    async fn test_router_choices_roughly_uniform() {
        let router = router(3);
        let mut counts = [0u32; 3];
        for _ in 0..3000 {
            let text = router.answer("q", AnswerMode::Buffered).await.into_text().await;
            let idx: usize = text.parse().unwrap();
            counts[idx] += 1;
        }
        for count in counts {
            assert!((700..=1300).contains(&count), "skewed counts: {counts:?}");
        }
    }

    #[tokio::test]
    async fn test_lifecycle_is_logged() {
        let config = BackendConfig::new().with("model_id", "e");
        let mut expert = FixedExpert::new(config, InstanceName::derive(Role::Expert, "e")).unwrap();

        assert!(expert.provision().await.unwrap().is_completed());
        assert!(expert.activate(Duration::ZERO).await.unwrap().is_completed());
        expert.decommission().await.unwrap();

        let messages: Vec<_> = expert.events().messages().collect();
        assert_eq!(
            messages,
            vec!["no server to launch", "no inference endpoint to start", "server stopped"]
        );
    }

    #[tokio::test]
    async fn test_not_ready_flag() {
        let config = BackendConfig::new().with("model_id", "e").with("ready", false);
        let expert = FixedExpert::new(config, InstanceName::derive(Role::Expert, "e")).unwrap();
        let readiness = expert.check_ready().await.unwrap();
        assert!(!readiness.ready);
    }

    #[test]
    fn test_zero_experts_rejected() {
        let config = BackendConfig::new().with("model_id", "r").with("num_experts", 0);
        let result = FixedRouter::new(config, InstanceName::derive(Role::Orchestrator, "r"));
        assert!(matches!(result, Err(ConfigError::InvalidField { .. })));
    }

    proptest! {
        #[test]
        fn router_pick_stays_in_range(n in 1u64..64) {
            let router = router(n);
            for _ in 0..32 {
                prop_assert!(router.pick() < n);
            }
        }
    }
}
