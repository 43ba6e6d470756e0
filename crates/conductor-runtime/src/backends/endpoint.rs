//! TGI on a managed inference endpoint.
//!
//! There is no machine to start: activation reuses a live endpoint whose
//! name carries the model's base name, or starts a new timestamped
//! deployment and returns without waiting for it. Readiness is a small
//! streamed invocation. Decommissioning deletes the endpoint, then its
//! configuration, then its model.
//!
//! ## Config fields
//!
//! | Field              | Default                      |
//! |--------------------|------------------------------|
//! | `instance_type`    | required to deploy           |
//! | `region`           | `us-east-1`                  |
//! | `hf_token`         | `$HUGGING_FACE_HUB_TOKEN`    |
//! | `number_of_gpu`, `max_input_length`, `max_total_length`, `max_batch_total_tokens` | see [`TgiLimits`] |
//! | generation parameters | see [`InferenceParams`]   |

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::{
    Answer, AnswerMode, Backend, BackendConfig, BackendError, BackendFactory, BackendState,
    ConfigError, InstanceName, Readiness, StageOutcome,
};

use super::guard_deltas;
use crate::clients::{ApiCredential, EndpointPlane, EndpointStatus, ModelDeployment};
use crate::codec::tgi_deltas;
use crate::deploy::{
    endpoint_base_name, tgi_image_uri, timestamped_name, InferenceParams, TgiLimits,
    DEFAULT_REGION,
};

/// Backend kind selector.
pub const ENDPOINT_BACKEND: &str = "sagemaker_backend";

/// Query used by the readiness probe.
pub const PROBE_QUERY: &str = "hello!";

/// A TGI model behind a managed endpoint.
pub struct EndpointBackend {
    state: BackendState,
    plane: Arc<dyn EndpointPlane>,
    params: InferenceParams,
    base_name: String,
    endpoint_name: Option<String>,
    hub_token: Option<ApiCredential>,
}

impl std::fmt::Debug for EndpointBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointBackend")
            .field("instance", &self.state.instance_name)
            .field("base_name", &self.base_name)
            .field("endpoint_name", &self.endpoint_name)
            .field("hub_token", &self.hub_token)
            .finish()
    }
}

impl EndpointBackend {
    /// Create an adapter over an endpoint control plane.
    ///
    /// The hub token is read from `hf_token` or `HUGGING_FACE_HUB_TOKEN` and
    /// removed from the recorded config.
    pub fn new(
        mut config: BackendConfig,
        instance_name: InstanceName,
        plane: Arc<dyn EndpointPlane>,
    ) -> Result<Self, ConfigError> {
        let base_name = endpoint_base_name(config.model_id()?)?;
        let params = InferenceParams::from_config(&config)?;
        let endpoint_name = config.str("endpoint_name").map(str::to_string);
        let hub_token = ApiCredential::lookup(
            &config,
            "hf_token",
            "HUGGING_FACE_HUB_TOKEN",
            "Hugging Face hub token",
        );
        config.remove("hf_token");

        Ok(Self {
            state: BackendState::new(config, instance_name),
            plane,
            params,
            base_name,
            endpoint_name,
            hub_token,
        })
    }

    /// Name shared by every deployment of this model.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// The endpoint currently in use, if any.
    pub fn endpoint_name(&self) -> Option<&str> {
        self.endpoint_name.as_deref()
    }

    fn use_endpoint(&mut self, name: String) {
        self.state.config.set("endpoint_name", name.as_str());
        self.endpoint_name = Some(name);
    }

    async fn find_endpoint(&self, live_only: bool) -> Result<Option<String>, BackendError> {
        let endpoints = self.plane.list_endpoints(&self.base_name).await?;
        Ok(endpoints
            .into_iter()
            .filter(|e| e.name.contains(&self.base_name))
            .find(|e| {
                if live_only {
                    e.status.is_live()
                } else {
                    e.status != EndpointStatus::Deleting
                }
            })
            .map(|e| e.name))
    }

    fn deployment(&self, max_wait: Duration) -> Result<ModelDeployment, ConfigError> {
        let config = &self.state.config;
        let model_id = config.model_id()?;
        let limits = TgiLimits::from_config(config)?;

        Ok(ModelDeployment {
            endpoint_name: timestamped_name(&self.base_name, Utc::now()),
            image_uri: tgi_image_uri(config.str_or("region", DEFAULT_REGION)?)?,
            instance_type: config.require_str("instance_type")?.to_string(),
            initial_instance_count: 1,
            environment: limits.environment(model_id),
            startup_health_check_timeout: max_wait,
            hub_token: self.hub_token.clone(),
        })
    }
}

#[async_trait]
impl Backend for EndpointBackend {
    fn kind(&self) -> &'static str {
        ENDPOINT_BACKEND
    }

    fn state(&self) -> &BackendState {
        &self.state
    }

    async fn provision(&mut self) -> Result<StageOutcome, BackendError> {
        self.state.record("No server to launch for a managed endpoint");
        Ok(StageOutcome::Completed)
    }

    async fn activate(&mut self, max_wait: Duration) -> Result<StageOutcome, BackendError> {
        if let Some(existing) = self.find_endpoint(true).await? {
            self.state.record(format!("Reusing endpoint {existing}"));
            self.use_endpoint(existing);
            return Ok(StageOutcome::Completed);
        }

        let deployment = self.deployment(max_wait)?;
        if deployment.hub_token.is_none() {
            tracing::warn!(instance = %self.state.instance_name, "No hub token set, gated models will fail to load");
        }
        self.plane.deploy(&deployment).await?;

        self.state
            .record(format!("Deploying endpoint {}", deployment.endpoint_name));
        self.use_endpoint(deployment.endpoint_name);
        Ok(StageOutcome::Completed)
    }

    async fn check_ready(&self) -> Result<Readiness, BackendError> {
        let Some(name) = &self.endpoint_name else {
            return Ok(Readiness::not_ready("no endpoint"));
        };

        let payload = self.params.payload(PROBE_QUERY, true);
        Ok(match self.plane.invoke_stream(name, &payload).await {
            Ok(_) => Readiness::running(),
            Err(e) => {
                tracing::debug!(endpoint = %name, error = %e, "Readiness probe failed");
                Readiness::not_ready("")
            }
        })
    }

    async fn answer(&self, query: &str, mode: AnswerMode) -> Answer {
        let instance = &self.state.instance_name;
        let Some(name) = &self.endpoint_name else {
            tracing::warn!(instance = %instance, "Answer requested before activation");
            return Answer::apology(mode);
        };

        let payload = self.params.payload(query, true);
        let bytes = match self.plane.invoke_stream(name, &payload).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(instance = %instance, error = %e, "Invocation failed, apologizing");
                return Answer::apology(mode);
            }
        };

        let deltas = tgi_deltas(bytes);
        match mode {
            AnswerMode::Streaming => Answer::Stream(guard_deltas(instance.clone(), deltas)),
            AnswerMode::Buffered => {
                let collected: Result<Vec<String>, _> =
                    deltas.collect::<Vec<_>>().await.into_iter().collect();
                match collected {
                    Ok(parts) => Answer::Complete(parts.concat()),
                    Err(e) => {
                        tracing::warn!(instance = %instance, error = %e, "Invocation stream failed, apologizing");
                        Answer::apology(mode)
                    }
                }
            }
        }
    }

    async fn decommission(&mut self) -> Result<(), BackendError> {
        let name = match self.endpoint_name.clone() {
            Some(name) => name,
            None => match self.find_endpoint(false).await? {
                Some(name) => name,
                None => {
                    self.state.record("No endpoint to delete");
                    return Ok(());
                }
            },
        };

        let description = self.plane.describe_endpoint(&name).await?;
        let model = self.plane.config_model_name(&description.config_name).await?;

        self.plane.delete_endpoint(&name).await?;
        self.plane.delete_endpoint_config(&description.config_name).await?;
        self.plane.delete_model(&model).await?;

        self.endpoint_name = None;
        self.state.config.remove("endpoint_name");
        self.state.record(format!("Endpoint {name} deleted"));
        Ok(())
    }
}

/// Factory for [`EndpointBackend`].
#[derive(Clone)]
pub struct EndpointBackendFactory {
    plane: Arc<dyn EndpointPlane>,
}

impl EndpointBackendFactory {
    /// Create a factory whose adapters share `plane`.
    pub fn new(plane: Arc<dyn EndpointPlane>) -> Self {
        Self { plane }
    }
}

impl BackendFactory for EndpointBackendFactory {
    fn backend_kind(&self) -> &'static str {
        ENDPOINT_BACKEND
    }

    fn create(
        &self,
        config: BackendConfig,
        instance_name: InstanceName,
    ) -> Result<Box<dyn Backend>, ConfigError> {
        Ok(Box::new(EndpointBackend::new(config, instance_name, self.plane.clone())?))
    }

    fn validate_config(&self, config: &BackendConfig) -> Result<(), ConfigError> {
        endpoint_base_name(config.model_id()?)?;
        InferenceParams::from_config(config)?;
        TgiLimits::from_config(config)?;
        tgi_image_uri(config.str_or("region", DEFAULT_REGION)?).map(|_| ())
    }

    fn resource_key(&self, config: &BackendConfig, _instance_name: &InstanceName) -> Option<String> {
        let base = endpoint_base_name(config.model_id().ok()?).ok()?;
        Some(format!("endpoint:{base}"))
    }

    fn description(&self) -> &'static str {
        "TGI model on a managed inference endpoint"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientError;
    use crate::fakes::FakeEndpoints;
    use conductor_core::{Role, APOLOGY};

    const MODEL: &str = "mistralai/Mistral-7B-v0.1";

    fn config() -> BackendConfig {
        BackendConfig::new()
            .with("backend", ENDPOINT_BACKEND)
            .with("model_id", MODEL)
            .with("instance_type", "ml.g5.2xlarge")
            .with("region", "eu-west-1")
            .with("hf_token", "hf_secret")
    }

    fn backend(plane: &Arc<FakeEndpoints>, config: BackendConfig) -> EndpointBackend {
        let name = InstanceName::derive(Role::Expert, MODEL);
        EndpointBackend::new(config, name, plane.clone()).unwrap()
    }

    fn tgi_chunk(text: &str) -> Vec<u8> {
        format!("data:{{\"token\": {{\"text\": \"{text}\"}}}}\n").into_bytes()
    }

    #[tokio::test]
    async fn test_activate_deploys_when_nothing_is_live() {
        let plane = Arc::new(FakeEndpoints::default());
        plane.add_endpoint("Mistral-7B-tgi-streaming-2024-01-01-00-00-00-000", EndpointStatus::Failed);
        let mut backend = backend(&plane, config());

        assert!(backend.provision().await.unwrap().is_completed());
        assert!(backend.activate(Duration::from_secs(600)).await.unwrap().is_completed());

        let deployments = plane.deployments();
        assert_eq!(deployments.len(), 1);
        let deployed = &deployments[0];
        assert!(deployed.endpoint_name.starts_with("Mistral-7B-tgi-streaming-"));
        assert!(deployed.image_uri.starts_with("763104351884.dkr.ecr.eu-west-1"));
        assert_eq!(deployed.startup_health_check_timeout, Duration::from_secs(600));
        assert_eq!(deployed.environment["HF_MODEL_ID"], MODEL);
        assert_eq!(deployed.environment["HUGGING_FACE_HUB_TOKEN"], "hf_secret");
        assert_eq!(backend.endpoint_name(), Some(deployed.endpoint_name.as_str()));
        assert!(!backend.config().contains("hf_token"));
    }

    #[tokio::test]
    async fn test_activate_reuses_live_endpoint() {
        let plane = Arc::new(FakeEndpoints::default());
        let existing = "Mistral-7B-tgi-streaming-2024-01-01-00-00-00-000";
        plane.add_endpoint(existing, EndpointStatus::Creating);
        let mut backend = backend(&plane, config());

        backend.activate(Duration::from_secs(600)).await.unwrap();
        backend.activate(Duration::from_secs(600)).await.unwrap();

        assert!(plane.deployments().is_empty());
        assert_eq!(backend.endpoint_name(), Some(existing));
        assert_eq!(backend.config().str("endpoint_name"), Some(existing));
    }

    #[tokio::test]
    async fn test_readiness_follows_invocation() {
        let plane = Arc::new(FakeEndpoints::default());
        let mut backend = backend(&plane, config());
        assert_eq!(backend.check_ready().await.unwrap().status, "no endpoint");

        backend.activate(Duration::from_secs(600)).await.unwrap();
        plane.fail_invocations(true);
        assert_eq!(backend.check_ready().await.unwrap(), Readiness::not_ready(""));

        plane.fail_invocations(false);
        assert_eq!(backend.check_ready().await.unwrap(), Readiness::running());
        assert_eq!(plane.last_payload().unwrap()["inputs"], PROBE_QUERY);
    }

    #[tokio::test]
    async fn test_answer_in_both_modes() {
        let plane = Arc::new(FakeEndpoints::default());
        plane.respond_with(vec![
            tgi_chunk("Par"),
            tgi_chunk("is"),
            tgi_chunk("</s>"),
        ]);
        let mut backend = backend(&plane, config());
        backend.activate(Duration::from_secs(600)).await.unwrap();

        let buffered = backend.answer("Capital of France?", AnswerMode::Buffered).await;
        assert_eq!(buffered.into_text().await, "Paris");

        let Answer::Stream(fragments) = backend.answer("Capital of France?", AnswerMode::Streaming).await else {
            panic!("expected a stream");
        };
        assert_eq!(fragments.collect::<Vec<_>>().await, vec!["Par", "is"]);

        let payload = plane.last_payload().unwrap();
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["parameters"]["max_new_tokens"], 512);
    }

    #[tokio::test]
    async fn test_invocation_failure_becomes_apology() {
        let plane = Arc::new(FakeEndpoints::default());
        let mut backend = backend(&plane, config());
        backend.activate(Duration::from_secs(600)).await.unwrap();
        plane.fail_invocations(true);

        for mode in [AnswerMode::Buffered, AnswerMode::Streaming] {
            assert_eq!(backend.answer("hi", mode).await.into_text().await, APOLOGY);
        }
    }

    #[tokio::test]
    async fn test_decommission_deletes_in_order() {
        let plane = Arc::new(FakeEndpoints::default());
        let mut backend = backend(&plane, config());
        backend.activate(Duration::from_secs(600)).await.unwrap();
        let name = backend.endpoint_name().unwrap().to_string();

        backend.decommission().await.unwrap();

        assert_eq!(
            plane.deletions(),
            vec![
                format!("endpoint:{name}"),
                format!("config:{name}"),
                format!("model:{name}"),
            ]
        );
        assert_eq!(backend.endpoint_name(), None);
    }

    #[tokio::test]
    async fn test_decommission_finds_endpoint_by_base_name() {
        let plane = Arc::new(FakeEndpoints::default());
        plane.add_endpoint("Mistral-7B-tgi-streaming-2024-01-01-00-00-00-000", EndpointStatus::InService);
        let mut backend = backend(&plane, config());

        backend.decommission().await.unwrap();
        assert_eq!(plane.deletions().len(), 3);

        backend.decommission().await.unwrap();
        assert_eq!(plane.deletions().len(), 3);
        assert!(backend.events().messages().any(|m| m == "No endpoint to delete"));
    }

    #[tokio::test]
    async fn test_decommission_failure_propagates() {
        let plane = Arc::new(FakeEndpoints::default());
        let mut backend = backend(&plane, config());
        backend.activate(Duration::from_secs(600)).await.unwrap();
        plane.fail_deletes(ClientError::Cloud("AccessDenied".to_string()));

        assert!(matches!(backend.decommission().await, Err(BackendError::Resource(_))));
    }

    #[test]
    fn test_factory_rejects_unknown_region() {
        let factory = EndpointBackendFactory::new(Arc::new(FakeEndpoints::default()));
        assert!(factory.validate_config(&config()).is_ok());
        assert!(factory.validate_config(&config().with("region", "moon-1")).is_err());
        assert_eq!(
            factory.resource_key(&config(), &InstanceName::derive(Role::Expert, MODEL)),
            Some("endpoint:Mistral-7B-tgi-streaming".to_string())
        );
    }
}
