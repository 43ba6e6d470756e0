//! A third-party hosted chat completion API.
//!
//! Nothing to provision or activate, and always ready. Each adapter owns
//! its own client and credentials.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::{
    Answer, AnswerMode, Backend, BackendConfig, BackendError, BackendFactory, BackendState,
    ConfigError, InstanceName, Readiness, StageOutcome,
};

use super::{chat_answer, client_config_error};
use crate::clients::chat::OPENAI_BASE_URL;
use crate::clients::{ApiCredential, ChatClient, ChatRequest, OpenAiChatClient};

/// Backend kind selector.
pub const HOSTED_BACKEND: &str = "openai_backend";

/// Request timeout when the config does not set `request_timeout`.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// A model served by a hosted API.
pub struct HostedBackend {
    state: BackendState,
    model_id: String,
    chat: Arc<dyn ChatClient>,
}

impl std::fmt::Debug for HostedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedBackend")
            .field("instance", &self.state.instance_name)
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl HostedBackend {
    /// Create an adapter over an existing chat client.
    pub fn new(
        config: BackendConfig,
        instance_name: InstanceName,
        chat: Arc<dyn ChatClient>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            model_id: config.model_id()?.to_string(),
            state: BackendState::new(config, instance_name),
            chat,
        })
    }

    /// Create an adapter with its own [`OpenAiChatClient`].
    ///
    /// The API key comes from `api_key` or `OPENAI_API_KEY`, the optional
    /// organization from `organization` or `OPENAI_ORGANIZATION`.
    /// Both are removed from the recorded config.
    pub fn from_config(mut config: BackendConfig, instance_name: InstanceName) -> Result<Self, ConfigError> {
        let api_key = ApiCredential::require(&config, "api_key", "OPENAI_API_KEY", "OpenAI API key")
            .map_err(client_config_error)?;
        let organization = ApiCredential::lookup(
            &config,
            "organization",
            "OPENAI_ORGANIZATION",
            "OpenAI organization",
        );
        let timeout = Duration::from_secs(
            config.u64_or("request_timeout", DEFAULT_REQUEST_TIMEOUT.as_secs())?,
        );

        let client = OpenAiChatClient::new(config.str_or("base_url", OPENAI_BASE_URL)?, timeout)
            .map_err(client_config_error)?
            .with_api_key(api_key)
            .with_organization(organization);

        config.remove("api_key");
        config.remove("organization");
        Self::new(config, instance_name, Arc::new(client))
    }
}

#[async_trait]
impl Backend for HostedBackend {
    fn kind(&self) -> &'static str {
        HOSTED_BACKEND
    }

    fn state(&self) -> &BackendState {
        &self.state
    }

    async fn provision(&mut self) -> Result<StageOutcome, BackendError> {
        self.state.record("No server to launch for a hosted API");
        Ok(StageOutcome::Completed)
    }

    async fn activate(&mut self, _max_wait: Duration) -> Result<StageOutcome, BackendError> {
        self.state.record("No inference endpoint to start for a hosted API");
        Ok(StageOutcome::Completed)
    }

    async fn check_ready(&self) -> Result<Readiness, BackendError> {
        Ok(Readiness::running())
    }

    async fn answer(&self, query: &str, mode: AnswerMode) -> Answer {
        let request = ChatRequest::single(self.model_id.as_str(), query);
        chat_answer(self.chat.as_ref(), &request, mode, &self.state.instance_name).await
    }

    async fn decommission(&mut self) -> Result<(), BackendError> {
        self.state.record("Nothing to release for a hosted API");
        Ok(())
    }
}

/// Factory for [`HostedBackend`].
#[derive(Debug, Default)]
pub struct HostedBackendFactory;

impl BackendFactory for HostedBackendFactory {
    fn backend_kind(&self) -> &'static str {
        HOSTED_BACKEND
    }

    fn create(
        &self,
        config: BackendConfig,
        instance_name: InstanceName,
    ) -> Result<Box<dyn Backend>, ConfigError> {
        Ok(Box::new(HostedBackend::from_config(config, instance_name)?))
    }

    fn description(&self) -> &'static str {
        "Hosted chat completion API"
    }
}
