//! External collaborators the backends are built on.
//!
//! The cloud control planes are traits only: embedders supply an
//! implementation backed by whatever SDK they use. The chat client, HTTP
//! probe and remote shell have concrete implementations here.

pub mod chat;
pub mod probe;
pub mod secrets;
pub mod shell;

pub use chat::{ChatMessage, ChatRequest, OpenAiChatClient};
pub use probe::ReqwestProbe;
pub use secrets::ApiCredential;
pub use shell::SshConnector;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use conductor_core::{BackendError, ConfigError};

/// Errors from collaborator calls.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Remote command failed: {0}")]
    Shell(String),

    #[error("Cloud call failed: {0}")]
    Cloud(String),

    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl From<ClientError> for BackendError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::NotConfigured(msg) => BackendError::Config(ConfigError::ValidationError(msg)),
            other @ (ClientError::Cloud(_) | ClientError::NotFound(_)) => {
                BackendError::Resource(other.to_string())
            }
            other => BackendError::Transport(other.to_string()),
        }
    }
}

/// Chunks of a streamed response body.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ClientError>>;

/// Text deltas of a streamed chat completion.
pub type DeltaStream = BoxStream<'static, Result<String, ClientError>>;

// ============================================================================
// Compute control plane
// ============================================================================

/// Power state of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    /// Parse a provider state name such as `"running"` or `"shutting-down"`.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            _ => return None,
        })
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What the control plane knows about one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: InstanceState,
    pub public_ip: Option<String>,
}

/// Launch parameters for a new machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Value of the `Name` tag
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub security_group_ids: Vec<String>,
}

/// Create, describe, start and stop tagged virtual machines.
#[async_trait]
pub trait ComputePlane: Send + Sync {
    /// The non-terminated machine whose `Name` tag equals `name`, if any.
    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceInfo>, ClientError>;

    /// Launch a machine.
    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceInfo, ClientError>;

    /// Start a stopped machine.
    async fn start(&self, instance_id: &str) -> Result<(), ClientError>;

    /// Stop a running machine. Stopped machines keep their disk.
    async fn stop(&self, instance_id: &str) -> Result<(), ClientError>;
}

// ============================================================================
// Managed endpoint control plane
// ============================================================================

/// Status of a managed inference endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointStatus {
    Creating,
    InService,
    Updating,
    Deleting,
    Failed,
    Other(String),
}

impl EndpointStatus {
    /// Parse a provider status name.
    pub fn parse(name: &str) -> Self {
        match name {
            "Creating" => EndpointStatus::Creating,
            "InService" => EndpointStatus::InService,
            "Updating" => EndpointStatus::Updating,
            "Deleting" => EndpointStatus::Deleting,
            "Failed" => EndpointStatus::Failed,
            other => EndpointStatus::Other(other.to_string()),
        }
    }

    /// Whether an endpoint in this status can be reused.
    pub fn is_live(&self) -> bool {
        matches!(self, EndpointStatus::Creating | EndpointStatus::InService)
    }
}

/// An endpoint as listed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSummary {
    pub name: String,
    pub status: EndpointStatus,
}

/// Full endpoint description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescription {
    pub name: String,
    pub status: EndpointStatus,
    pub config_name: String,
}

/// A model deployment request.
///
/// Creates the model, the endpoint configuration and the endpoint, all
/// under `endpoint_name`.
#[derive(Debug)]
pub struct ModelDeployment {
    pub endpoint_name: String,
    pub image_uri: String,
    pub instance_type: String,
    pub initial_instance_count: u32,
    pub environment: BTreeMap<String, String>,
    pub startup_health_check_timeout: Duration,

    /// Sent as `HUGGING_FACE_HUB_TOKEN`, kept out of `environment`
    pub hub_token: Option<ApiCredential>,
}

impl ModelDeployment {
    /// Container environment including the hub token.
    ///
    /// The result holds the exposed secret; pass it straight to the API call.
    pub fn container_environment(&self) -> BTreeMap<String, String> {
        let mut env = self.environment.clone();
        if let Some(token) = &self.hub_token {
            env.insert("HUGGING_FACE_HUB_TOKEN".to_string(), token.expose().to_string());
        }
        env
    }
}

/// List, deploy, invoke and delete managed inference endpoints.
#[async_trait]
pub trait EndpointPlane: Send + Sync {
    /// Every endpoint whose name contains `fragment`.
    async fn list_endpoints(&self, fragment: &str) -> Result<Vec<EndpointSummary>, ClientError>;

    /// Describe one endpoint.
    async fn describe_endpoint(&self, name: &str) -> Result<EndpointDescription, ClientError>;

    /// Name of the model served by an endpoint configuration.
    async fn config_model_name(&self, config_name: &str) -> Result<String, ClientError>;

    /// Start a deployment and return without waiting for it.
    async fn deploy(&self, deployment: &ModelDeployment) -> Result<(), ClientError>;

    async fn delete_endpoint(&self, name: &str) -> Result<(), ClientError>;

    async fn delete_endpoint_config(&self, name: &str) -> Result<(), ClientError>;

    async fn delete_model(&self, name: &str) -> Result<(), ClientError>;

    /// Invoke an endpoint with a JSON body and stream the response body.
    async fn invoke_stream(
        &self,
        endpoint_name: &str,
        body: &serde_json::Value,
    ) -> Result<ByteStream, ClientError>;
}

// ============================================================================
// Remote shell
// ============================================================================

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// An open command channel to one machine.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a command and capture its output.
    async fn exec(&self, command: &str) -> Result<CommandOutput, ClientError>;
}

/// Where and how to open a remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
    pub host: String,
    pub user: String,
    pub key_path: Option<String>,
    pub connect_timeout: Duration,
}

/// Opens remote shells.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Open a shell, failing if the machine is not reachable yet.
    async fn connect(&self, target: &ShellTarget) -> Result<Box<dyn RemoteShell>, ClientError>;
}

// ============================================================================
// HTTP probe and chat completion
// ============================================================================

/// Issues health-check GETs.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// GET `url` and return the status code.
    async fn get_status(&self, url: &str) -> Result<u16, ClientError>;
}

/// OpenAI-style chat completion.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Return the full answer.
    async fn complete(&self, request: &ChatRequest) -> Result<String, ClientError>;

    /// Return the answer as a stream of text deltas.
    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_state_names() {
        assert_eq!(InstanceState::parse("shutting-down"), Some(InstanceState::ShuttingDown));
        assert_eq!(InstanceState::parse("exploded"), None);
        assert_eq!(InstanceState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_endpoint_liveness() {
        assert!(EndpointStatus::parse("Creating").is_live());
        assert!(EndpointStatus::parse("InService").is_live());
        assert!(!EndpointStatus::parse("Failed").is_live());
        assert_eq!(
            EndpointStatus::parse("RollingBack"),
            EndpointStatus::Other("RollingBack".to_string())
        );
    }

    #[test]
    fn test_client_error_mapping() {
        let err: BackendError = ClientError::Cloud("throttled".to_string()).into();
        assert!(matches!(err, BackendError::Resource(_)));

        let err: BackendError = ClientError::Shell("exit 1".to_string()).into();
        assert!(matches!(err, BackendError::Transport(_)));

        let err: BackendError = ClientError::NotConfigured("no key".to_string()).into();
        assert!(matches!(err, BackendError::Config(_)));
    }
}
