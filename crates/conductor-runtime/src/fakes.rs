//! In-memory collaborators for tests.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clients::{
    ByteStream, ChatClient, ChatRequest, ClientError, CommandOutput, ComputePlane, DeltaStream,
    EndpointDescription, EndpointPlane, EndpointStatus, EndpointSummary, HttpProbe, InstanceInfo,
    InstanceSpec, InstanceState, ModelDeployment, RemoteShell, ShellConnector, ShellTarget,
};

// ============================================================================
// Virtual machine with tmux
// ============================================================================

#[derive(Debug, Default)]
struct VmState {
    sessions: Vec<String>,
    pane: String,
    history: Vec<String>,
    launches: u32,
}

/// A machine whose tmux behaves just enough like tmux.
#[derive(Debug, Clone, Default)]
pub struct FakeVm {
    state: Arc<Mutex<VmState>>,
}

impl FakeVm {
    pub fn shell(&self) -> FakeShell {
        FakeShell { vm: self.clone() }
    }

    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    pub fn launches(&self) -> u32 {
        self.state.lock().launches
    }

    /// Pretend the model finished loading.
    pub fn finish_loading(&self) {
        self.state
            .lock()
            .pane
            .push_str("INFO:     Uvicorn running on http://0.0.0.0:8000\n");
    }

    fn exec(&self, command: &str) -> CommandOutput {
        let mut state = self.state.lock();
        state.history.push(command.to_string());

        let mut output = CommandOutput::default();
        if command == "tmux ls" {
            output.stdout = state
                .sessions
                .iter()
                .map(|s| format!("{s}: 1 windows (created today)\n"))
                .collect();
        } else if let Some(name) = command.strip_prefix("tmux new -d -s ") {
            state.sessions.push(name.to_string());
        } else if command.starts_with("tmux send-keys") {
            if command.contains("python -m vllm") {
                state.launches += 1;
            }
            let keys = command.split('\'').nth(1).unwrap_or_default().to_string();
            state.pane.push_str(&format!("$ {keys}\n"));
        } else if command.starts_with("tmux capture-pane") {
            output.stdout = state.pane.clone();
        }
        output
    }
}

/// Shell into a [`FakeVm`].
#[derive(Debug, Clone)]
pub struct FakeShell {
    vm: FakeVm,
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput, ClientError> {
        Ok(self.vm.exec(command))
    }
}

#[async_trait]
impl HttpProbe for FakeVm {
    async fn get_status(&self, _url: &str) -> Result<u16, ClientError> {
        if self.state.lock().pane.contains("Uvicorn running on http") {
            Ok(200)
        } else {
            Err(ClientError::NotFound("connection refused".to_string()))
        }
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    vm: Option<FakeVm>,
    refuse: u32,
    attempts: u32,
    latency: Duration,
}

/// Connects to one [`FakeVm`], optionally refusing the first attempts.
#[derive(Debug, Default)]
pub struct FakeConnector {
    state: Mutex<ConnectorState>,
}

impl FakeConnector {
    pub fn serve(&self, vm: FakeVm) {
        self.state.lock().vm = Some(vm);
    }

    pub fn refuse_first(&self, attempts: u32) {
        self.state.lock().refuse = attempts;
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Make every attempt take `latency` before it resolves.
    pub fn respond_after(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }
}

#[async_trait]
impl ShellConnector for FakeConnector {
    async fn connect(&self, target: &ShellTarget) -> Result<Box<dyn RemoteShell>, ClientError> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.attempts += 1;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(ClientError::Shell(format!("{}: Connection refused", target.host)));
        }
        match &state.vm {
            Some(vm) => Ok(Box::new(vm.shell())),
            None => Err(ClientError::Shell(format!("{}: No route to host", target.host))),
        }
    }
}

// ============================================================================
// Compute control plane
// ============================================================================

#[derive(Debug, Default)]
struct ComputeState {
    instances: BTreeMap<String, InstanceInfo>,
    launch_pending: bool,
    last_spec: Option<InstanceSpec>,
    created: u32,
    started: u32,
    stopped: u32,
}

/// Machines keyed by their `Name` tag.
#[derive(Debug, Default)]
pub struct FakeCompute {
    state: Mutex<ComputeState>,
}

impl FakeCompute {
    const PUBLIC_IP: &'static str = "203.0.113.7";

    pub fn public_ip(&self) -> &'static str {
        Self::PUBLIC_IP
    }

    /// New machines stay in `pending`.
    pub fn launch_pending(&self) {
        self.state.lock().launch_pending = true;
    }

    pub fn last_spec(&self) -> Option<InstanceSpec> {
        self.state.lock().last_spec.clone()
    }

    pub fn created(&self) -> u32 {
        self.state.lock().created
    }

    pub fn started(&self) -> u32 {
        self.state.lock().started
    }

    pub fn stopped(&self) -> u32 {
        self.state.lock().stopped
    }

    fn set_state(&self, instance_id: &str, to: InstanceState) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let info = state
            .instances
            .values_mut()
            .find(|i| i.instance_id == instance_id)
            .ok_or_else(|| ClientError::NotFound(instance_id.to_string()))?;
        info.state = to;
        Ok(())
    }
}

#[async_trait]
impl ComputePlane for FakeCompute {
    async fn find_by_name(&self, name: &str) -> Result<Option<InstanceInfo>, ClientError> {
        Ok(self
            .state
            .lock()
            .instances
            .get(name)
            .filter(|i| i.state != InstanceState::Terminated)
            .cloned())
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<InstanceInfo, ClientError> {
        let mut state = self.state.lock();
        state.created += 1;
        let info = InstanceInfo {
            instance_id: format!("i-{:04}", state.created),
            state: if state.launch_pending {
                InstanceState::Pending
            } else {
                InstanceState::Running
            },
            public_ip: Some(Self::PUBLIC_IP.to_string()),
        };
        state.instances.insert(spec.name.clone(), info.clone());
        state.last_spec = Some(spec.clone());
        Ok(info)
    }

    async fn start(&self, instance_id: &str) -> Result<(), ClientError> {
        self.set_state(instance_id, InstanceState::Running)?;
        self.state.lock().started += 1;
        Ok(())
    }

    async fn stop(&self, instance_id: &str) -> Result<(), ClientError> {
        self.set_state(instance_id, InstanceState::Stopped)?;
        self.state.lock().stopped += 1;
        Ok(())
    }
}

// ============================================================================
// Managed endpoint control plane
// ============================================================================

/// What a deployment request carried, with the hub token resolved.
#[derive(Debug, Clone)]
pub struct DeployedModel {
    pub endpoint_name: String,
    pub image_uri: String,
    pub startup_health_check_timeout: Duration,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct EndpointState {
    endpoints: Vec<EndpointSummary>,
    deployments: Vec<DeployedModel>,
    deletions: Vec<String>,
    chunks: Vec<Vec<u8>>,
    fail_invocations: bool,
    fail_delete: Option<ClientError>,
    last_payload: Option<JsonValue>,
}

/// Endpoints whose config and model share the endpoint's name.
#[derive(Debug, Default)]
pub struct FakeEndpoints {
    state: Mutex<EndpointState>,
}

impl FakeEndpoints {
    pub fn add_endpoint(&self, name: &str, status: EndpointStatus) {
        self.state.lock().endpoints.push(EndpointSummary {
            name: name.to_string(),
            status,
        });
    }

    /// Body chunks returned by every invocation.
    pub fn respond_with(&self, chunks: Vec<Vec<u8>>) {
        self.state.lock().chunks = chunks;
    }

    pub fn fail_invocations(&self, fail: bool) {
        self.state.lock().fail_invocations = fail;
    }

    /// Fail the next delete call with `err`.
    pub fn fail_deletes(&self, err: ClientError) {
        self.state.lock().fail_delete = Some(err);
    }

    pub fn deployments(&self) -> Vec<DeployedModel> {
        self.state.lock().deployments.clone()
    }

    /// Deleted resources as `"{kind}:{name}"`, in call order.
    pub fn deletions(&self) -> Vec<String> {
        self.state.lock().deletions.clone()
    }

    pub fn last_payload(&self) -> Option<JsonValue> {
        self.state.lock().last_payload.clone()
    }

    fn delete(&self, kind: &str, name: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_delete.take() {
            return Err(err);
        }
        if kind == "endpoint" {
            state.endpoints.retain(|e| e.name != name);
        }
        state.deletions.push(format!("{kind}:{name}"));
        Ok(())
    }
}

#[async_trait]
impl EndpointPlane for FakeEndpoints {
    async fn list_endpoints(&self, fragment: &str) -> Result<Vec<EndpointSummary>, ClientError> {
        Ok(self
            .state
            .lock()
            .endpoints
            .iter()
            .filter(|e| e.name.contains(fragment))
            .cloned()
            .collect())
    }

    async fn describe_endpoint(&self, name: &str) -> Result<EndpointDescription, ClientError> {
        let state = self.state.lock();
        let endpoint = state
            .endpoints
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ClientError::NotFound(format!("endpoint {name}")))?;
        Ok(EndpointDescription {
            name: endpoint.name.clone(),
            status: endpoint.status.clone(),
            config_name: endpoint.name.clone(),
        })
    }

    async fn config_model_name(&self, config_name: &str) -> Result<String, ClientError> {
        Ok(config_name.to_string())
    }

    async fn deploy(&self, deployment: &ModelDeployment) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        state.deployments.push(DeployedModel {
            endpoint_name: deployment.endpoint_name.clone(),
            image_uri: deployment.image_uri.clone(),
            startup_health_check_timeout: deployment.startup_health_check_timeout,
            environment: deployment.container_environment(),
        });
        state.endpoints.push(EndpointSummary {
            name: deployment.endpoint_name.clone(),
            status: EndpointStatus::Creating,
        });
        Ok(())
    }

    async fn delete_endpoint(&self, name: &str) -> Result<(), ClientError> {
        self.delete("endpoint", name)
    }

    async fn delete_endpoint_config(&self, name: &str) -> Result<(), ClientError> {
        self.delete("config", name)
    }

    async fn delete_model(&self, name: &str) -> Result<(), ClientError> {
        self.delete("model", name)
    }

    async fn invoke_stream(
        &self,
        endpoint_name: &str,
        body: &JsonValue,
    ) -> Result<ByteStream, ClientError> {
        let mut state = self.state.lock();
        state.last_payload = Some(body.clone());
        if state.fail_invocations {
            return Err(ClientError::Cloud(format!("{endpoint_name}: ModelError")));
        }
        let chunks: Vec<Result<Vec<u8>, ClientError>> =
            state.chunks.iter().cloned().map(Ok).collect();
        Ok(stream::iter(chunks).boxed())
    }
}

// ============================================================================
// Chat completion
// ============================================================================

/// Replies with a fixed text, or fails every call.
#[derive(Debug, Default)]
pub struct FakeChat {
    reply: Option<String>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeChat {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().last().cloned()
    }

    fn reply(&self, request: &ChatRequest) -> Result<String, ClientError> {
        self.requests.lock().push(request.clone());
        self.reply.clone().ok_or_else(|| ClientError::Status {
            status: 429,
            body: "Rate limit reached".to_string(),
        })
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ClientError> {
        self.reply(request)
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<DeltaStream, ClientError> {
        let text = self.reply(request)?;
        let deltas: Vec<Result<String, ClientError>> =
            text.split_inclusive(' ').map(|d| Ok(d.to_string())).collect();
        Ok(stream::iter(deltas).boxed())
    }
}
