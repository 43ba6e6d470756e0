//! vLLM on a self-managed virtual machine.
//!
//! Provisioning finds the machine tagged with the instance name, revives it
//! if stopped, or launches a new one. Activation waits for SSH, then starts
//! the vLLM OpenAI-compatible server inside a tmux session. Answers go to
//! that server's chat completion route.
//!
//! ## Config fields
//!
//! | Field                | Default         | Used by     |
//! |----------------------|-----------------|-------------|
//! | `instance_type`      | required        | provision   |
//! | `ami_id`             | required        | provision   |
//! | `KeyName`            | required        | provision   |
//! | `security_group_ids` | `$SECURITY_GROUP_ID` | provision |
//! | `KeyPath`            | none            | activate    |
//! | `ssh_user`           | `ubuntu`        | activate    |
//! | `port`               | `8000`          | all         |
//! | `transfer_protocol`  | `http`          | readiness   |
//! | `conda_env`          | `pytorch`       | activate    |
//! | `tmux_session`       | `vllm_server`   | activate    |
//!
//! Runtime state is recorded back into the config: `InstanceId`,
//! `ip_address` and `base_url`.

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use conductor_core::{
    Answer, AnswerMode, Backend, BackendConfig, BackendError, BackendFactory, BackendState,
    ConfigError, InstanceName, Readiness, StageOutcome,
};

use super::{chat_answer, client_config_error};
use crate::clients::shell::DEFAULT_SSH_USER;
use crate::clients::{
    ChatClient, ChatRequest, ClientError, ComputePlane, HttpProbe, InstanceInfo, InstanceSpec,
    InstanceState, OpenAiChatClient, RemoteShell, ReqwestProbe, ShellConnector, ShellTarget,
    SshConnector,
};
use crate::session::{VllmSession, DEFAULT_CONDA_ENV, DEFAULT_PORT, DEFAULT_SESSION};

/// Backend kind selector.
pub const VM_BACKEND: &str = "ec2_vllm_backend";

/// Pause between SSH connection attempts during activation.
pub const SSH_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Timeout of one SSH connection attempt.
pub const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout of one chat completion against the vLLM server.
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds a chat client for a server base URL once the address is known.
pub type ChatBuilder =
    Arc<dyn Fn(&str) -> Result<Arc<dyn ChatClient>, ClientError> + Send + Sync>;

/// Chat clients talking to vLLM's OpenAI-compatible server.
pub fn openai_chat_builder(timeout: Duration) -> ChatBuilder {
    Arc::new(move |base_url: &str| -> Result<Arc<dyn ChatClient>, ClientError> {
        let client = OpenAiChatClient::new(base_url, timeout)?;
        Ok(Arc::new(client) as Arc<dyn ChatClient>)
    })
}

/// Collaborators of a VM adapter.
#[derive(Clone)]
pub struct VmClients {
    pub compute: Arc<dyn ComputePlane>,
    pub connector: Arc<dyn ShellConnector>,
    pub probe: Arc<dyn HttpProbe>,
    pub chat: ChatBuilder,
}

impl VmClients {
    /// SSH, reqwest probe and OpenAI-style chat over `compute`.
    pub fn new(compute: Arc<dyn ComputePlane>) -> Result<Self, ClientError> {
        Ok(Self {
            compute,
            connector: Arc::new(SshConnector),
            probe: Arc::new(ReqwestProbe::new()?),
            chat: openai_chat_builder(CHAT_TIMEOUT),
        })
    }
}

/// A vLLM server on a tagged virtual machine.
pub struct VmBackend {
    state: BackendState,
    clients: VmClients,
    session: VllmSession,
    ssh_user: String,
    protocol: String,
    key_path: Option<String>,
    retry_interval: Duration,
    chat: Option<Arc<dyn ChatClient>>,
}

impl std::fmt::Debug for VmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmBackend")
            .field("instance", &self.state.instance_name)
            .field("session", &self.session)
            .field("connected", &self.chat.is_some())
            .finish()
    }
}

impl VmBackend {
    /// Create an adapter. Fields needed only to launch a machine are read
    /// when provisioning.
    pub fn new(
        config: BackendConfig,
        instance_name: InstanceName,
        clients: VmClients,
    ) -> Result<Self, ConfigError> {
        let model_id = config.model_id()?.to_string();
        let port = config.u64_or("port", u64::from(DEFAULT_PORT))?;
        let port = u16::try_from(port).map_err(|_| ConfigError::InvalidField {
            field: "port".to_string(),
            expected: "a TCP port number",
        })?;

        let session = VllmSession {
            session: config.str_or("tmux_session", DEFAULT_SESSION)?.to_string(),
            conda_env: config.str_or("conda_env", DEFAULT_CONDA_ENV)?.to_string(),
            port,
            ..VllmSession::new(model_id)
        };

        Ok(Self {
            ssh_user: config.str_or("ssh_user", DEFAULT_SSH_USER)?.to_string(),
            protocol: config.str_or("transfer_protocol", "http")?.to_string(),
            key_path: config.str("KeyPath").map(str::to_string),
            state: BackendState::new(config, instance_name),
            clients,
            session,
            retry_interval: SSH_RETRY_INTERVAL,
            chat: None,
        })
    }

    /// Override the pause between SSH attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Override the tmux settle pause.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.session.settle = settle;
        self
    }

    fn launch_spec(&self) -> Result<InstanceSpec, ConfigError> {
        let config = &self.state.config;
        let mut security_group_ids = config.str_list_or("security_group_ids", &[])?;
        if security_group_ids.is_empty() {
            if let Ok(group) = std::env::var("SECURITY_GROUP_ID") {
                security_group_ids.push(group);
            }
        }

        Ok(InstanceSpec {
            name: self.state.instance_name.to_string(),
            image_id: config.require_str("ami_id")?.to_string(),
            instance_type: config.require_str("instance_type")?.to_string(),
            key_name: config.require_str("KeyName")?.to_string(),
            security_group_ids,
        })
    }

    fn shell_target(&self, host: &str) -> ShellTarget {
        ShellTarget {
            host: host.to_string(),
            user: self.ssh_user.clone(),
            key_path: self.key_path.clone(),
            connect_timeout: SSH_CONNECT_TIMEOUT,
        }
    }

    fn record_instance(&mut self, info: &InstanceInfo) {
        self.state.config.set("InstanceId", info.instance_id.as_str());
        if let Some(ip) = &info.public_ip {
            self.state.config.set("ip_address", ip.as_str());
        }
    }

    fn docs_url(&self) -> Option<String> {
        let ip = self.state.config.str("ip_address")?;
        Some(format!("{}://{ip}:{}/docs", self.protocol, self.session.port))
    }

    /// Look the machine up again and open a shell to its current address.
    async fn connect_once(&self) -> Result<(String, Box<dyn RemoteShell>), ClientError> {
        let name = self.state.instance_name.as_str();
        let info = self
            .clients
            .compute
            .find_by_name(name)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("no instance named '{name}'")))?;
        let ip = info
            .public_ip
            .ok_or_else(|| ClientError::NotFound(format!("'{name}' has no public address yet")))?;

        let shell = self.clients.connector.connect(&self.shell_target(&ip)).await?;
        Ok((ip, shell))
    }
}

#[async_trait]
impl Backend for VmBackend {
    fn kind(&self) -> &'static str {
        VM_BACKEND
    }

    fn state(&self) -> &BackendState {
        &self.state
    }

    async fn provision(&mut self) -> Result<StageOutcome, BackendError> {
        let name = self.state.instance_name.to_string();
        let compute = self.clients.compute.clone();

        let info = match compute.find_by_name(&name).await? {
            Some(info) if info.state == InstanceState::Running => {
                self.state
                    .record(format!("Instance {} is already running", info.instance_id));
                info
            }
            Some(info) if info.state == InstanceState::Stopped => {
                compute.start(&info.instance_id).await?;
                self.state
                    .record(format!("Instance {} was stopped, starting it", info.instance_id));
                info
            }
            Some(info) => {
                self.record_instance(&info);
                tracing::warn!(instance = %name, state = %info.state, "Instance in transition");
                return Ok(StageOutcome::pending(format!(
                    "instance {} is {}",
                    info.instance_id, info.state
                )));
            }
            None => {
                let spec = self.launch_spec()?;
                let info = compute.create(&spec).await?;
                self.state
                    .record(format!("Launched instance {} as '{}'", info.instance_id, name));
                info
            }
        };

        self.record_instance(&info);
        Ok(StageOutcome::Completed)
    }

    async fn activate(&mut self, max_wait: Duration) -> Result<StageOutcome, BackendError> {
        let deadline = Instant::now() + max_wait;
        let interval = self.retry_interval;
        let attempts = (max_wait.as_millis() / interval.as_millis().max(1)) as usize;
        let backoff = ConstantBuilder::default()
            .with_delay(interval)
            .with_max_times(attempts);

        let connecting = (|| self.connect_once())
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .notify(|err: &ClientError, wait: Duration| {
                tracing::debug!(instance = %self.state.instance_name, error = %err, ?wait, "SSH not reachable yet");
            });

        let (ip, shell) = match timeout_at(deadline, connecting).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                tracing::warn!(instance = %self.state.instance_name, error = %e, "Giving up on SSH");
                return Ok(StageOutcome::pending(format!(
                    "instance not reachable over SSH within {}s",
                    max_wait.as_secs()
                )));
            }
            Err(_) => {
                tracing::warn!(instance = %self.state.instance_name, ?max_wait, "SSH attempts outlasted max wait");
                return Ok(StageOutcome::pending(format!(
                    "instance not reachable over SSH within {}s",
                    max_wait.as_secs()
                )));
            }
        };
        self.state.config.set("ip_address", ip.as_str());

        let pane = match timeout_at(deadline, self.session.ensure_started(shell.as_ref())).await {
            Ok(Ok(pane)) => pane,
            Ok(Err(e)) => {
                tracing::warn!(instance = %self.state.instance_name, error = %e, "Server launch failed");
                return Ok(StageOutcome::pending(format!("server launch failed: {e}")));
            }
            Err(_) => {
                tracing::warn!(instance = %self.state.instance_name, ?max_wait, "Server launch outlasted max wait");
                return Ok(StageOutcome::pending(format!(
                    "server launch did not finish within {}s",
                    max_wait.as_secs()
                )));
            }
        };

        let base_url = format!("{}://{ip}:{}/v1", self.protocol, self.session.port);
        self.chat = Some((self.clients.chat)(&base_url).map_err(BackendError::from)?);
        self.state.config.set("base_url", base_url.as_str());
        self.state
            .record(format!("vLLM server launched in tmux session '{}' ({})", self.session.session, pane.status()));

        Ok(StageOutcome::Completed)
    }

    async fn check_ready(&self) -> Result<Readiness, BackendError> {
        let Some(url) = self.docs_url() else {
            return Ok(Readiness::not_ready("not provisioned"));
        };

        Ok(match self.clients.probe.get_status(&url).await {
            Ok(200) => Readiness::running(),
            Ok(status) => Readiness::not_ready(format!("status {status}")),
            Err(e) => {
                tracing::debug!(instance = %self.state.instance_name, error = %e, "Readiness probe failed");
                Readiness::not_ready("connection error")
            }
        })
    }

    async fn answer(&self, query: &str, mode: AnswerMode) -> Answer {
        let Some(chat) = &self.chat else {
            tracing::warn!(instance = %self.state.instance_name, "Answer requested before activation");
            return Answer::apology(mode);
        };

        let request = ChatRequest::single(self.session.model_id.as_str(), query);
        chat_answer(chat.as_ref(), &request, mode, &self.state.instance_name).await
    }

    async fn decommission(&mut self) -> Result<(), BackendError> {
        let instance_id = match self.state.config.str("InstanceId") {
            Some(id) => Some(id.to_string()),
            None => self
                .clients
                .compute
                .find_by_name(self.state.instance_name.as_str())
                .await?
                .map(|info| info.instance_id),
        };

        self.chat = None;
        match instance_id {
            Some(id) => {
                self.clients.compute.stop(&id).await?;
                self.state.record(format!("Instance {id} stopped"));
            }
            None => self.state.record("No instance to stop"),
        }
        Ok(())
    }
}

/// Factory for [`VmBackend`].
#[derive(Clone)]
pub struct VmBackendFactory {
    clients: VmClients,
}

impl VmBackendFactory {
    /// Create a factory whose adapters share these collaborators.
    pub fn new(clients: VmClients) -> Self {
        Self { clients }
    }

    /// A factory with the default SSH, probe and chat clients over `compute`.
    pub fn with_compute(compute: Arc<dyn ComputePlane>) -> Result<Self, ConfigError> {
        VmClients::new(compute)
            .map(Self::new)
            .map_err(client_config_error)
    }
}

impl BackendFactory for VmBackendFactory {
    fn backend_kind(&self) -> &'static str {
        VM_BACKEND
    }

    fn create(
        &self,
        config: BackendConfig,
        instance_name: InstanceName,
    ) -> Result<Box<dyn Backend>, ConfigError> {
        Ok(Box::new(VmBackend::new(config, instance_name, self.clients.clone())?))
    }

    fn resource_key(&self, _config: &BackendConfig, instance_name: &InstanceName) -> Option<String> {
        Some(format!("vm:{instance_name}"))
    }

    fn description(&self) -> &'static str {
        "vLLM server on a self-managed virtual machine"
    }
}
