//! tmux session scripting for the vLLM server on a VM.
//!
//! The server runs inside a named, detached tmux session so that it keeps
//! running between SSH connections and can be re-attached. Its state is read
//! back by capturing the session's first pane.

use std::time::Duration;

use crate::clients::{ClientError, RemoteShell};

/// Default tmux session name.
pub const DEFAULT_SESSION: &str = "vllm_server";

/// Default conda environment with vLLM installed.
pub const DEFAULT_CONDA_ENV: &str = "pytorch";

/// Default vLLM port.
pub const DEFAULT_PORT: u16 = 8000;

/// Pause after session setup keystrokes.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(5);

/// What the session pane says about the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    /// Uvicorn is accepting requests
    Running,

    /// The server was launched and is loading weights
    Loading,

    /// No sign of a server
    Idle,
}

impl PaneState {
    /// Classify captured pane text.
    pub fn classify(pane: &str) -> Self {
        if pane.contains("Uvicorn running on http") {
            PaneState::Running
        } else if pane.contains("python -m vllm") || pane.contains("llm_engine.py") {
            PaneState::Loading
        } else {
            PaneState::Idle
        }
    }

    /// Status string for readiness reports.
    pub fn status(&self) -> &'static str {
        match self {
            PaneState::Running => "running",
            PaneState::Loading => "loading",
            PaneState::Idle => "",
        }
    }
}

/// How to launch the vLLM server in its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VllmSession {
    pub session: String,
    pub conda_env: String,
    pub model_id: String,
    pub port: u16,
    pub settle: Duration,
}

impl VllmSession {
    /// Session settings with defaults for everything but the model.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            session: DEFAULT_SESSION.to_string(),
            conda_env: DEFAULT_CONDA_ENV.to_string(),
            model_id: model_id.into(),
            port: DEFAULT_PORT,
            settle: DEFAULT_SETTLE,
        }
    }

    /// The command that starts the OpenAI-compatible server.
    pub fn server_command(&self) -> String {
        format!(
            "python -m vllm.entrypoints.openai.api_server --model {} --port {}",
            self.model_id, self.port
        )
    }

    fn send_keys(&self, keys: &str) -> String {
        format!("tmux send-keys -t {}.0 '{}' ENTER", self.session, keys)
    }

    async fn has_session(&self, shell: &dyn RemoteShell) -> Result<bool, ClientError> {
        let listing = shell.exec("tmux ls").await?;
        Ok(listing.stdout.contains(&self.session))
    }

    /// Capture the pane and classify it.
    pub async fn pane_state(&self, shell: &dyn RemoteShell) -> Result<PaneState, ClientError> {
        let pane = shell
            .exec(&format!("tmux capture-pane -p -t {}.0", self.session))
            .await?;
        Ok(PaneState::classify(&pane.stdout))
    }

    /// Create the session if needed and launch the server unless it is
    /// already running or loading. Safe to repeat.
    pub async fn ensure_started(&self, shell: &dyn RemoteShell) -> Result<PaneState, ClientError> {
        if self.has_session(shell).await? {
            tracing::debug!(session = %self.session, "tmux session found");
        } else {
            shell.exec(&format!("tmux new -d -s {}", self.session)).await?;
            tokio::time::sleep(self.settle).await;
            shell
                .exec(&self.send_keys(&format!("conda activate {}", self.conda_env)))
                .await?;
            tokio::time::sleep(self.settle).await;

            if !self.has_session(shell).await? {
                return Err(ClientError::Shell(format!(
                    "tmux session '{}' was not created",
                    self.session
                )));
            }
        }

        let state = self.pane_state(shell).await?;
        if state != PaneState::Idle {
            tracing::info!(session = %self.session, status = state.status(), "vLLM server already launched");
            return Ok(state);
        }

        tracing::info!(session = %self.session, model_id = %self.model_id, "Launching vLLM server");
        shell.exec(&self.send_keys(&self.server_command())).await?;
        self.pane_state(shell).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeVm;

    fn session() -> VllmSession {
        VllmSession {
            settle: Duration::ZERO,
            ..VllmSession::new("mistralai/Mistral-7B-v0.1")
        }
    }

    #[test]
    fn test_pane_classification() {
        assert_eq!(
            PaneState::classify("INFO:     Uvicorn running on http://0.0.0.0:8000"),
            PaneState::Running
        );
        assert_eq!(
            PaneState::classify("(pytorch) $ python -m vllm.entrypoints.openai.api_server"),
            PaneState::Loading
        );
        assert_eq!(PaneState::classify("INFO llm_engine.py:72] Initializing"), PaneState::Loading);
        assert_eq!(PaneState::classify("(pytorch) ubuntu@ip:~$"), PaneState::Idle);
    }

    #[test]
    fn test_server_command() {
        assert_eq!(
            session().server_command(),
            "python -m vllm.entrypoints.openai.api_server --model mistralai/Mistral-7B-v0.1 --port 8000"
        );
    }

    #[tokio::test]
    async fn test_fresh_session_setup() {
        let vm = FakeVm::default();
        let shell = vm.shell();

        let state = session().ensure_started(&shell).await.unwrap();
        assert_eq!(state, PaneState::Loading);

        let history = vm.history();
        assert!(history.contains(&"tmux new -d -s vllm_server".to_string()));
        assert!(history.contains(&"tmux send-keys -t vllm_server.0 'conda activate pytorch' ENTER".to_string()));
        assert_eq!(vm.launches(), 1);
    }

    #[tokio::test]
    async fn test_running_server_is_left_alone() {
        let vm = FakeVm::default();
        let shell = vm.shell();

        session().ensure_started(&shell).await.unwrap();
        vm.finish_loading();
        let state = session().ensure_started(&shell).await.unwrap();

        assert_eq!(state, PaneState::Running);
        assert_eq!(vm.launches(), 1);
    }
}
