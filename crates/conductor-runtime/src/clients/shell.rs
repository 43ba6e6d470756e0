//! Remote shell over the system `ssh` binary.
//!
//! Every command runs in its own `ssh` invocation; anything that has to
//! outlive a command (the model server) lives in a tmux session on the
//! remote side.

use async_trait::async_trait;
use tokio::process::Command;

use super::{ClientError, CommandOutput, RemoteShell, ShellConnector, ShellTarget};

/// Default login user on the serving image.
pub const DEFAULT_SSH_USER: &str = "ubuntu";

/// Opens [`SshShell`]s.
#[derive(Debug, Clone, Default)]
pub struct SshConnector;

/// Runs commands on one host through `ssh`.
#[derive(Debug, Clone)]
pub struct SshShell {
    target: ShellTarget,
}

impl SshShell {
    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.target.connect_timeout.as_secs().max(1)));
        if let Some(key) = &self.target.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.target.user, self.target.host))
            .arg("--")
            .arg(remote)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput, ClientError> {
        tracing::debug!(host = %self.target.host, command, "ssh");

        let output = self
            .command(command)
            .output()
            .await
            .map_err(|e| ClientError::Shell(format!("failed to spawn ssh: {e}")))?;

        // 255 is ssh's own failure code; anything else came from the remote command
        if output.status.code() == Some(255) {
            return Err(ClientError::Shell(format!(
                "{}: {}",
                self.target.host,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(&self, target: &ShellTarget) -> Result<Box<dyn RemoteShell>, ClientError> {
        let shell = SshShell {
            target: target.clone(),
        };
        shell.exec("true").await?;
        Ok(Box::new(shell))
    }
}
