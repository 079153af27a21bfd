//! Remote execution over the system `ssh` client

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{
    render_script, script_for, CommandArgs, CommandError, RemoteExecutor, RemoteOperation,
    RemoteTarget,
};
use crate::Error;

/// Longest stderr excerpt kept in a [`CommandError`]
const MAX_STDERR_BYTES: usize = 4096;

/// Settings for [`SshExecutor`]
#[derive(Clone, Debug)]
pub struct SshExecutorConfig {
    /// Path or name of the ssh binary
    pub ssh_binary: PathBuf,
    /// TCP connect timeout passed to ssh
    pub connect_timeout: Duration,
}

impl Default for SshExecutorConfig {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Runs operation scripts through `ssh <user>@<host> bash -s`
///
/// The script is written to the remote shell's stdin so arguments never show
/// up in a process listing. The private key is written to a mode-0600 temp
/// file that lives only for the duration of the call.
pub struct SshExecutor {
    config: SshExecutorConfig,
}

impl SshExecutor {
    /// Create an executor with the given settings
    pub fn new(config: SshExecutorConfig) -> Self {
        Self { config }
    }

    fn command(&self, target: &RemoteTarget, key_path: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.config.ssh_binary);
        cmd.arg("-i")
            .arg(key_path)
            .arg("-p")
            .arg(target.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ))
            .arg(format!("{}@{}", target.user, target.host))
            .arg("bash -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new(SshExecutorConfig::default())
    }
}

fn ssh_error(msg: impl Into<String>) -> Error {
    Error::internal_with_context("ssh", msg)
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self, target, args, cancel), fields(host = %target.host, operation = %operation))]
    async fn run(
        &self,
        target: &RemoteTarget,
        operation: RemoteOperation,
        args: &CommandArgs,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let mut key_file = tempfile::NamedTempFile::new()
            .map_err(|e| ssh_error(format!("failed to create key file: {e}")))?;
        key_file
            .write_all(target.private_key.as_bytes())
            .and_then(|_| key_file.flush())
            .map_err(|e| ssh_error(format!("failed to write key file: {e}")))?;

        let script = render_script(operation, args);
        let mut child = self
            .command(target, key_file.path())
            .spawn()
            .map_err(|e| ssh_error(format!("failed to spawn ssh: {e}")))?;

        debug!("running remote operation");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ssh_error("ssh stdin was not captured"))?;

        let exec = async move {
            stdin.write_all(script.as_bytes()).await?;
            drop(stdin);
            child.wait_with_output().await
        };

        // Dropping `exec` drops the child, which kill_on_drop terminates.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("remote operation cancelled, killing ssh");
                return Err(Error::cancelled(operation.name()));
            }
            output = exec => output.map_err(|e| ssh_error(format!("ssh i/o failed: {e}")))?,
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.len() > MAX_STDERR_BYTES {
            let mut cut = MAX_STDERR_BYTES;
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            stderr.truncate(cut);
        }

        Err(CommandError::new(
            operation,
            &target.host,
            script_for(operation).trim(),
            output.status.code(),
            stderr,
        )
        .into())
    }
}
