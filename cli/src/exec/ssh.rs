//! SSH exec transport (fallback).
//!
//! A `ControlMaster` socket is opened once per run so that the many
//! concurrent exec calls of a task layer multiplex over one TCP connection
//! instead of storming the host with accepts and rekeys.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use super::{escape_single_quotes, ExecOutput};
use crate::command_runner::{CommandRunner, TokioCommandRunner, DEFAULT_TRANSPORT_TIMEOUT};

/// How long the master connection persists after the last client (seconds).
const CONTROL_PERSIST_SECS: u32 = 600;

/// How a workspace is addressed through the SSH host.
#[derive(Debug, Clone)]
pub enum SshTarget {
    /// Container living on the host; commands wrap in `pct exec`.
    Container { vmid: u64 },
    /// The SSH host *is* the workspace; commands run directly.
    Instance,
}

/// Remote command for a target, with the quoting applied.
#[must_use]
pub fn build_remote_command(target: &SshTarget, script: &str) -> String {
    match target {
        SshTarget::Container { vmid } => {
            format!("pct exec {vmid} -- bash -lc '{}'", escape_single_quotes(script))
        }
        SshTarget::Instance => script.to_string(),
    }
}

struct ControlMaster {
    // Held for its Drop: removing the directory tears down the socket path.
    _dir: tempfile::TempDir,
    socket: PathBuf,
}

/// One SSH connection shared by a whole provisioning run.
pub struct SshSession {
    host: String,
    runner: TokioCommandRunner,
    control: Option<ControlMaster>,
}

impl SshSession {
    /// Open a session and start a `ControlMaster` in the background.
    ///
    /// # Errors
    ///
    /// Returns an error when the master connection cannot be established.
    pub async fn connect(host: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("stencil_ssh_")
            .tempdir()
            .context("creating control socket directory")?;
        let socket = dir.path().join("control.sock");
        let runner = TokioCommandRunner::new(DEFAULT_TRANSPORT_TIMEOUT);

        let control_path = format!("ControlPath={}", socket.display());
        let persist = format!("ControlPersist={CONTROL_PERSIST_SECS}");
        let output = runner
            .run_with_timeout(
                "ssh",
                &[
                    "-o",
                    "BatchMode=yes",
                    "-o",
                    "StrictHostKeyChecking=accept-new",
                    "-o",
                    "ControlMaster=yes",
                    "-o",
                    &control_path,
                    "-o",
                    &persist,
                    "-N",
                    "-f",
                    host,
                ],
                Duration::from_secs(30),
            )
            .await?;
        if !output.success() {
            bail!("failed to start SSH ControlMaster: {}", output.stderr.trim());
        }

        Ok(Self {
            host: host.to_string(),
            runner,
            control: Some(ControlMaster { _dir: dir, socket }),
        })
    }

    /// Session without connection multiplexing (each call dials fresh).
    #[must_use]
    pub fn without_control_master(host: &str) -> Self {
        Self {
            host: host.to_string(),
            runner: TokioCommandRunner::new(DEFAULT_TRANSPORT_TIMEOUT),
            control: None,
        }
    }

    /// Tear down the master connection. The socket directory is removed
    /// when the session drops.
    pub async fn close(&self) {
        if let Some(control) = &self.control {
            let control_path = format!("ControlPath={}", control.socket.display());
            let _ = self
                .runner
                .run_with_timeout(
                    "ssh",
                    &["-o", &control_path, "-O", "exit", &self.host],
                    Duration::from_secs(10),
                )
                .await;
        }
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(control) = &self.control {
            options.push("-o".to_string());
            options.push(format!("ControlPath={}", control.socket.display()));
        }
        options
    }

    /// Run a script inside a target workspace.
    ///
    /// # Errors
    ///
    /// Returns an error when the ssh subprocess itself cannot run; a
    /// non-zero remote exit is reported through [`ExecOutput`].
    pub async fn exec(
        &self,
        target: &SshTarget,
        script: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let remote = build_remote_command(target, script);
        self.exec_host(&remote, timeout).await
    }

    /// Run a command on the SSH host itself (outside any workspace).
    ///
    /// # Errors
    ///
    /// Returns an error when the ssh subprocess cannot run.
    pub async fn exec_host(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let mut args = self.ssh_options();
        args.push(self.host.clone());
        args.push(command.to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .runner
            .run_with_timeout("ssh", &arg_refs, timeout)
            .await
            .context("running ssh")?;
        Ok(ExecOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Push a local file into a target workspace, byte-exact.
    ///
    /// Container targets stage through `/tmp` on the host and `pct push`
    /// into the container; the staging file is removed on every exit path.
    ///
    /// # Errors
    ///
    /// Returns an error when the copy fails at any hop.
    pub async fn push_file(
        &self,
        target: &SshTarget,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<()> {
        match target {
            SshTarget::Container { vmid } => {
                let hex = Uuid::new_v4().simple().to_string();
                let staging = format!("/tmp/stencil_push_{vmid}_{}", &hex[..8]);
                self.scp(local, &staging, timeout).await?;
                let push = self
                    .exec_host(&format!("pct push {vmid} {staging} {remote}"), timeout)
                    .await;
                let _ = self
                    .exec_host(&format!("rm -f {staging}"), Duration::from_secs(30))
                    .await;
                let output = push?;
                if !output.success() {
                    bail!(
                        "pct push failed (exit {}): {}",
                        output.exit_code,
                        output.stderr.trim()
                    );
                }
                Ok(())
            }
            SshTarget::Instance => self.scp(local, remote, timeout).await,
        }
    }

    async fn scp(&self, local: &Path, remote: &str, timeout: Duration) -> Result<()> {
        let mut args = self.ssh_options();
        args.push(local.display().to_string());
        args.push(format!("{}:{remote}", self.host));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .runner
            .run_with_timeout("scp", &arg_refs, timeout)
            .await
            .context("running scp")?;
        if !output.success() {
            bail!(
                "scp failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_command_wraps_in_pct_exec() {
        let command = build_remote_command(&SshTarget::Container { vmid: 9001 }, "echo hi");
        assert_eq!(command, "pct exec 9001 -- bash -lc 'echo hi'");
    }

    #[test]
    fn test_container_command_escapes_single_quotes() {
        let command = build_remote_command(&SshTarget::Container { vmid: 9001 }, "echo 'x'");
        assert_eq!(
            command,
            r#"pct exec 9001 -- bash -lc 'echo '"'"'x'"'"''"#
        );
    }

    #[test]
    fn test_instance_command_passes_through() {
        let command = build_remote_command(&SshTarget::Instance, "echo hi");
        assert_eq!(command, "echo hi");
    }

    #[test]
    fn test_session_without_control_master_has_no_control_path() {
        let session = SshSession::without_control_master("root@10.0.0.5");
        let options = session.ssh_options();
        assert!(!options.iter().any(|opt| opt.contains("ControlPath")));
        assert!(options.contains(&"BatchMode=yes".to_string()));
    }
}
