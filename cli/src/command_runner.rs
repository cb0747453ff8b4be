//! Async subprocess execution with guaranteed timeout and kill.
//!
//! Used for everything the engine runs locally: `ssh`/`scp` transport
//! subprocesses and `git` queries against the source repository.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

/// Default timeout for short local commands (git queries).
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for remote transport subprocesses (ssh/scp).
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(600);

/// Decoded output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Generic command execution with timeout and guaranteed process kill.
///
/// The production implementation uses tokio; test doubles can return canned
/// results without spawning processes.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run a command with the default timeout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a command with a custom timeout (overrides default).
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Run a command in a working directory (used for git).
    async fn run_in_dir(&self, program: &str, args: &[&str], dir: &Path) -> Result<CommandOutput>;
}

/// Production `CommandRunner` backed by tokio.
///
/// `tokio::time::timeout` around `.output().await` does not kill the child
/// when the timeout fires — the future is dropped but the OS process keeps
/// running. This implementation uses `tokio::select!` with an explicit
/// `child.kill()` so the process is always terminated.
#[derive(Clone)]
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run_command(
        &self,
        program: &str,
        args: &[&str],
        dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        // Read stdout/stderr concurrently with wait() — a child writing more
        // than the OS pipe buffer would otherwise block and deadlock wait().
        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut handle) = stdout_handle {
                            let _ = handle.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut handle) = stderr_handle {
                            let _ = handle.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                let status = status.with_context(|| format!("waiting for {program}"))?;
                Ok(CommandOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                })
            } => result,
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                anyhow::bail!("{program} timed out after {}s", timeout.as_secs())
            }
        }
    }
}

impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run_command(program, args, None, self.timeout).await
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.run_command(program, args, None, timeout).await
    }

    async fn run_in_dir(&self, program: &str, args: &[&str], dir: &Path) -> Result<CommandOutput> {
        self.run_command(program, args, Some(dir), self.timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> TokioCommandRunner {
        TokioCommandRunner::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_run_captures_stdout_and_exit_code() {
        let output = runner().run("sh", &["-c", "echo hello"]).await.expect("run");
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_run_captures_stderr_and_nonzero_exit() {
        let output = runner()
            .run("sh", &["-c", "echo oops >&2; exit 3"])
            .await
            .expect("run");
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_run_with_timeout_kills_slow_process() {
        let result = runner()
            .run_with_timeout("sh", &["-c", "sleep 30"], Duration::from_millis(200))
            .await;
        let err = result.expect_err("must time out");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_in_dir_uses_working_directory() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let output = runner()
            .run_in_dir("sh", &["-c", "pwd"], dir.path())
            .await
            .expect("run");
        let reported = std::path::Path::new(output.stdout.trim())
            .canonicalize()
            .expect("canonicalize");
        assert_eq!(reported, dir.path().canonicalize().expect("canonicalize"));
    }

    #[tokio::test]
    async fn test_run_missing_program_errors() {
        let result = runner().run("definitely-not-a-real-binary-xyz", &[]).await;
        assert!(result.is_err());
    }
}
