//! Per-run task execution context.
//!
//! One context is bound to exactly one workspace for the duration of a
//! provisioning run. Every task receives it and talks to the workspace
//! through `run`/`push_file` only.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::timings::TimingsCollector;
use super::EngineContext;
use crate::command_runner::{TokioCommandRunner, DEFAULT_CMD_TIMEOUT};
use crate::error::TaskError;
use crate::exec::ExecOutput;
use crate::ide::IdeProvider;
use crate::output::Console;
use crate::providers::{AnyHost, RemoteHost};

/// Where the repository lands inside the workspace.
pub const REMOTE_REPO_ROOT: &str = "/cmux";

/// Staging path for the archive-mode source upload.
pub const REMOTE_ARCHIVE_PATH: &str = "/tmp/cmux-repo.tar";

/// Default deadline for one task command.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

const MAX_EXEC_ATTEMPTS: u32 = 3;

/// Optional cgroup binding for task commands (cpu/memory/io limits are
/// provisioned out-of-band; the engine only moves the shell into the
/// group).
#[derive(Debug, Clone, Default)]
pub struct ResourceProfile {
    pub name: String,
    pub cpu_quota: Option<u64>,
    pub cpu_weight: Option<u32>,
    pub memory_high: Option<u64>,
    pub memory_max: Option<u64>,
    pub io_weight: Option<u32>,
}

/// Run-level knobs carried into every task.
pub struct ContextOptions {
    pub repo_root: PathBuf,
    pub ide_provider: IdeProvider,
    pub use_git_diff: bool,
    pub cgroup_path: Option<String>,
    pub resource_profile: Option<ResourceProfile>,
    pub interrupt: Arc<AtomicBool>,
}

/// Execution context passed to every task.
///
/// The host is shared with the orchestrator, which verifies and captures
/// the workspace after the graph completes; the host therefore outlives
/// every context bound to it.
pub struct TaskContext {
    pub host: Arc<AnyHost>,
    pub repo_root: PathBuf,
    pub remote_repo_root: String,
    pub remote_archive_path: String,
    pub console: Console,
    pub timings: TimingsCollector,
    /// Shell snippet prepended to every command so toolchain paths resolve
    /// regardless of which user/shell the exec transport lands in.
    pub environment_prelude: String,
    pub cgroup_path: Option<String>,
    pub resource_profile: Option<ResourceProfile>,
    pub ide_provider: IdeProvider,
    pub use_git_diff: bool,
    /// Runner for local subprocesses (git queries during upload).
    pub runner: TokioCommandRunner,
    interrupt: Arc<AtomicBool>,
}

impl TaskContext {
    #[must_use]
    pub fn new(host: Arc<AnyHost>, console: Console, options: ContextOptions) -> Self {
        Self {
            host,
            repo_root: options.repo_root,
            remote_repo_root: REMOTE_REPO_ROOT.to_string(),
            remote_archive_path: REMOTE_ARCHIVE_PATH.to_string(),
            console,
            timings: TimingsCollector::default(),
            environment_prelude: environment_prelude(),
            cgroup_path: options.cgroup_path,
            resource_profile: options.resource_profile,
            ide_provider: options.ide_provider,
            use_git_diff: options.use_git_diff,
            runner: TokioCommandRunner::new(DEFAULT_CMD_TIMEOUT),
            interrupt: options.interrupt,
        }
    }

    /// Run a labelled command with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] on non-zero exit, or the transport error when
    /// all retries are exhausted.
    pub async fn run(&self, label: &str, command: &str) -> Result<ExecOutput> {
        self.run_with_timeout(label, command, DEFAULT_TASK_TIMEOUT)
            .await
    }

    /// Run a labelled command with an explicit timeout.
    ///
    /// Output is logged line by line under `[label]` / `[label][stderr]`
    /// so interleaved parallel output stays attributable.
    ///
    /// # Errors
    ///
    /// See [`TaskContext::run`].
    pub async fn run_with_timeout(
        &self,
        label: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        self.console.info(&format!("[{label}] running..."));
        let composed = self.compose(command);

        let mut attempt = 0;
        let output = loop {
            attempt += 1;
            match self.host.exec(&composed, timeout).await {
                Ok(output) => break output,
                Err(err) => {
                    if attempt >= MAX_EXEC_ATTEMPTS {
                        return Err(err);
                    }
                    let delay = Duration::from_secs(2u64.pow(attempt).min(8));
                    self.console.info(&format!(
                        "[{label}] retrying after exec failure ({err}) \
                         (attempt {attempt}/{MAX_EXEC_ATTEMPTS}) in {}s",
                        delay.as_secs()
                    ));
                    tokio::time::sleep(delay).await;
                }
            }
        };

        for line in output.stdout.lines() {
            self.console.info(&format!("[{label}] {line}"));
        }
        for line in output.stderr.lines() {
            self.console.info(&format!("[{label}][stderr] {line}"));
        }

        if !output.success() {
            return Err(TaskError {
                label: label.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(output)
    }

    /// Push a local file into the workspace.
    ///
    /// # Errors
    ///
    /// Returns the transport error when neither upload path succeeds.
    pub async fn push_file(&self, local: &std::path::Path, remote: &str) -> Result<()> {
        self.host.push_file(local, remote).await
    }

    fn compose(&self, command: &str) -> String {
        let with_env = apply_environment(&self.environment_prelude, command);
        match &self.cgroup_path {
            Some(cgroup) => wrap_with_cgroup(cgroup, &with_env),
            None => with_env,
        }
    }
}

impl EngineContext for TaskContext {
    fn console(&self) -> &Console {
        &self.console
    }

    fn timings(&self) -> &TimingsCollector {
        &self.timings
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }
}

/// Exports for the baked-in toolchain locations.
#[must_use]
pub fn environment_prelude() -> String {
    [
        "export RUSTUP_HOME=/usr/local/rustup",
        "export CARGO_HOME=/usr/local/cargo",
        "export NVM_DIR=/root/.nvm",
        "export GOPATH=/usr/local/go-workspace",
        "export GOMODCACHE=\"${GOPATH}/pkg/mod\"",
        "export GOCACHE=/usr/local/go-cache",
        "export PATH=\"/root/.local/bin:/usr/local/cargo/bin:/usr/local/go/bin:${GOPATH}/bin:/usr/local/bin:$PATH\"",
    ]
    .join("\n")
}

pub(crate) fn apply_environment(prelude: &str, command: &str) -> String {
    if prelude.is_empty() {
        command.to_string()
    } else {
        format!("{prelude}\n{command}")
    }
}

/// Best-effort move of the shell into a cgroup before the command runs.
/// A missing or read-only cgroup is silently ignored.
pub(crate) fn wrap_with_cgroup(cgroup_path: &str, command: &str) -> String {
    let cgroup = crate::exec::shell_quote(cgroup_path);
    format!(
        "if [ -d {cgroup} ] && [ -w {cgroup}/cgroup.procs ]; then\n    \
         printf '%d\\n' $$ > {cgroup}/cgroup.procs || true\nfi\n{command}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_prelude_covers_toolchain_paths() {
        let prelude = environment_prelude();
        for needle in [
            "CARGO_HOME=/usr/local/cargo",
            "NVM_DIR=/root/.nvm",
            "GOPATH=/usr/local/go-workspace",
            "/root/.local/bin",
            "/usr/local/go/bin",
        ] {
            assert!(prelude.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn test_apply_environment_prepends_prelude() {
        let composed = apply_environment("export A=1", "echo hi");
        assert_eq!(composed, "export A=1\necho hi");
    }

    #[test]
    fn test_apply_environment_empty_prelude_is_identity() {
        assert_eq!(apply_environment("", "echo hi"), "echo hi");
    }

    #[test]
    fn test_cgroup_wrap_guards_on_existence_and_writability() {
        let wrapped = wrap_with_cgroup("/sys/fs/cgroup/stencil", "echo hi");
        assert!(wrapped.contains("[ -d /sys/fs/cgroup/stencil ]"));
        assert!(wrapped.contains("[ -w /sys/fs/cgroup/stencil/cgroup.procs ]"));
        assert!(wrapped.contains("|| true"), "cgroup entry is best-effort");
        assert!(wrapped.ends_with("echo hi"));
    }

    #[test]
    fn test_cgroup_wrap_quotes_odd_paths() {
        let wrapped = wrap_with_cgroup("/sys/fs/cgroup/my group", "echo hi");
        assert!(wrapped.contains("'/sys/fs/cgroup/my group'"));
    }

    #[test]
    fn test_default_remote_paths() {
        assert_eq!(REMOTE_REPO_ROOT, "/cmux");
        assert_eq!(REMOTE_ARCHIVE_PATH, "/tmp/cmux-repo.tar");
    }
}
