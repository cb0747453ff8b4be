//! Transport dispatch: HTTP exec preferred, SSH fallback.
//!
//! Fallback only triggers when the HTTP transport is *unavailable*
//! (unreachable daemon, gateway rejection). A stream that dropped
//! mid-command is surfaced as exit 125 instead — the command may already
//! have run, and re-dispatching it over SSH could execute it twice.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::http::HttpExecClient;
use super::push::http_push_file;
use super::ssh::{SshSession, SshTarget};
use super::{bash_wrap, ExecOutput, EXIT_STREAM_DROPPED};
use crate::error::TransportError;

/// SSH route for one workspace: the shared per-run session plus how this
/// workspace is addressed through it.
pub struct SshLink {
    pub session: Arc<SshSession>,
    pub target: SshTarget,
}

/// Per-workspace transport selector.
pub struct ExecRouter {
    http: Option<HttpExecClient>,
    ssh: Option<SshLink>,
}

impl ExecRouter {
    #[must_use]
    pub fn new(http: Option<HttpExecClient>, ssh: Option<SshLink>) -> Self {
        Self { http, ssh }
    }

    #[must_use]
    pub fn has_http(&self) -> bool {
        self.http.is_some()
    }

    /// Run a shell script in the workspace.
    ///
    /// The script is wrapped in an explicit bash invocation exactly once
    /// here, so callers pass plain scripts.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConfigured`] when neither transport is
    /// set up, or the underlying transport error otherwise.
    pub async fn exec(&self, script: &str, timeout: Duration) -> Result<ExecOutput> {
        let wrapped = bash_wrap(script);

        if let Some(http) = &self.http {
            match http.exec(&wrapped, timeout).await {
                Ok(output) => return Ok(output),
                Err(err) if err.is_stream_error() => {
                    return Ok(ExecOutput {
                        exit_code: EXIT_STREAM_DROPPED,
                        stdout: String::new(),
                        stderr: err.to_string(),
                    });
                }
                Err(err) if err.is_unavailable() => {
                    // Fall through to SSH below.
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(ssh) = &self.ssh {
            return ssh.session.exec(&ssh.target, &wrapped, timeout).await;
        }

        Err(TransportError::NotConfigured.into())
    }

    /// Push a local file into the workspace.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConfigured`] when no transport can
    /// carry the file, or the underlying transport error.
    pub async fn push_file(&self, local: &Path, remote: &str, timeout: Duration) -> Result<()> {
        if let Some(http) = &self.http {
            if http_push_file(http, local, remote, timeout).await? {
                return Ok(());
            }
        }

        if let Some(ssh) = &self.ssh {
            return ssh.session.push_file(&ssh.target, local, remote, timeout).await;
        }

        Err(TransportError::NotConfigured.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_with_no_transport_reports_not_configured() {
        let router = ExecRouter::new(None, None);
        let err = router
            .exec("echo hi", Duration::from_secs(5))
            .await
            .expect_err("must fail");
        let transport = err
            .downcast_ref::<TransportError>()
            .expect("typed transport error");
        assert!(matches!(transport, TransportError::NotConfigured));
    }

    #[tokio::test]
    async fn test_push_with_no_transport_reports_not_configured() {
        let router = ExecRouter::new(None, None);
        let err = router
            .push_file(Path::new("/dev/null"), "/tmp/x", Duration::from_secs(5))
            .await
            .expect_err("must fail");
        assert!(err.downcast_ref::<TransportError>().is_some());
    }
}
