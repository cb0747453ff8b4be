//! Typed domain error enums.
//!
//! All error types implement `thiserror::Error` and convert to
//! `anyhow::Error` via the `?` operator at the application layer.

use thiserror::Error;

// ── Transport errors ──────────────────────────────────────────────────────────

/// Remote-exec transport failures.
///
/// Only [`TransportError::Unavailable`] is eligible for SSH fallback: a
/// dropped stream means the command may already have run on the remote, so
/// re-dispatching it over another transport is unsafe.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The exec endpoint is unreachable (connect/DNS failure) or a gateway
    /// rejected the request (502/503/504/524).
    #[error("exec transport unavailable: {0}")]
    Unavailable(String),

    /// The event stream dropped mid-command.
    #[error("HTTP exec connection error: {0}")]
    Stream(String),

    /// Neither HTTP exec nor SSH is configured for this workspace.
    #[error(
        "no exec transport available: set PUBLIC_DOMAIN for HTTP exec or SSH_HOST for SSH fallback"
    )]
    NotConfigured,
}

impl TransportError {
    /// Whether falling back to another transport is safe.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Whether the stream dropped mid-command (fallback is NOT safe).
    #[must_use]
    pub fn is_stream_error(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

// ── Engine errors ─────────────────────────────────────────────────────────────

/// Scheduling and registration failures in the task engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task '{0}' already registered")]
    DuplicateTask(String),

    /// No task in the remaining set has all dependencies satisfied.
    #[error("dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("interrupted")]
    Interrupted,
}

/// A task command exited non-zero.
#[derive(Debug, Error)]
pub struct TaskError {
    pub label: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed with exit code {}", self.label, self.exit_code)?;
        if !self.stdout.trim().is_empty() {
            write!(f, "\nstdout:\n{}", self.stdout.trim_end())?;
        }
        if !self.stderr.trim().is_empty() {
            write!(f, "\nstderr:\n{}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

// ── Provider errors ───────────────────────────────────────────────────────────

/// A backend API call failed.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API error {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} task failed: {detail}")]
    TaskFailed {
        provider: &'static str,
        detail: String,
    },

    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },
}

// ── Verification errors ───────────────────────────────────────────────────────

/// One or more required artifacts are missing from a provisioned workspace.
#[derive(Debug, Error)]
pub struct VerifyError {
    pub missing: Vec<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "template verification failed - critical artifacts are missing:"
        )?;
        for item in &self.missing {
            writeln!(f, "  - {item}")?;
        }
        write!(
            f,
            "\nThis indicates the provisioning tasks did not complete successfully. \
             Refusing to capture a broken template."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_fallback_eligible() {
        let err = TransportError::Unavailable("connection refused".to_string());
        assert!(err.is_unavailable());
        assert!(!err.is_stream_error());
    }

    #[test]
    fn test_stream_error_is_not_fallback_eligible() {
        let err = TransportError::Stream("broken pipe".to_string());
        assert!(!err.is_unavailable());
        assert!(err.is_stream_error());
    }

    #[test]
    fn test_stream_error_message_names_the_connection() {
        let err = TransportError::Stream("broken pipe".to_string());
        assert_eq!(err.to_string(), "HTTP exec connection error: broken pipe");
    }

    #[test]
    fn test_task_error_includes_label_exit_and_output() {
        let err = TaskError {
            label: "install-bun".to_string(),
            exit_code: 7,
            stdout: "partial\n".to_string(),
            stderr: "curl: (22) failed\n".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("install-bun failed with exit code 7"));
        assert!(message.contains("stdout:\npartial"));
        assert!(message.contains("stderr:\ncurl: (22) failed"));
    }

    #[test]
    fn test_task_error_omits_empty_streams() {
        let err = TaskError {
            label: "check-node".to_string(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "  ".to_string(),
        };
        assert_eq!(err.to_string(), "check-node failed with exit code 1");
    }

    #[test]
    fn test_verify_error_lists_every_missing_artifact() {
        let err = VerifyError {
            missing: vec![
                "cmux-code binary: /app/cmux-code/bin/code-server-oss".to_string(),
                "Bun runtime: /root/.bun/bin/bun".to_string(),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("code-server-oss"));
        assert!(message.contains("/root/.bun/bin/bun"));
        assert!(message.contains("Refusing to capture"));
    }
}
