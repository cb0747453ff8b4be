//! Remote-exec and file-upload transports.
//!
//! Two transports run shell work inside a workspace: the HTTP exec daemon
//! (preferred) and SSH (fallback). [`router::ExecRouter`] picks between
//! them per call; the fallback policy lives there.

pub mod http;
pub mod push;
pub mod router;
pub mod ssh;

/// Exit code synthesized on deadline breach (mirrors coreutils `timeout`).
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code synthesized when the event stream drops mid-command.
pub const EXIT_STREAM_DROPPED: i32 = 125;

/// Result of one remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Escape a script for embedding between single quotes (`'` → `'"'"'`).
#[must_use]
pub fn escape_single_quotes(script: &str) -> String {
    script.replace('\'', r#"'"'"'"#)
}

/// Wrap a script in an explicit bash invocation.
///
/// The remote `sh` may be dash, which rejects `set -o pipefail`; invoking
/// bash ourselves makes the scripts portable across exec daemons.
#[must_use]
pub fn bash_wrap(script: &str) -> String {
    format!("/bin/bash -c '{}'", escape_single_quotes(script))
}

/// Quote a value for safe interpolation into a shell command.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"@%+=:,./-_".contains(&b));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r#"'\''"#))
    }
}
