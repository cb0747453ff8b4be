//! File upload over the HTTP exec transport.
//!
//! The daemon has no upload endpoint, so the file travels as base64 inside
//! exec commands: one command truncates the target, then successive
//! commands append decoded chunks. Chunks are sized well under the
//! gateway's request limit; an HTTP 413 anyway means the caller should
//! fall back to SSH.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine as _;

use super::http::HttpExecClient;
use super::{shell_quote, ExecOutput};

/// Base64 characters per append command. Multiple of 4 keeps every chunk
/// independently decodable.
pub const CHUNK_SIZE: usize = 8192;

/// Command that creates the parent directory and truncates the target.
#[must_use]
pub fn init_command(remote: &str) -> String {
    let parent = Path::new(remote)
        .parent()
        .map_or_else(|| "/".to_string(), |p| p.display().to_string());
    format!(
        "mkdir -p {} && : > {}",
        shell_quote(&parent),
        shell_quote(remote)
    )
}

/// Command appending one decoded chunk to the target.
#[must_use]
pub fn append_command(chunk: &str, remote: &str) -> String {
    format!("printf '%s' '{chunk}' | base64 -d >> {}", shell_quote(remote))
}

/// Split encoded data on chunk boundaries.
#[must_use]
pub fn chunks(encoded: &str) -> Vec<&str> {
    encoded
        .as_bytes()
        .chunks(CHUNK_SIZE)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect()
}

/// Whether an exec failure means the gateway rejected the payload size.
#[must_use]
pub fn is_payload_too_large(output: &ExecOutput) -> bool {
    output.stderr.contains("413") || output.stderr.contains("Payload Too Large")
}

/// Push a local file through the exec daemon.
///
/// Returns `Ok(false)` when the caller should fall back to SSH (daemon
/// unavailable or payload rejected with 413).
///
/// # Errors
///
/// Returns an error when a push command fails for any other reason; the
/// remote file is in an undefined half-written state then.
pub async fn http_push_file(
    client: &HttpExecClient,
    local: &Path,
    remote: &str,
    timeout: Duration,
) -> Result<bool> {
    let data = tokio::fs::read(local)
        .await
        .with_context(|| format!("reading {}", local.display()))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);

    match run_push_command(client, &init_command(remote), timeout).await? {
        PushStep::Continue => {}
        PushStep::Fallback => return Ok(false),
    }

    for chunk in chunks(&encoded) {
        match run_push_command(client, &append_command(chunk, remote), timeout).await? {
            PushStep::Continue => {}
            PushStep::Fallback => return Ok(false),
        }
    }
    Ok(true)
}

enum PushStep {
    Continue,
    Fallback,
}

async fn run_push_command(
    client: &HttpExecClient,
    command: &str,
    timeout: Duration,
) -> Result<PushStep> {
    let wrapped = super::bash_wrap(command);
    let output = match client.exec(&wrapped, timeout).await {
        Ok(output) => output,
        Err(err) if err.is_unavailable() => return Ok(PushStep::Fallback),
        Err(err) => return Err(err.into()),
    };
    if output.success() {
        return Ok(PushStep::Continue);
    }
    if is_payload_too_large(&output) {
        return Ok(PushStep::Fallback);
    }
    bail!(
        "HTTP file push failed (exit {}):\nstdout: {}\nstderr: {}",
        output.exit_code,
        output.stdout,
        output.stderr
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_is_base64_aligned() {
        assert_eq!(CHUNK_SIZE % 4, 0);
    }

    #[test]
    fn test_chunks_cover_all_data_in_order() {
        let encoded = "A".repeat(CHUNK_SIZE * 2 + 100);
        let parts = chunks(&encoded);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), CHUNK_SIZE);
        assert_eq!(parts[1].len(), CHUNK_SIZE);
        assert_eq!(parts[2].len(), 100);
        assert_eq!(parts.concat(), encoded);
    }

    #[test]
    fn test_every_chunk_boundary_is_base64_aligned() {
        let encoded = "A".repeat(CHUNK_SIZE * 3 + 4);
        for part in chunks(&encoded) {
            assert_eq!(part.len() % 4, 0, "chunk of {} chars", part.len());
        }
    }

    #[test]
    fn test_init_command_creates_parent_and_truncates() {
        assert_eq!(
            init_command("/tmp/cmux-repo.tar"),
            "mkdir -p /tmp && : > /tmp/cmux-repo.tar"
        );
    }

    #[test]
    fn test_init_command_quotes_paths_with_spaces() {
        assert_eq!(
            init_command("/srv/my files/out.bin"),
            "mkdir -p '/srv/my files' && : > '/srv/my files/out.bin'"
        );
    }

    #[test]
    fn test_append_command_decodes_into_target() {
        assert_eq!(
            append_command("aGVsbG8=", "/tmp/f"),
            "printf '%s' 'aGVsbG8=' | base64 -d >> /tmp/f"
        );
    }

    #[test]
    fn test_payload_too_large_detection() {
        let too_large = ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "HTTP exec error 413: Payload Too Large".to_string(),
        };
        assert!(is_payload_too_large(&too_large));
        let other = ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "no space left on device".to_string(),
        };
        assert!(!is_payload_too_large(&other));
    }
}
