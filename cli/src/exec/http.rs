//! HTTP exec transport.
//!
//! The exec daemon inside every workspace listens on port 39375 (exposed
//! through the tunnel domain) and answers `POST /exec` with a chunked body
//! of newline-delimited JSON events. The stream is parsed incrementally;
//! memory stays proportional to one line, never the whole response.
//!
//! A stream that ends without an `exit` event is treated as success. The
//! daemon is known to truncate under proxy timeouts, and a spurious failure
//! here would abort provisioning that actually completed — the artifact
//! verifier catches genuinely truncated commands instead. Re-running the
//! command is not an option because task bodies are not idempotent.

use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;

use super::{ExecOutput, EXIT_TIMEOUT};
use crate::error::TransportError;
use stencil_common::ports::EXEC_DAEMON_PORT;

/// Statuses that mean the daemon is unreachable behind a gateway.
const GATEWAY_STATUSES: [u16; 4] = [502, 503, 504, 524];

/// Attempts for transient (non-gateway) 5xx responses.
const MAX_ATTEMPTS: u32 = 3;

/// One event from the exec daemon's NDJSON stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecEvent {
    Stdout { data: String },
    Stderr { data: String },
    Exit { code: i32 },
    Error { message: String },
}

/// Exec URL for a workspace behind the tunnel domain.
#[must_use]
pub fn exec_url(public_domain: &str, host_id: &str) -> String {
    format!("https://port-{EXEC_DAEMON_PORT}-{host_id}.{public_domain}/exec")
}

/// Whether a status classifies as `transport_unavailable`.
#[must_use]
pub fn is_gateway_status(status: u16) -> bool {
    GATEWAY_STATUSES.contains(&status)
}

/// A parsed stream line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParsedLine {
    Event(ExecEvent),
    /// Undecodable or malformed line; copied to stderr verbatim.
    Raw(String),
    /// Well-formed event of an unknown type; dropped.
    Ignored,
}

pub(crate) fn parse_event_line(line: &str) -> Option<ParsedLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return Some(ParsedLine::Raw(line.to_string()));
    };
    if !value.is_object() {
        return Some(ParsedLine::Raw(format!(
            "Invalid JSON event (not a dict): {line}"
        )));
    }
    match serde_json::from_value::<ExecEvent>(value) {
        Ok(event) => Some(ParsedLine::Event(event)),
        Err(_) => Some(ParsedLine::Ignored),
    }
}

/// Accumulates stream events into the final [`ExecOutput`].
#[derive(Default)]
pub(crate) struct StreamAccumulator {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

impl StreamAccumulator {
    pub(crate) fn apply_line(&mut self, line: &str, sink: &mut (dyn FnMut(&ExecEvent) + Send)) {
        match parse_event_line(line) {
            Some(ParsedLine::Event(event)) => {
                sink(&event);
                match event {
                    ExecEvent::Stdout { data } => self.stdout.push_str(&data),
                    ExecEvent::Stderr { data } => self.stderr.push_str(&data),
                    ExecEvent::Exit { code } => self.exit_code = Some(code),
                    ExecEvent::Error { message } => {
                        self.stderr.push_str(&message);
                        self.exit_code = Some(1);
                    }
                }
            }
            Some(ParsedLine::Raw(raw)) => self.stderr.push_str(&raw),
            Some(ParsedLine::Ignored) | None => {}
        }
    }

    /// A finished stream with no `exit` event counts as success.
    pub(crate) fn finish(self) -> ExecOutput {
        ExecOutput {
            exit_code: self.exit_code.unwrap_or(0),
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Client for one workspace's exec daemon.
pub struct HttpExecClient {
    client: reqwest::Client,
    exec_url: String,
}

impl HttpExecClient {
    #[must_use]
    pub fn new(exec_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            exec_url,
        }
    }

    /// Run a shell script, accumulating output.
    ///
    /// # Errors
    ///
    /// [`TransportError::Unavailable`] when the daemon is unreachable
    /// (fallback-eligible); [`TransportError::Stream`] when the event
    /// stream dropped mid-command (NOT fallback-eligible).
    pub async fn exec(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError> {
        self.exec_with_sink(command, timeout, &mut |_| {}).await
    }

    /// Run a shell script, streaming each event to `sink` as it arrives.
    ///
    /// # Errors
    ///
    /// See [`HttpExecClient::exec`].
    pub async fn exec_with_sink(
        &self,
        command: &str,
        timeout: Duration,
        sink: &mut (dyn FnMut(&ExecEvent) + Send),
    ) -> Result<ExecOutput, TransportError> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let body = serde_json::json!({
            "command": format!("HOME=/root {command}"),
            "timeout_ms": timeout_ms,
        });

        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(timeout, self.attempt(&body, sink)).await {
                Err(_) => {
                    return Ok(ExecOutput {
                        exit_code: EXIT_TIMEOUT,
                        stdout: String::new(),
                        stderr: format!("HTTP exec timed out after {}s", timeout.as_secs()),
                    });
                }
                Ok(Attempt::Done(result)) => return result,
                Ok(Attempt::Retry { status, body }) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Ok(ExecOutput {
                            exit_code: 1,
                            stdout: String::new(),
                            stderr: format!("HTTP exec error {status}: {body}"),
                        });
                    }
                    let delay = Duration::from_secs(2u64.pow(attempt).min(8));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(
        &self,
        body: &serde_json::Value,
        sink: &mut (dyn FnMut(&ExecEvent) + Send),
    ) -> Attempt {
        let response = match self.client.post(&self.exec_url).json(body).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Attempt::Done(Ok(ExecOutput {
                    exit_code: EXIT_TIMEOUT,
                    stdout: String::new(),
                    stderr: format!("HTTP exec timed out: {err}"),
                }));
            }
            // Connection refused, DNS failure, unresolvable name.
            Err(err) => {
                return Attempt::Done(Err(TransportError::Unavailable(err.to_string())));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            if is_gateway_status(code) {
                return Attempt::Done(Err(TransportError::Unavailable(format!(
                    "HTTP {code} from exec gateway"
                ))));
            }
            let body_text = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Attempt::Retry {
                    status: code,
                    body: body_text,
                };
            }
            return Attempt::Done(Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("HTTP exec error {code}: {body_text}"),
            }));
        }

        Attempt::Done(read_stream(response, sink).await)
    }
}

enum Attempt {
    Done(Result<ExecOutput, TransportError>),
    Retry { status: u16, body: String },
}

async fn read_stream(
    response: reqwest::Response,
    sink: &mut (dyn FnMut(&ExecEvent) + Send),
) -> Result<ExecOutput, TransportError> {
    let mut accumulator = StreamAccumulator::default();
    let mut buffer: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            // The connection dropped mid-stream; the command may have run,
            // so this must not trigger a fallback re-dispatch.
            Err(err) => return Err(TransportError::Stream(err.to_string())),
        };
        buffer.extend_from_slice(&chunk);
        while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            accumulator.apply_line(&String::from_utf8_lossy(&line), sink);
        }
    }
    if !buffer.is_empty() {
        accumulator.apply_line(&String::from_utf8_lossy(&buffer), sink);
    }

    Ok(accumulator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulate(lines: &[&str]) -> ExecOutput {
        let mut accumulator = StreamAccumulator::default();
        for line in lines {
            accumulator.apply_line(line, &mut |_| {});
        }
        accumulator.finish()
    }

    #[test]
    fn test_exec_url_pattern() {
        assert_eq!(
            exec_url("tunnel.example.com", "stencil-ab12cd34"),
            "https://port-39375-stencil-ab12cd34.tunnel.example.com/exec"
        );
    }

    #[test]
    fn test_gateway_statuses_classified_unavailable() {
        for status in [502, 503, 504, 524] {
            assert!(is_gateway_status(status), "{status} must be gateway");
        }
        assert!(!is_gateway_status(500));
        assert!(!is_gateway_status(404));
    }

    #[test]
    fn test_parse_stdout_event() {
        let parsed = parse_event_line(r#"{"type":"stdout","data":"hello\n"}"#);
        assert_eq!(
            parsed,
            Some(ParsedLine::Event(ExecEvent::Stdout {
                data: "hello\n".to_string()
            }))
        );
    }

    #[test]
    fn test_parse_exit_event() {
        let parsed = parse_event_line(r#"{"type":"exit","code":3}"#);
        assert_eq!(parsed, Some(ParsedLine::Event(ExecEvent::Exit { code: 3 })));
    }

    #[test]
    fn test_parse_empty_line_skipped() {
        assert_eq!(parse_event_line("   "), None);
    }

    #[test]
    fn test_parse_undecodable_line_is_raw() {
        assert_eq!(
            parse_event_line("not json at all"),
            Some(ParsedLine::Raw("not json at all".to_string()))
        );
    }

    #[test]
    fn test_parse_non_object_json_is_flagged() {
        let parsed = parse_event_line("[1,2]");
        assert_eq!(
            parsed,
            Some(ParsedLine::Raw(
                "Invalid JSON event (not a dict): [1,2]".to_string()
            ))
        );
    }

    #[test]
    fn test_parse_unknown_event_type_is_ignored() {
        assert_eq!(
            parse_event_line(r#"{"type":"heartbeat"}"#),
            Some(ParsedLine::Ignored)
        );
    }

    #[test]
    fn test_stream_reassembles_output_in_order() {
        let output = accumulate(&[
            r#"{"type":"stdout","data":"a"}"#,
            r#"{"type":"stderr","data":"warn"}"#,
            r#"{"type":"stdout","data":"b\n"}"#,
            r#"{"type":"exit","code":0}"#,
        ]);
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "ab\n");
        assert_eq!(output.stderr, "warn");
    }

    #[test]
    fn test_stream_error_event_sets_exit_one() {
        let output = accumulate(&[r#"{"type":"error","message":"daemon restarting"}"#]);
        assert_eq!(output.exit_code, 1);
        assert_eq!(output.stderr, "daemon restarting");
    }

    #[test]
    fn test_stream_without_exit_event_assumes_success() {
        // Deliberate: the daemon can truncate under proxy timeouts and the
        // verifier catches any missing effect.
        let output = accumulate(&[r#"{"type":"stdout","data":"partial"}"#]);
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "partial");
    }

    #[test]
    fn test_stream_preserves_nonzero_exit() {
        let output = accumulate(&[r#"{"type":"exit","code":127}"#]);
        assert_eq!(output.exit_code, 127);
    }

    #[test]
    fn test_sink_sees_events_in_stream_order() {
        let mut seen = Vec::new();
        let mut accumulator = StreamAccumulator::default();
        for line in [
            r#"{"type":"stdout","data":"one"}"#,
            r#"{"type":"exit","code":0}"#,
        ] {
            accumulator.apply_line(line, &mut |event| seen.push(event.clone()));
        }
        assert_eq!(
            seen,
            vec![
                ExecEvent::Stdout {
                    data: "one".to_string()
                },
                ExecEvent::Exit { code: 0 },
            ]
        );
    }
}
