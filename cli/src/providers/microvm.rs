//! Micro-VM backend (Firecracker-style API).
//!
//! Unlike the other backends this API carries exec and file writes itself:
//! `exec` posts to an exec-await endpoint that returns the collected
//! output in one response, and uploads go through a write-file endpoint.
//! Transient 5xx responses on exec are retried with backoff.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use serde::Deserialize;

use super::{
    Capture, CaptureMeta, Provider, ProviderKind, RemoteHost, ResourceShape, SnapshotHandle,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::exec::{bash_wrap, ExecOutput, EXIT_TIMEOUT};
use crate::output::Console;

const API_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_EXEC_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct VmInfo {
    vm_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    domains: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExecAwaitResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    status_code: i32,
}

#[derive(Debug, Deserialize)]
struct SnapshotCreated {
    snapshot_id: String,
}

/// Minimal JSON client for the micro-VM API.
pub struct MicroVmClient {
    http: reqwest::Client,
    api_url: String,
    api_token: String,
}

impl MicroVmClient {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(api_url: &str, api_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("building micro-VM HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let url = format!("{}{path}", self.api_url);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.api_token);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let mut excerpt = text;
            excerpt.truncate(500);
            return Err(ProviderError::Api {
                provider: "microvm",
                status: status.as_u16(),
                body: excerpt,
            }
            .into());
        }
        if text.is_empty() {
            return serde_json::from_str("null").context("decoding empty response");
        }
        serde_json::from_str(&text).with_context(|| format!("parsing response of {url}"))
    }

    /// Run a command and wait for its collected output.
    ///
    /// Retries transient 5xx responses up to 3 attempts with backoff.
    async fn exec_await(
        &self,
        vm_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let body = serde_json::json!({ "command": command, "timeout_ms": timeout_ms });
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: Result<ExecAwaitResponse> = self
                .request(
                    reqwest::Method::POST,
                    &format!("/v1/vms/{vm_id}/exec"),
                    Some(body.clone()),
                    Some(timeout + Duration::from_secs(5)),
                )
                .await;
            match result {
                Ok(response) => {
                    return Ok(ExecOutput {
                        exit_code: response.status_code,
                        stdout: response.stdout,
                        stderr: response.stderr,
                    });
                }
                Err(err) => {
                    let timed_out = err.chain().any(|cause| {
                        cause
                            .downcast_ref::<reqwest::Error>()
                            .is_some_and(reqwest::Error::is_timeout)
                    });
                    if timed_out {
                        return Ok(ExecOutput {
                            exit_code: EXIT_TIMEOUT,
                            stdout: String::new(),
                            stderr: format!("exec timed out after {}s", timeout.as_secs()),
                        });
                    }
                    let retryable = err
                        .downcast_ref::<ProviderError>()
                        .is_some_and(|provider_err| {
                            matches!(provider_err, ProviderError::Api { status, .. } if *status >= 500)
                        });
                    if !retryable || attempt >= MAX_EXEC_ATTEMPTS {
                        return Err(err);
                    }
                    let delay = Duration::from_secs(2u64.pow(attempt).min(8));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

pub struct MicroVmProvider {
    client: Arc<MicroVmClient>,
    console: Console,
}

impl MicroVmProvider {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig, console: Console) -> Result<Self> {
        Ok(Self {
            client: Arc::new(MicroVmClient::new(&config.api_url, &config.api_token)?),
            console,
        })
    }

    /// Provider-specific extra: register a fresh base snapshot from a
    /// named template image.
    ///
    /// # Errors
    ///
    /// Returns an error when the API call fails.
    pub async fn create_base_snapshot(&self, template: &str) -> Result<SnapshotHandle> {
        let created: SnapshotCreated = self
            .client
            .request(
                reqwest::Method::POST,
                "/v1/snapshots",
                Some(serde_json::json!({ "template": template })),
                None,
            )
            .await?;
        Ok(SnapshotHandle {
            id: created.snapshot_id,
        })
    }
}

impl Provider for MicroVmProvider {
    type Host = MicroVmHost;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Microvm
    }

    async fn connect_check(&self) -> Result<String> {
        let value: serde_json::Value = self
            .client
            .request(reqwest::Method::GET, "/v1/version", None, None)
            .await?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        Ok(format!("micro-VM API v{version}"))
    }

    async fn node(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn clone_workspace(&self, source_id: &str, _shape: &ResourceShape) -> Result<MicroVmHost> {
        // The micro-VM API sizes machines from the snapshot itself; the
        // requested shape is advisory here.
        self.console
            .info(&format!("Creating micro-VM from snapshot {source_id}..."));
        let info: VmInfo = self
            .client
            .request(
                reqwest::Method::POST,
                "/v1/vms",
                Some(serde_json::json!({
                    "snapshot_id": source_id,
                    "wait_for_ready_signal": true,
                })),
                None,
            )
            .await?;
        self.console
            .info(&format!("Micro-VM {} created", info.vm_id));
        Ok(MicroVmHost {
            vm_id: info.vm_id,
            domains: info.domains,
            client: self.client.clone(),
            console: self.console.clone(),
        })
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>> {
        let snapshots: Vec<SnapshotCreated> = self
            .client
            .request(reqwest::Method::GET, "/v1/snapshots", None, None)
            .await?;
        Ok(snapshots
            .into_iter()
            .map(|snapshot| SnapshotHandle {
                id: snapshot.snapshot_id,
            })
            .collect())
    }
}

pub struct MicroVmHost {
    vm_id: String,
    domains: Vec<String>,
    client: Arc<MicroVmClient>,
    console: Console,
}

impl RemoteHost for MicroVmHost {
    fn id(&self) -> String {
        self.vm_id.clone()
    }

    async fn start(&self) -> Result<()> {
        // VMs are created running (wait_for_ready_signal).
        Ok(())
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut elapsed = Duration::ZERO;
        while elapsed < timeout {
            let info: VmInfo = self
                .client
                .request(
                    reqwest::Method::GET,
                    &format!("/v1/vms/{}", self.vm_id),
                    None,
                    None,
                )
                .await?;
            if matches!(info.status.as_str(), "ready" | "running") {
                let probe = self.exec("echo ready", Duration::from_secs(10)).await;
                if probe.map(|output| output.success()).unwrap_or(false) {
                    self.console
                        .info(&format!("Micro-VM {} is ready", self.vm_id));
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            elapsed += Duration::from_secs(2);
        }
        bail!(
            "micro-VM {} did not become ready within {}s",
            self.vm_id,
            timeout.as_secs()
        )
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.client
            .exec_await(&self.vm_id, &bash_wrap(command), timeout)
            .await
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<()> {
        let data = tokio::fs::read(local)
            .await
            .with_context(|| format!("reading {}", local.display()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let _: serde_json::Value = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("/v1/vms/{}/files", self.vm_id),
                Some(serde_json::json!({ "path": remote, "content_b64": encoded })),
                None,
            )
            .await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("/v1/vms/{}/shutdown", self.vm_id),
                None,
                None,
            )
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown().await
    }

    async fn destroy(&self) -> Result<()> {
        let _ = self
            .client
            .request::<serde_json::Value>(
                reqwest::Method::DELETE,
                &format!("/v1/vms/{}", self.vm_id),
                None,
                None,
            )
            .await;
        Ok(())
    }

    async fn capture(&self, _meta: &CaptureMeta) -> Result<Capture> {
        let created: SnapshotCreated = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("/v1/vms/{}/snapshot", self.vm_id),
                None,
                None,
            )
            .await?;
        Ok(Capture {
            snapshot_id: created.snapshot_id,
            template_vmid: 0,
        })
    }

    async fn expose_port(&self, port: u16, _name: &str) -> Result<String> {
        self.service_url(port).ok_or_else(|| {
            ProviderError::Unsupported {
                provider: "microvm",
                operation: "expose_port without an assigned domain",
            }
            .into()
        })
    }

    fn service_url(&self, port: u16) -> Option<String> {
        self.domains
            .first()
            .map(|domain| format!("https://port-{port}.{domain}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_info_parses_domains() {
        let info: VmInfo = serde_json::from_str(
            r#"{"vm_id":"vm-7","status":"ready","domains":["vm-7.micro.example"]}"#,
        )
        .expect("parse");
        assert_eq!(info.vm_id, "vm-7");
        assert_eq!(info.domains, vec!["vm-7.micro.example"]);
    }

    #[test]
    fn test_exec_await_response_defaults() {
        let response: ExecAwaitResponse =
            serde_json::from_str(r#"{"status_code":0}"#).expect("parse");
        assert_eq!(response.stdout, "");
        assert_eq!(response.stderr, "");
        assert_eq!(response.status_code, 0);
    }
}
