//! VM-snapshot cloud backend.
//!
//! Instances boot directly from snapshots with the requested resource
//! shape, so `clone_workspace` is a single boot call and `start` is a
//! no-op. Exec and file push go through the shared HTTP-exec daemon baked
//! into every snapshot; captures are API-side snapshots.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::{
    Capture, CaptureMeta, Provider, ProviderKind, RemoteHost, ResourceShape, SnapshotHandle,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::exec::http::{exec_url, HttpExecClient};
use crate::exec::router::ExecRouter;
use crate::exec::ExecOutput;
use crate::output::Console;

const API_TIMEOUT: Duration = Duration::from_secs(60);
const PUSH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct InstanceInfo {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct HttpServiceInfo {
    url: String,
}

#[derive(Debug, Serialize)]
struct BootRequest<'a> {
    snapshot_id: &'a str,
    vcpus: u32,
    memory_mib: u64,
    disk_size_mib: u64,
}

/// Minimal JSON client for the VM-snapshot API.
pub struct VmSnapClient {
    http: reqwest::Client,
    api_url: String,
    api_token: String,
}

impl VmSnapClient {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(api_url: &str, api_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("building VM-snapshot HTTP client")?;
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
    ) -> Result<T> {
        let url = format!("{}{path}", self.api_url);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.api_token);
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
                provider: "vm-snapshot",
                status: status.as_u16(),
                body: excerpt,
            }
            .into());
        }
        if text.is_empty() {
            // Lifecycle endpoints answer with an empty body.
            return serde_json::from_str("null").context("decoding empty response");
        }
        serde_json::from_str(&text).with_context(|| format!("parsing response of {url}"))
    }

    async fn version(&self) -> Result<String> {
        let value: serde_json::Value = self
            .request(reqwest::Method::GET, "/v1/version", None)
            .await?;
        Ok(value
            .get("version")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }
}

pub struct VmSnapProvider {
    client: Arc<VmSnapClient>,
    public_domain: Option<String>,
    console: Console,
}

impl VmSnapProvider {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig, console: Console) -> Result<Self> {
        Ok(Self {
            client: Arc::new(VmSnapClient::new(&config.api_url, &config.api_token)?),
            public_domain: config.public_domain.clone(),
            console,
        })
    }
}

impl Provider for VmSnapProvider {
    type Host = VmSnapHost;

    fn kind(&self) -> ProviderKind {
        ProviderKind::VmSnapshot
    }

    async fn connect_check(&self) -> Result<String> {
        let version = self.client.version().await?;
        Ok(format!("VM-snapshot API v{version}"))
    }

    async fn node(&self) -> Result<String> {
        // The cloud API has no locality notion worth recording.
        Ok(String::new())
    }

    async fn clone_workspace(&self, source_id: &str, shape: &ResourceShape) -> Result<VmSnapHost> {
        self.console
            .info(&format!("Booting instance from snapshot {source_id}..."));
        let request = BootRequest {
            snapshot_id: source_id,
            vcpus: shape.vcpus,
            memory_mib: shape.memory_mib,
            disk_size_mib: shape.disk_size_mib,
        };
        let info: InstanceInfo = self
            .client
            .request(
                reqwest::Method::POST,
                "/v1/instances",
                Some(serde_json::to_value(&request).context("encoding boot request")?),
            )
            .await?;
        self.console
            .info(&format!("Instance {} booted ({})", info.id, info.status));
        Ok(VmSnapHost {
            instance_id: info.id.clone(),
            client: self.client.clone(),
            router: build_router(self.public_domain.as_deref(), &info.id),
            console: self.console.clone(),
            public_domain: self.public_domain.clone(),
        })
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>> {
        let snapshots: Vec<SnapshotInfo> = self
            .client
            .request(reqwest::Method::GET, "/v1/snapshots", None)
            .await?;
        Ok(snapshots
            .into_iter()
            .map(|snapshot| SnapshotHandle { id: snapshot.id })
            .collect())
    }
}

fn build_router(public_domain: Option<&str>, instance_id: &str) -> ExecRouter {
    let http =
        public_domain.map(|domain| HttpExecClient::new(exec_url(domain, instance_id)));
    // Instances have no static SSH address, so there is no fallback route.
    ExecRouter::new(http, None)
}

pub struct VmSnapHost {
    instance_id: String,
    client: Arc<VmSnapClient>,
    router: ExecRouter,
    console: Console,
    public_domain: Option<String>,
}

impl RemoteHost for VmSnapHost {
    fn id(&self) -> String {
        self.instance_id.clone()
    }

    async fn start(&self) -> Result<()> {
        // Instances boot running.
        Ok(())
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut elapsed = Duration::ZERO;
        while elapsed < timeout {
            let info: InstanceInfo = self
                .client
                .request(
                    reqwest::Method::GET,
                    &format!("/v1/instances/{}", self.instance_id),
                    None,
                )
                .await?;
            if matches!(info.status.as_str(), "running" | "ready") {
                if !self.router.has_http() {
                    return Ok(());
                }
                if let Ok(output) = self.router.exec("echo ready", Duration::from_secs(10)).await {
                    if output.success() && output.stdout.contains("ready") {
                        self.console
                            .info(&format!("Instance {} is ready", self.instance_id));
                        return Ok(());
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            elapsed += Duration::from_secs(2);
        }
        bail!(
            "instance {} did not become ready within {}s",
            self.instance_id,
            timeout.as_secs()
        )
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.router.exec(command, timeout).await
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<()> {
        self.router.push_file(local, remote, PUSH_TIMEOUT).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop().await
    }

    async fn stop(&self) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("/v1/instances/{}/stop", self.instance_id),
                None,
            )
            .await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let _ = self
            .client
            .request::<serde_json::Value>(
                reqwest::Method::DELETE,
                &format!("/v1/instances/{}", self.instance_id),
                None,
            )
            .await;
        Ok(())
    }

    async fn capture(&self, _meta: &CaptureMeta) -> Result<Capture> {
        let snapshot: SnapshotInfo = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("/v1/instances/{}/snapshot", self.instance_id),
                None,
            )
            .await?;
        Ok(Capture {
            snapshot_id: snapshot.id,
            template_vmid: 0,
        })
    }

    async fn expose_port(&self, port: u16, name: &str) -> Result<String> {
        let service: HttpServiceInfo = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("/v1/instances/{}/http-services", self.instance_id),
                Some(serde_json::json!({ "name": name, "port": port })),
            )
            .await?;
        Ok(service.url)
    }

    fn service_url(&self, port: u16) -> Option<String> {
        self.public_domain
            .as_ref()
            .map(|domain| format!("https://port-{port}-{}.{domain}", self.instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_request_serializes_resource_shape() {
        let request = BootRequest {
            snapshot_id: "snapshot_ab12cd34",
            vcpus: 4,
            memory_mib: 8192,
            disk_size_mib: 32768,
        };
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["snapshot_id"], "snapshot_ab12cd34");
        assert_eq!(json["vcpus"], 4);
        assert_eq!(json["memory_mib"], 8192);
        assert_eq!(json["disk_size_mib"], 32768);
    }

    #[test]
    fn test_instance_info_tolerates_missing_status() {
        let info: InstanceInfo = serde_json::from_str(r#"{"id":"inst-1"}"#).expect("parse");
        assert_eq!(info.id, "inst-1");
        assert_eq!(info.status, "");
    }
}
