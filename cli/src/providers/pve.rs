//! Proxmox VE LXC backend.
//!
//! Workspaces are LXC containers cloned from templates; captures convert
//! the provisioned container back into a template so the next run can
//! linked-clone from it. The API client talks to the PVE REST API with
//! token auth; exec goes through the shared transport router (HTTP exec
//! daemon preferred, `ssh` + `pct exec` fallback).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::OnceCell;

use super::{
    generate_instance_id, Capture, CaptureMeta, Provider, ProviderKind, RemoteHost, ResourceShape,
    SnapshotHandle,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::exec::http::{exec_url, HttpExecClient};
use crate::exec::router::{ExecRouter, SshLink};
use crate::exec::ssh::{SshSession, SshTarget};
use crate::exec::ExecOutput;
use crate::output::Console;

/// Workspace VMIDs are allocated upward from here.
pub const CLONE_BASE_VMID: u64 = 9000;

const API_TIMEOUT: Duration = Duration::from_secs(60);
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const PUSH_TIMEOUT: Duration = Duration::from_secs(300);

// ── Pure helpers ──────────────────────────────────────────────────────────────

/// Host id used in exec URLs: the container hostname, normalized.
#[must_use]
pub fn normalize_host_id(hostname: &str) -> String {
    hostname.trim().to_lowercase().replace('_', "-")
}

/// Current rootfs size in GiB from a PVE config string like
/// `local-lvm:vm-9000-disk-0,size=8G`.
#[must_use]
pub fn parse_rootfs_size_gb(rootfs: &str) -> f64 {
    for part in rootfs.split(',') {
        if let Some(size) = part.strip_prefix("size=") {
            if let Some(gb) = size.strip_suffix('G') {
                return gb.parse().unwrap_or(0.0);
            }
            if let Some(mb) = size.strip_suffix('M') {
                return mb.parse::<f64>().unwrap_or(0.0) / 1024.0;
            }
        }
    }
    0.0
}

/// Tags stamped onto captured templates, e.g. `cmux;preset-4vcpu-8gb-32gb`.
#[must_use]
pub fn build_template_tags(preset_id: Option<&str>) -> String {
    let mut tags = vec!["cmux".to_string()];
    if let Some(preset_id) = preset_id {
        tags.push(format!("preset-{}", preset_id.replace('_', "-")));
    }
    tags.join(";")
}

/// Human-readable template description recorded in the container config.
#[must_use]
pub fn build_template_description(meta: &CaptureMeta, hostname: &str) -> String {
    let preset = meta.preset_id.as_deref().unwrap_or("unknown");
    format!(
        "cmux template snapshot\nsnapshotId: {}\npresetId: {preset}\ncapturedAt: {}\nsourceVmid: {}\nhostname: {hostname}",
        meta.snapshot_id,
        meta.captured_at.format("%Y-%m-%dT%H:%M:%SZ"),
        meta.source_id,
    )
}

// ── API client ────────────────────────────────────────────────────────────────

/// Proxmox VE API client for LXC container management.
pub struct PveClient {
    http: reqwest::Client,
    api_url: String,
    token_id: String,
    token_secret: String,
    preferred_node: Option<String>,
    node: OnceCell<String>,
}

impl PveClient {
    /// Build a client from an API URL and a `user@realm!tokenid=secret`
    /// token.
    ///
    /// # Errors
    ///
    /// Returns an error when the token does not match the expected format.
    pub fn new(api_url: &str, api_token: &str, preferred_node: Option<String>) -> Result<Self> {
        let Some((token_id, token_secret)) = api_token.split_once('=') else {
            bail!("invalid PVE API token format, expected 'user@realm!tokenid=secret'");
        };
        // PVE clusters commonly run self-signed certificates.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(API_TIMEOUT)
            .build()
            .context("building PVE HTTP client")?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token_id: token_id.to_string(),
            token_secret: token_secret.to_string(),
            preferred_node,
            node: OnceCell::new(),
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<Value> {
        let url = format!("{}{path}", self.api_url);
        let mut request = self.http.request(method, &url).header(
            "Authorization",
            format!("PVEAPIToken={}={}", self.token_id, self.token_secret),
        );
        if let Some(form) = form {
            request = request.form(form);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let mut excerpt = body;
            excerpt.truncate(500);
            return Err(ProviderError::Api {
                provider: "pve",
                status: status.as_u16(),
                body: excerpt,
            }
            .into());
        }
        let value: Value =
            serde_json::from_str(&body).with_context(|| format!("parsing response of {url}"))?;
        Ok(value.get("data").cloned().unwrap_or(Value::Null))
    }

    /// PVE version string, e.g. `8.2.4`.
    pub async fn version(&self) -> Result<String> {
        let data = self
            .request(reqwest::Method::GET, "/api2/json/version", None)
            .await?;
        Ok(data
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    /// Target node, auto-detected from the cluster when not configured.
    pub async fn node(&self) -> Result<String> {
        let node = self
            .node
            .get_or_try_init(|| async {
                if let Some(preferred) = &self.preferred_node {
                    return Ok::<String, anyhow::Error>(preferred.clone());
                }
                let nodes = self
                    .request(reqwest::Method::GET, "/api2/json/nodes", None)
                    .await?;
                let first = nodes
                    .as_array()
                    .and_then(|list| list.first())
                    .and_then(|entry| entry.get("node"))
                    .and_then(Value::as_str)
                    .context("no nodes found in PVE cluster")?;
                Ok(first.to_string())
            })
            .await?;
        Ok(node.clone())
    }

    pub async fn list_lxc(&self) -> Result<Vec<Value>> {
        let node = self.node().await?;
        let data = self
            .request(reqwest::Method::GET, &format!("/api2/json/nodes/{node}/lxc"), None)
            .await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    async fn list_qemu(&self) -> Result<Vec<Value>> {
        let node = self.node().await?;
        let data = self
            .request(
                reqwest::Method::GET,
                &format!("/api2/json/nodes/{node}/qemu"),
                None,
            )
            .await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    pub async fn lxc_status(&self, vmid: u64) -> Result<Value> {
        let node = self.node().await?;
        self.request(
            reqwest::Method::GET,
            &format!("/api2/json/nodes/{node}/lxc/{vmid}/status/current"),
            None,
        )
        .await
    }

    pub async fn lxc_config(&self, vmid: u64) -> Result<Value> {
        let node = self.node().await?;
        self.request(
            reqwest::Method::GET,
            &format!("/api2/json/nodes/{node}/lxc/{vmid}/config"),
            None,
        )
        .await
    }

    /// Clone a container; linked by default. Returns the task UPID.
    pub async fn clone_lxc(
        &self,
        source_vmid: u64,
        new_vmid: u64,
        hostname: &str,
        full: bool,
    ) -> Result<String> {
        let node = self.node().await?;
        let form = [
            ("newid", new_vmid.to_string()),
            ("full", if full { "1" } else { "0" }.to_string()),
            ("hostname", hostname.to_string()),
        ];
        let data = self
            .request(
                reqwest::Method::POST,
                &format!("/api2/json/nodes/{node}/lxc/{source_vmid}/clone"),
                Some(&form),
            )
            .await?;
        Ok(data.as_str().unwrap_or_default().to_string())
    }

    async fn lifecycle(&self, vmid: u64, action: &str) -> Result<String> {
        let node = self.node().await?;
        let data = self
            .request(
                reqwest::Method::POST,
                &format!("/api2/json/nodes/{node}/lxc/{vmid}/status/{action}"),
                None,
            )
            .await?;
        Ok(data.as_str().unwrap_or_default().to_string())
    }

    pub async fn start_lxc(&self, vmid: u64) -> Result<String> {
        self.lifecycle(vmid, "start").await
    }

    pub async fn stop_lxc(&self, vmid: u64) -> Result<String> {
        self.lifecycle(vmid, "stop").await
    }

    pub async fn shutdown_lxc(&self, vmid: u64) -> Result<String> {
        self.lifecycle(vmid, "shutdown").await
    }

    pub async fn delete_lxc(&self, vmid: u64) -> Result<String> {
        let node = self.node().await?;
        let data = self
            .request(
                reqwest::Method::DELETE,
                &format!("/api2/json/nodes/{node}/lxc/{vmid}"),
                None,
            )
            .await?;
        Ok(data.as_str().unwrap_or_default().to_string())
    }

    /// Update container configuration; only the provided fields change.
    pub async fn set_lxc_config(
        &self,
        vmid: u64,
        cores: Option<u32>,
        memory_mib: Option<u64>,
        description: Option<&str>,
        tags: Option<&str>,
    ) -> Result<()> {
        let mut form: Vec<(&str, String)> = Vec::new();
        if let Some(cores) = cores {
            form.push(("cores", cores.to_string()));
        }
        if let Some(memory) = memory_mib {
            form.push(("memory", memory.to_string()));
        }
        if let Some(description) = description {
            form.push(("description", description.to_string()));
        }
        if let Some(tags) = tags {
            form.push(("tags", tags.to_string()));
        }
        if form.is_empty() {
            return Ok(());
        }
        let node = self.node().await?;
        self.request(
            reqwest::Method::PUT,
            &format!("/api2/json/nodes/{node}/lxc/{vmid}/config"),
            Some(&form),
        )
        .await?;
        Ok(())
    }

    /// Resize a disk (e.g. `rootfs` to `32G`). Returns the task UPID.
    pub async fn resize_disk(&self, vmid: u64, disk: &str, size: &str) -> Result<String> {
        let node = self.node().await?;
        let form = [("disk", disk.to_string()), ("size", size.to_string())];
        let data = self
            .request(
                reqwest::Method::PUT,
                &format!("/api2/json/nodes/{node}/lxc/{vmid}/resize"),
                Some(&form),
            )
            .await?;
        Ok(data.as_str().unwrap_or_default().to_string())
    }

    pub async fn list_snapshots(&self, vmid: u64) -> Result<Vec<Value>> {
        let node = self.node().await?;
        let data = self
            .request(
                reqwest::Method::GET,
                &format!("/api2/json/nodes/{node}/lxc/{vmid}/snapshot"),
                None,
            )
            .await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    /// Convert a stopped container into an immutable template.
    pub async fn convert_to_template(&self, vmid: u64) -> Result<()> {
        let node = self.node().await?;
        self.request(
            reqwest::Method::POST,
            &format!("/api2/json/nodes/{node}/lxc/{vmid}/template"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn task_status(&self, upid: &str) -> Result<Value> {
        let node = self.node().await?;
        let encoded: String = upid
            .bytes()
            .flat_map(|byte| {
                if byte.is_ascii_alphanumeric() || b"-_.~".contains(&byte) {
                    format!("{}", byte as char).into_bytes()
                } else {
                    format!("%{byte:02X}").into_bytes()
                }
            })
            .map(char::from)
            .collect();
        self.request(
            reqwest::Method::GET,
            &format!("/api2/json/nodes/{node}/tasks/{encoded}/status"),
            None,
        )
        .await
    }

    /// Poll a task UPID until it stops.
    ///
    /// # Errors
    ///
    /// Returns an error when the task finishes non-OK or the deadline
    /// passes.
    pub async fn await_task(&self, upid: &str, timeout: Duration) -> Result<()> {
        if upid.is_empty() {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.task_status(upid).await?;
            if status.get("status").and_then(Value::as_str) == Some("stopped") {
                let exit = status
                    .get("exitstatus")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if exit == "OK" {
                    return Ok(());
                }
                return Err(ProviderError::TaskFailed {
                    provider: "pve",
                    detail: exit.to_string(),
                }
                .into());
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("PVE task {upid} timed out after {}s", timeout.as_secs());
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    /// First free VMID at or above `start`, skipping LXC and QEMU ids.
    pub async fn find_next_vmid(&self, start: u64) -> Result<u64> {
        let mut used: Vec<u64> = self
            .list_lxc()
            .await?
            .iter()
            .filter_map(|entry| entry.get("vmid").and_then(Value::as_u64))
            .collect();
        if let Ok(vms) = self.list_qemu().await {
            used.extend(
                vms.iter()
                    .filter_map(|entry| entry.get("vmid").and_then(Value::as_u64)),
            );
        }
        let mut vmid = start;
        while used.contains(&vmid) {
            vmid += 1;
        }
        Ok(vmid)
    }
}

// ── Provider ──────────────────────────────────────────────────────────────────

pub struct PveProvider {
    client: Arc<PveClient>,
    public_domain: Option<String>,
    ssh: Option<Arc<SshSession>>,
    console: Console,
}

impl PveProvider {
    /// # Errors
    ///
    /// Returns an error when the API token is malformed.
    pub fn new(
        config: &ProviderConfig,
        ssh: Option<Arc<SshSession>>,
        console: Console,
    ) -> Result<Self> {
        let client = PveClient::new(&config.api_url, &config.api_token, config.node.clone())?;
        Ok(Self {
            client: Arc::new(client),
            public_domain: config.public_domain.clone(),
            ssh,
            console,
        })
    }

    #[must_use]
    pub fn client(&self) -> &Arc<PveClient> {
        &self.client
    }

    /// Wrap an existing container as a host handle (used by update mode).
    ///
    /// # Errors
    ///
    /// Returns an error when the container config cannot be read.
    pub async fn attach(&self, vmid: u64) -> Result<PveHost> {
        let config = self.client.lxc_config(vmid).await?;
        let hostname = config
            .get("hostname")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(self.host(vmid, hostname))
    }

    fn host(&self, vmid: u64, hostname: String) -> PveHost {
        PveHost::new(
            vmid,
            hostname,
            self.client.clone(),
            self.public_domain.clone(),
            self.ssh.clone(),
            self.console.clone(),
        )
    }

    /// Clone with linked mode first and a full-clone fallback.
    async fn clone_with_fallback(
        &self,
        source_vmid: u64,
        new_vmid: u64,
        hostname: &str,
    ) -> Result<()> {
        self.console.info(&format!(
            "Linked-cloning template {source_vmid} to new container {new_vmid}..."
        ));
        let linked = async {
            let upid = self
                .client
                .clone_lxc(source_vmid, new_vmid, hostname, false)
                .await?;
            self.client.await_task(&upid, Duration::from_secs(300)).await
        }
        .await;
        match linked {
            Ok(()) => {
                self.console
                    .info(&format!("Linked clone complete: {source_vmid} -> {new_vmid}"));
                Ok(())
            }
            Err(err) => {
                self.console.warn(&format!(
                    "Linked clone failed ({err}), falling back to full clone..."
                ));
                let upid = self
                    .client
                    .clone_lxc(source_vmid, new_vmid, hostname, true)
                    .await?;
                self.client.await_task(&upid, Duration::from_secs(600)).await?;
                self.console
                    .info(&format!("Full clone complete: {source_vmid} -> {new_vmid}"));
                Ok(())
            }
        }
    }
}

impl Provider for PveProvider {
    type Host = PveHost;

    fn kind(&self) -> ProviderKind {
        ProviderKind::Pve
    }

    async fn connect_check(&self) -> Result<String> {
        let version = self.client.version().await?;
        Ok(format!("Proxmox VE v{version}"))
    }

    async fn node(&self) -> Result<String> {
        self.client.node().await
    }

    async fn clone_workspace(&self, source_id: &str, shape: &ResourceShape) -> Result<PveHost> {
        let source_vmid: u64 = source_id
            .parse()
            .with_context(|| format!("PVE source id must be a numeric VMID, got '{source_id}'"))?;
        let new_vmid = self.client.find_next_vmid(CLONE_BASE_VMID).await?;
        let hostname = generate_instance_id();

        self.clone_with_fallback(source_vmid, new_vmid, &hostname)
            .await?;

        // Zero means "inherit from the source template" (update mode).
        if shape.vcpus > 0 || shape.memory_mib > 0 {
            self.console.info(&format!(
                "Configuring container {new_vmid} with {} cores, {}MB RAM...",
                shape.vcpus, shape.memory_mib
            ));
            self.client
                .set_lxc_config(
                    new_vmid,
                    (shape.vcpus > 0).then_some(shape.vcpus),
                    (shape.memory_mib > 0).then_some(shape.memory_mib),
                    None,
                    None,
                )
                .await?;
        }

        let config = self.client.lxc_config(new_vmid).await?;
        let rootfs = config
            .get("rootfs")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let current_gb = parse_rootfs_size_gb(rootfs);
        let target_gb = shape.disk_size_mib / 1024;
        #[allow(clippy::cast_precision_loss)]
        if target_gb as f64 > current_gb {
            self.console.info(&format!(
                "Resizing disk for container {new_vmid} to {target_gb}GB (current: {current_gb}GB)..."
            ));
            // The clone has not been started yet, so the volume is free.
            let upid = self
                .client
                .resize_disk(new_vmid, "rootfs", &format!("{target_gb}G"))
                .await?;
            self.client.await_task(&upid, Duration::from_secs(300)).await?;
        } else {
            self.console.info(&format!(
                "Disk size {current_gb}GB is sufficient for target {target_gb}GB"
            ));
        }

        Ok(self.host(new_vmid, hostname))
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>> {
        let containers = self.client.list_lxc().await?;
        Ok(containers
            .iter()
            .filter(|entry| entry.get("template").and_then(Value::as_u64) == Some(1))
            .filter_map(|entry| entry.get("vmid").and_then(Value::as_u64))
            .map(|vmid| SnapshotHandle {
                id: vmid.to_string(),
            })
            .collect())
    }
}

// ── Host ──────────────────────────────────────────────────────────────────────

pub struct PveHost {
    vmid: u64,
    hostname: String,
    client: Arc<PveClient>,
    router: ExecRouter,
    console: Console,
    public_domain: Option<String>,
}

impl PveHost {
    #[must_use]
    pub fn new(
        vmid: u64,
        hostname: String,
        client: Arc<PveClient>,
        public_domain: Option<String>,
        ssh: Option<Arc<SshSession>>,
        console: Console,
    ) -> Self {
        let http = public_domain
            .as_ref()
            .filter(|_| !hostname.is_empty())
            .map(|domain| HttpExecClient::new(exec_url(domain, &normalize_host_id(&hostname))));
        let ssh = ssh.map(|session| SshLink {
            session,
            target: SshTarget::Container { vmid },
        });
        Self {
            vmid,
            hostname,
            client,
            router: ExecRouter::new(http, ssh),
            console,
            public_domain,
        }
    }

    #[must_use]
    pub fn vmid(&self) -> u64 {
        self.vmid
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Whether the container is flagged as a template in its config.
    ///
    /// # Errors
    ///
    /// Returns an error when the config cannot be read.
    pub async fn is_template(&self) -> Result<bool> {
        let config = self.client.lxc_config(self.vmid).await?;
        Ok(config.get("template").and_then(Value::as_u64) == Some(1))
    }
}

impl RemoteHost for PveHost {
    fn id(&self) -> String {
        self.vmid.to_string()
    }

    async fn start(&self) -> Result<()> {
        let upid = self.client.start_lxc(self.vmid).await?;
        self.client.await_task(&upid, Duration::from_secs(120)).await
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        self.console
            .info(&format!("Waiting for container {} to be ready...", self.vmid));
        let mut elapsed = Duration::ZERO;
        let mut running = false;
        while elapsed < timeout {
            let status = self.client.lxc_status(self.vmid).await?;
            if status.get("status").and_then(Value::as_str) == Some("running") {
                if !running {
                    running = true;
                    self.console.info(&format!(
                        "Container {} is running, waiting for services...",
                        self.vmid
                    ));
                }
                if self.router.has_http() {
                    if let Ok(output) = self
                        .router
                        .exec("echo ready", Duration::from_secs(10))
                        .await
                    {
                        if output.success() && output.stdout.contains("ready") {
                            self.console
                                .info(&format!("Container {} is ready (HTTP exec)", self.vmid));
                            return Ok(());
                        }
                    }
                    if !elapsed.is_zero() && elapsed.as_secs() % 30 == 0 {
                        self.console.info(&format!(
                            "Still waiting for the exec daemon on container {}... ({}s)",
                            self.vmid,
                            elapsed.as_secs()
                        ));
                    }
                } else {
                    // No exec daemon URL configured; the API status is the
                    // best readiness signal available.
                    self.console
                        .info(&format!("Container {} is running (API verified)", self.vmid));
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            elapsed += Duration::from_secs(2);
        }
        bail!(
            "container {} did not become ready within {}s",
            self.vmid,
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
        let upid = self.client.shutdown_lxc(self.vmid).await?;
        self.client.await_task(&upid, Duration::from_secs(120)).await
    }

    async fn stop(&self) -> Result<()> {
        let upid = self.client.stop_lxc(self.vmid).await?;
        self.client.await_task(&upid, Duration::from_secs(120)).await
    }

    async fn destroy(&self) -> Result<()> {
        // Graceful shutdown first; a container that is already stopped or
        // gone makes these calls fail, which is fine for an idempotent
        // destroy.
        let _ = self.client.shutdown_lxc(self.vmid).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let _ = self.client.delete_lxc(self.vmid).await;
        Ok(())
    }

    async fn capture(&self, meta: &CaptureMeta) -> Result<Capture> {
        // Template conversion requires a stopped container with no
        // snapshots ("current" is the ever-present pseudo entry).
        let snapshots = self.client.list_snapshots(self.vmid).await.unwrap_or_default();
        let real: Vec<&str> = snapshots
            .iter()
            .filter_map(|entry| entry.get("name").and_then(Value::as_str))
            .filter(|name| *name != "current")
            .collect();
        if !real.is_empty() {
            bail!(
                "container {} still has snapshots ({}); template conversion requires none",
                self.vmid,
                real.join(", ")
            );
        }

        self.console
            .info(&format!("Converting container {} to template...", self.vmid));
        self.client.convert_to_template(self.vmid).await?;

        let description = build_template_description(meta, &self.hostname);
        let tags = build_template_tags(meta.preset_id.as_deref());
        self.client
            .set_lxc_config(self.vmid, None, None, Some(&description), Some(&tags))
            .await?;

        Ok(Capture {
            snapshot_id: meta.snapshot_id.clone(),
            template_vmid: self.vmid,
        })
    }

    async fn expose_port(&self, port: u16, _name: &str) -> Result<String> {
        // LXC services are published through the tunnel domain by naming
        // convention; there is no per-port API call to make.
        self.service_url(port).ok_or_else(|| {
            ProviderError::Unsupported {
                provider: "pve",
                operation: "expose_port without PUBLIC_DOMAIN",
            }
            .into()
        })
    }

    fn service_url(&self, port: u16) -> Option<String> {
        self.public_domain.as_ref().map(|domain| {
            format!(
                "https://port-{port}-{}.{domain}",
                normalize_host_id(&self.hostname)
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_host_id_lowercases_and_dashes() {
        assert_eq!(normalize_host_id(" Stencil_AB12 "), "stencil-ab12");
    }

    #[test]
    fn test_parse_rootfs_size_gigabytes() {
        assert_eq!(parse_rootfs_size_gb("local-lvm:vm-9000-disk-0,size=8G"), 8.0);
    }

    #[test]
    fn test_parse_rootfs_size_megabytes() {
        assert_eq!(parse_rootfs_size_gb("local-lvm:vm-1-disk-0,size=512M"), 0.5);
    }

    #[test]
    fn test_parse_rootfs_size_missing_defaults_to_zero() {
        assert_eq!(parse_rootfs_size_gb("local-lvm:vm-1-disk-0"), 0.0);
        assert_eq!(parse_rootfs_size_gb(""), 0.0);
    }

    #[test]
    fn test_template_tags_with_and_without_preset() {
        assert_eq!(
            build_template_tags(Some("4vcpu_8gb_32gb")),
            "cmux;preset-4vcpu-8gb-32gb"
        );
        assert_eq!(build_template_tags(None), "cmux");
    }

    #[test]
    fn test_template_description_lists_capture_facts() {
        let meta = CaptureMeta {
            snapshot_id: "snapshot_ab12cd34".to_string(),
            preset_id: Some("4vcpu_8gb_32gb".to_string()),
            captured_at: chrono::Utc.with_ymd_and_hms(2024, 11, 3, 12, 34, 56).unwrap(),
            source_id: "9000".to_string(),
        };
        let description = build_template_description(&meta, "stencil-ab12cd34");
        assert!(description.contains("snapshotId: snapshot_ab12cd34"));
        assert!(description.contains("presetId: 4vcpu_8gb_32gb"));
        assert!(description.contains("capturedAt: 2024-11-03T12:34:56Z"));
        assert!(description.contains("sourceVmid: 9000"));
        assert!(description.contains("hostname: stencil-ab12cd34"));
    }

    #[test]
    fn test_client_rejects_malformed_token() {
        let result = PveClient::new("https://pve.example.com:8006", "not-a-token", None);
        assert!(result.is_err());
    }

    #[test]
    fn test_client_splits_token_id_and_secret() {
        let client =
            PveClient::new("https://pve.example.com:8006/", "root@pam!stencil=s3cret", None)
                .expect("client");
        assert_eq!(client.token_id, "root@pam!stencil");
        assert_eq!(client.token_secret, "s3cret");
        assert_eq!(client.api_url, "https://pve.example.com:8006");
    }
}
