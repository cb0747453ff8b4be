//! Provider abstraction — a uniform lifecycle for remote workspaces across
//! the PVE LXC cluster, the VM-snapshot cloud API, and the micro-VM API.
//!
//! The traits use `async fn` directly, so cross-provider dispatch goes
//! through the [`AnyProvider`]/[`AnyHost`] enums rather than trait objects.
//! Provider-specific extras (template conversion on PVE, base snapshots on
//! micro-VM) stay on the concrete types; callers probe capability via
//! [`AnyHost::as_pve`] and friends.

pub mod microvm;
pub mod pve;
pub mod vmsnap;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use uuid::Uuid;

use crate::exec::ExecOutput;

// ── Provider identity ─────────────────────────────────────────────────────────

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Proxmox VE LXC cluster (template-based).
    Pve,
    /// VM-snapshot cloud API.
    VmSnapshot,
    /// Firecracker-style micro-VM API.
    Microvm,
}

impl ProviderKind {
    /// Prefix for `{PREFIX}_API_URL` / `{PREFIX}_API_TOKEN` env vars.
    #[must_use]
    pub fn env_prefix(self) -> &'static str {
        match self {
            Self::Pve => "PVE",
            Self::VmSnapshot => "VMSNAP",
            Self::Microvm => "MICROVM",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pve => "pve",
            Self::VmSnapshot => "vm-snapshot",
            Self::Microvm => "microvm",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Value types ───────────────────────────────────────────────────────────────

/// Resource shape applied to a cloned workspace.
#[derive(Debug, Clone, Copy)]
pub struct ResourceShape {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_size_mib: u64,
}

/// A point-in-time capture listed by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub id: String,
}

/// Result of capturing a provisioned workspace.
///
/// `template_vmid` is meaningful on PVE (the converted container's VMID);
/// VM-backed captures are addressed by `snapshot_id` alone and record 0.
#[derive(Debug, Clone)]
pub struct Capture {
    pub snapshot_id: String,
    pub template_vmid: u64,
}

/// Metadata stamped onto a capture (description/tags on PVE).
#[derive(Debug, Clone)]
pub struct CaptureMeta {
    pub snapshot_id: String,
    pub preset_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub source_id: String,
}

/// Fresh workspace hostname, e.g. `stencil-3fa9c1d2`.
#[must_use]
pub fn generate_instance_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("stencil-{}", &hex[..8])
}

/// Fresh capture id, e.g. `snapshot_ab12cd34`.
#[must_use]
pub fn generate_snapshot_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("snapshot_{}", &hex[..8])
}

// ── Port traits ───────────────────────────────────────────────────────────────

/// A running (or startable) clone of a template on which tasks execute.
///
/// Hosts are single-writer: the engine never issues `exec` against the same
/// host from overlapping layers, only from within one fan-out layer whose
/// calls are all network-bound.
#[allow(async_fn_in_trait)]
pub trait RemoteHost {
    /// Opaque workspace id (VMID or instance id).
    fn id(&self) -> String;

    /// Start a stopped workspace. No-op on providers that boot running.
    async fn start(&self) -> Result<()>;

    /// Wait until the workspace is running and its exec path answers.
    async fn wait_ready(&self, timeout: Duration) -> Result<()>;

    /// Run a shell script in the workspace.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Push a local file into the workspace (byte-exact).
    async fn push_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Graceful shutdown.
    async fn shutdown(&self) -> Result<()>;

    /// Hard stop.
    async fn stop(&self) -> Result<()>;

    /// Destroy the workspace and release provider-side resources. Idempotent.
    async fn destroy(&self) -> Result<()>;

    /// Capture the workspace: template conversion on PVE (requires the host
    /// to be stopped), snapshot on VM-backed providers.
    async fn capture(&self, meta: &CaptureMeta) -> Result<Capture>;

    /// Expose a service port and return its public URL.
    async fn expose_port(&self, port: u16, name: &str) -> Result<String>;

    /// Construct the URL for a standard service port without any API call.
    fn service_url(&self, port: u16) -> Option<String>;
}

/// A backend that can clone templates/snapshots into workspaces.
#[allow(async_fn_in_trait)]
pub trait Provider {
    type Host: RemoteHost;

    fn kind(&self) -> ProviderKind;

    /// Verify connectivity; returns a human-readable version banner.
    async fn connect_check(&self) -> Result<String>;

    /// Locality hint recorded in the manifest (node name on PVE).
    async fn node(&self) -> Result<String>;

    /// Clone `source_id` into a fresh workspace and apply `shape`.
    /// The returned host may be stopped (PVE) or already running (VM APIs).
    async fn clone_workspace(&self, source_id: &str, shape: &ResourceShape) -> Result<Self::Host>;

    async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>>;
}

// ── Enum dispatch ─────────────────────────────────────────────────────────────

/// All providers behind one concrete type.
pub enum AnyProvider {
    Pve(pve::PveProvider),
    VmSnapshot(vmsnap::VmSnapProvider),
    MicroVm(microvm::MicroVmProvider),
}

impl Provider for AnyProvider {
    type Host = AnyHost;

    fn kind(&self) -> ProviderKind {
        match self {
            Self::Pve(provider) => provider.kind(),
            Self::VmSnapshot(provider) => provider.kind(),
            Self::MicroVm(provider) => provider.kind(),
        }
    }

    async fn connect_check(&self) -> Result<String> {
        match self {
            Self::Pve(provider) => provider.connect_check().await,
            Self::VmSnapshot(provider) => provider.connect_check().await,
            Self::MicroVm(provider) => provider.connect_check().await,
        }
    }

    async fn node(&self) -> Result<String> {
        match self {
            Self::Pve(provider) => provider.node().await,
            Self::VmSnapshot(provider) => provider.node().await,
            Self::MicroVm(provider) => provider.node().await,
        }
    }

    async fn clone_workspace(&self, source_id: &str, shape: &ResourceShape) -> Result<AnyHost> {
        match self {
            Self::Pve(provider) => provider
                .clone_workspace(source_id, shape)
                .await
                .map(AnyHost::Pve),
            Self::VmSnapshot(provider) => provider
                .clone_workspace(source_id, shape)
                .await
                .map(AnyHost::VmSnapshot),
            Self::MicroVm(provider) => provider
                .clone_workspace(source_id, shape)
                .await
                .map(AnyHost::MicroVm),
        }
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>> {
        match self {
            Self::Pve(provider) => provider.list_snapshots().await,
            Self::VmSnapshot(provider) => provider.list_snapshots().await,
            Self::MicroVm(provider) => provider.list_snapshots().await,
        }
    }
}

impl AnyProvider {
    /// Capability probe used by update mode (template reuse is PVE-only).
    #[must_use]
    pub fn as_pve(&self) -> Option<&pve::PveProvider> {
        match self {
            Self::Pve(provider) => Some(provider),
            _ => None,
        }
    }
}

/// All hosts behind one concrete type; this is what the task context holds.
pub enum AnyHost {
    Pve(pve::PveHost),
    VmSnapshot(vmsnap::VmSnapHost),
    MicroVm(microvm::MicroVmHost),
}

impl AnyHost {
    /// Capability probe for PVE-only operations.
    #[must_use]
    pub fn as_pve(&self) -> Option<&pve::PveHost> {
        match self {
            Self::Pve(host) => Some(host),
            _ => None,
        }
    }
}

macro_rules! host_delegate {
    ($self:ident, $host:ident => $body:expr) => {
        match $self {
            AnyHost::Pve($host) => $body,
            AnyHost::VmSnapshot($host) => $body,
            AnyHost::MicroVm($host) => $body,
        }
    };
}

impl RemoteHost for AnyHost {
    fn id(&self) -> String {
        host_delegate!(self, host => host.id())
    }

    async fn start(&self) -> Result<()> {
        host_delegate!(self, host => host.start().await)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        host_delegate!(self, host => host.wait_ready(timeout).await)
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        host_delegate!(self, host => host.exec(command, timeout).await)
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<()> {
        host_delegate!(self, host => host.push_file(local, remote).await)
    }

    async fn shutdown(&self) -> Result<()> {
        host_delegate!(self, host => host.shutdown().await)
    }

    async fn stop(&self) -> Result<()> {
        host_delegate!(self, host => host.stop().await)
    }

    async fn destroy(&self) -> Result<()> {
        host_delegate!(self, host => host.destroy().await)
    }

    async fn capture(&self, meta: &CaptureMeta) -> Result<Capture> {
        host_delegate!(self, host => host.capture(meta).await)
    }

    async fn expose_port(&self, port: u16, name: &str) -> Result<String> {
        host_delegate!(self, host => host.expose_port(port, name).await)
    }

    fn service_url(&self, port: u16) -> Option<String> {
        host_delegate!(self, host => host.service_url(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_prefixes() {
        assert_eq!(ProviderKind::Pve.env_prefix(), "PVE");
        assert_eq!(ProviderKind::VmSnapshot.env_prefix(), "VMSNAP");
        assert_eq!(ProviderKind::Microvm.env_prefix(), "MICROVM");
    }

    #[test]
    fn test_generate_instance_id_shape() {
        let id = generate_instance_id();
        assert!(id.starts_with("stencil-"));
        assert_eq!(id.len(), "stencil-".len() + 8);
    }

    #[test]
    fn test_generate_snapshot_id_shape() {
        let id = generate_snapshot_id();
        assert!(id.starts_with("snapshot_"));
        assert_eq!(id.len(), "snapshot_".len() + 8);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_snapshot_id(), generate_snapshot_id());
    }
}
