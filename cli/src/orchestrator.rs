//! Top-level provisioning flow.
//!
//! For each preset: clone the source template, apply the resource shape,
//! drive the task graph, verify artifacts, shut down, capture, record in
//! the manifest. Consecutive presets chain — when a preset's disk is at
//! least as large as its predecessor's, it clones the predecessor's
//! just-captured template and skips the task graph entirely.
//!
//! A preset failure does not abort later presets (they restart from the
//! base template); scheduler and manifest failures do, since nothing
//! sound can follow them. When `cleanup_on_failure` is set, workspaces
//! that failed before capture are destroyed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Timelike, Utc};

use crate::engine::context::{ContextOptions, TaskContext};
use crate::engine::graph::format_dependency_graph;
use crate::engine::run_task_graph;
use crate::error::EngineError;
use crate::ide::IdeProvider;
use crate::manifest::ManifestStore;
use crate::output::{progress, Console};
use crate::providers::{
    generate_snapshot_id, AnyHost, AnyProvider, Capture, CaptureMeta, Provider, RemoteHost,
    ResourceShape,
};
use crate::tasks::{self, ProvisionRegistry};
use crate::verify::verify_workspace;
use stencil_common::manifest::ManifestError;
use stencil_common::preset::PresetPlan;

/// How long a freshly started workspace may take to answer `echo ready`.
const READY_TIMEOUT: Duration = Duration::from_secs(180);

/// Run-level configuration assembled by the CLI.
pub struct OrchestratorOptions {
    pub base_template: String,
    pub presets: Vec<PresetPlan>,
    pub cleanup_on_failure: bool,
    pub use_git_diff: bool,
    pub ide_provider: IdeProvider,
    pub repo_root: PathBuf,
    pub manifest_path: PathBuf,
}

/// One captured preset.
pub struct PresetOutcome {
    pub plan: PresetPlan,
    pub capture: Capture,
    pub captured_at: DateTime<Utc>,
}

/// UTC now at second precision (manifest timestamps carry no fraction).
#[must_use]
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().with_nanosecond(0).unwrap_or_else(Utc::now)
}

/// Chaining decision: reuse the previous preset's template when the disk
/// does not shrink (volumes cannot shrink in place), otherwise rebuild
/// from the base template.
#[must_use]
pub fn chain_source(
    base_template: &str,
    previous: Option<&(String, u64)>,
    plan: &PresetPlan,
) -> (String, bool) {
    if let Some((template_id, disk_mib)) = previous {
        if plan.disk_size_mib >= *disk_mib {
            return (template_id.clone(), false);
        }
    }
    (base_template.to_string(), true)
}

/// Whether an error must abort the remaining presets.
#[must_use]
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<ManifestError>().is_some()
            || matches!(
                cause.downcast_ref::<EngineError>(),
                Some(EngineError::DependencyCycle(_) | EngineError::Interrupted)
            )
    })
}

/// Full provisioning run over all presets.
///
/// # Errors
///
/// Returns an error when a fatal failure occurs or any preset failed.
pub async fn run_provision(
    provider: &AnyProvider,
    options: &OrchestratorOptions,
    console: &Console,
    interrupt: &Arc<AtomicBool>,
) -> Result<()> {
    let banner = provider
        .connect_check()
        .await
        .context("connecting to the provider API")?;
    console.always(&format!("Connected to {banner}"));
    let node = provider.node().await?;
    if !node.is_empty() {
        console.always(&format!("Using node: {node}"));
    }

    let store = ManifestStore::with_path(options.manifest_path.clone());
    let base_vmid: u64 = options.base_template.parse().unwrap_or(0);
    let mut manifest = store.load(base_vmid, utc_now())?;
    manifest.base_template_vmid = base_vmid;

    console.always(&format!(
        "Starting template creation for presets {} from base template {} (IDE provider: {})",
        options
            .presets
            .iter()
            .map(|plan| plan.preset_id.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        options.base_template,
        options.ide_provider
    ));

    let mut previous: Option<(String, u64)> = None;
    let mut outcomes: Vec<PresetOutcome> = Vec::new();
    let mut failures: Vec<String> = Vec::new();

    for (index, plan) in options.presets.iter().enumerate() {
        if interrupt.load(Ordering::Relaxed) {
            return Err(EngineError::Interrupted.into());
        }

        let (source, run_tasks) = chain_source(&options.base_template, previous.as_ref(), plan);
        if !run_tasks {
            console.info(&format!(
                "Optimization: building {} from previous template {source} (skips task execution)",
                plan.label
            ));
        }

        let result = provision_preset(
            provider,
            plan,
            &source,
            run_tasks,
            index == 0 && run_tasks,
            options,
            console,
            interrupt,
        )
        .await;

        match result {
            Ok(outcome) => {
                let version = manifest.record_capture(
                    plan,
                    outcome.capture.template_vmid,
                    &outcome.capture.snapshot_id,
                    outcome.captured_at,
                    &node,
                );
                store.save(&manifest)?;
                console.success(&format!(
                    "[{}] captured as version {version} (snapshot {})",
                    plan.preset_id, outcome.capture.snapshot_id
                ));
                previous = Some((clone_source_id(&outcome.capture), plan.disk_size_mib));
                outcomes.push(outcome);
            }
            Err(err) => {
                if is_fatal(&err) {
                    return Err(err);
                }
                console.error(&format!(
                    "Provisioning preset {} failed: {err:#}",
                    plan.preset_id
                ));
                failures.push(plan.preset_id.clone());
                // Do not chain off a failure.
                previous = None;
            }
        }
    }

    print_summary(console, &store, &outcomes, &node);
    if !failures.is_empty() {
        bail!("{} preset(s) failed: {}", failures.len(), failures.join(", "));
    }
    Ok(())
}

/// How a capture is addressed when the next preset clones from it.
fn clone_source_id(capture: &Capture) -> String {
    if capture.template_vmid != 0 {
        capture.template_vmid.to_string()
    } else {
        capture.snapshot_id.clone()
    }
}

fn print_summary(
    console: &Console,
    store: &ManifestStore,
    outcomes: &[PresetOutcome],
    node: &str,
) {
    console.always(&format!("\n{}", "=".repeat(60)));
    console.always("Template Summary");
    console.always(&"=".repeat(60));
    console.always(&format!("Manifest updated: {}", store.path().display()));
    console.always("");
    for outcome in outcomes {
        console.always(&format!("Preset: {}", outcome.plan.preset_id));
        console.always(&format!("  Snapshot ID: {}", outcome.capture.snapshot_id));
        if outcome.capture.template_vmid != 0 {
            console.always(&format!("  Template VMID: {}", outcome.capture.template_vmid));
        }
        if !node.is_empty() {
            console.always(&format!("  Node: {node}"));
        }
        console.always(&format!("  Captured: {}", outcome.captured_at));
        console.always("");
    }
}

#[allow(clippy::too_many_arguments)]
async fn provision_preset(
    provider: &AnyProvider,
    plan: &PresetPlan,
    source: &str,
    run_tasks: bool,
    show_dependency_graph: bool,
    options: &OrchestratorOptions,
    console: &Console,
    interrupt: &Arc<AtomicBool>,
) -> Result<PresetOutcome> {
    console.always(&format!(
        "\n=== Provisioning preset {} ({}) ===",
        plan.preset_id, plan.label
    ));

    let shape = ResourceShape {
        vcpus: plan.vcpus,
        memory_mib: plan.memory_mib,
        disk_size_mib: plan.disk_size_mib,
    };
    let spinner = console
        .show_progress()
        .then(|| progress::spinner(&format!("Cloning {source}...")));
    let cloned = provider.clone_workspace(source, &shape).await;
    let host = match cloned {
        Ok(host) => {
            if let Some(spinner) = &spinner {
                progress::finish_success(spinner, &format!("Cloned {source}"));
            }
            Arc::new(host)
        }
        Err(err) => {
            if let Some(spinner) = &spinner {
                progress::finish_error(spinner, &format!("Clone of {source} failed"));
            }
            return Err(err);
        }
    };

    let registry = if run_tasks {
        Some(tasks::full_registry()?)
    } else {
        None
    };
    let result = provision_on_host(
        &host,
        plan,
        source,
        registry.as_ref(),
        show_dependency_graph,
        options,
        console,
        interrupt,
    )
    .await;

    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if options.cleanup_on_failure {
                console.info(&format!("Cleaning up workspace {}...", host.id()));
                let _ = host.destroy().await;
            }
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn provision_on_host(
    host: &Arc<AnyHost>,
    plan: &PresetPlan,
    source: &str,
    registry: Option<&ProvisionRegistry>,
    show_dependency_graph: bool,
    options: &OrchestratorOptions,
    console: &Console,
    interrupt: &Arc<AtomicBool>,
) -> Result<PresetOutcome> {
    if let Some(registry) = registry {
        console.info(&format!("Starting workspace {}...", host.id()));
        host.start().await?;
        host.wait_ready(READY_TIMEOUT).await?;

        let ctx = Arc::new(TaskContext::new(
            host.clone(),
            console.clone(),
            ContextOptions {
                repo_root: options.repo_root.clone(),
                ide_provider: options.ide_provider,
                use_git_diff: options.use_git_diff,
                cgroup_path: None,
                resource_profile: None,
                interrupt: interrupt.clone(),
            },
        ));
        run_task_graph(registry, &ctx).await?;

        if show_dependency_graph {
            let graph = format_dependency_graph(registry);
            if !graph.is_empty() {
                console.always("\nDependency Graph");
                console.always(&graph);
            }
        }
        let summary = ctx.timings.summary();
        if !summary.is_empty() {
            console.always("\nTiming Summary");
            for line in summary {
                console.always(&line);
            }
        }

        console.info("Verifying critical build artifacts...");
        verify_workspace(host, options.ide_provider, console).await?;

        console.info(&format!("Shutting down workspace {} for capture...", host.id()));
        host.shutdown().await?;
    }

    let captured_at = utc_now();
    let meta = CaptureMeta {
        snapshot_id: generate_snapshot_id(),
        preset_id: Some(plan.preset_id.clone()),
        captured_at,
        source_id: source.to_string(),
    };
    let capture = host.capture(&meta).await?;

    Ok(PresetOutcome {
        plan: plan.clone(),
        capture,
        captured_at,
    })
}

// ── Update mode ───────────────────────────────────────────────────────────────

/// Which toolchains answered inside the workspace.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolchainStatus {
    pub has_go: bool,
    pub has_rust: bool,
    pub has_bun: bool,
    pub has_node: bool,
}

impl ToolchainStatus {
    #[must_use]
    pub fn all_present(&self) -> bool {
        self.has_go && self.has_rust && self.has_bun && self.has_node
    }

    #[must_use]
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.has_go {
            missing.push("go");
        }
        if !self.has_rust {
            missing.push("rust");
        }
        if !self.has_bun {
            missing.push("bun");
        }
        if !self.has_node {
            missing.push("node");
        }
        missing
    }
}

/// Probe which toolchains exist in the workspace (probe failures count as
/// absent).
pub async fn detect_toolchains(host: &AnyHost) -> ToolchainStatus {
    async fn which(host: &AnyHost, binary: &str) -> bool {
        host.exec(&format!("which {binary}"), Duration::from_secs(10))
            .await
            .map(|output| output.success())
            .unwrap_or(false)
    }
    ToolchainStatus {
        has_go: which(host, "go").await,
        has_rust: which(host, "cargo").await,
        has_bun: which(host, "bun").await,
        has_node: which(host, "node").await,
    }
}

/// Update an existing template: clone it (or work in place for a plain
/// container), run the update registry, verify, and capture a new
/// template version under the source's preset.
///
/// # Errors
///
/// Returns an error when the provider is not PVE, the container is
/// missing, or any stage fails.
pub async fn run_update(
    provider: &AnyProvider,
    update_vmid: u64,
    options: &OrchestratorOptions,
    console: &Console,
    interrupt: &Arc<AtomicBool>,
) -> Result<()> {
    let Some(pve) = provider.as_pve() else {
        bail!("update mode reuses PVE templates; --provider pve is required");
    };

    let banner = provider
        .connect_check()
        .await
        .context("connecting to the provider API")?;
    console.always(&format!("Connected to {banner}"));
    let node = provider.node().await?;

    console.always(&format!("\n=== Update mode: source container {update_vmid} ==="));
    let source_host = pve
        .attach(update_vmid)
        .await
        .with_context(|| format!("container {update_vmid} not found"))?;
    let is_template = source_host.is_template().await?;

    let (host, cloned) = if is_template {
        console.always(&format!(
            "Source {update_vmid} is a template, cloning a work container..."
        ));
        let shape = ResourceShape {
            vcpus: 0,
            memory_mib: 0,
            disk_size_mib: 0,
        };
        // Shape zeros mean "inherit from the template": cores/memory stay
        // as cloned and a 0 GiB target never grows the disk.
        let work = clone_for_update(pve, update_vmid, &shape).await?;
        (Arc::new(AnyHost::Pve(work)), true)
    } else {
        console.info(&format!("Container {update_vmid} is not a template, updating in place"));
        (Arc::new(AnyHost::Pve(source_host)), false)
    };

    let result = update_on_host(&host, update_vmid, options, console, interrupt, &node).await;
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            if cloned && options.cleanup_on_failure {
                console.info(&format!("Cleaning up workspace {}...", host.id()));
                let _ = host.destroy().await;
            }
            Err(err)
        }
    }
}

async fn clone_for_update(
    pve: &crate::providers::pve::PveProvider,
    source_vmid: u64,
    shape: &ResourceShape,
) -> Result<crate::providers::pve::PveHost> {
    pve.clone_workspace(&source_vmid.to_string(), shape).await
}

async fn update_on_host(
    host: &Arc<AnyHost>,
    source_vmid: u64,
    options: &OrchestratorOptions,
    console: &Console,
    interrupt: &Arc<AtomicBool>,
    node: &str,
) -> Result<()> {
    host.start().await.or_else(|err| {
        // An already-running container rejects start; wait_ready decides.
        console.info(&format!("start skipped: {err:#}"));
        Ok::<(), anyhow::Error>(())
    })?;
    host.wait_ready(READY_TIMEOUT).await?;

    console.always("\nDetecting installed toolchains...");
    let toolchains = detect_toolchains(host).await;
    let (registry, registry_name) = if toolchains.all_present() {
        console.always("All toolchains present - using the optimized update registry");
        (tasks::update_registry()?, "Update Mode")
    } else {
        console.always(&format!(
            "Missing toolchains: {} - using the full registry to install them",
            toolchains.missing().join(", ")
        ));
        (tasks::full_registry()?, "Full Build")
    };

    let ctx = Arc::new(TaskContext::new(
        host.clone(),
        console.clone(),
        ContextOptions {
            repo_root: options.repo_root.clone(),
            ide_provider: options.ide_provider,
            use_git_diff: options.use_git_diff,
            cgroup_path: None,
            resource_profile: None,
            interrupt: interrupt.clone(),
        },
    ));
    console.always(&format!("\nRunning {registry_name} tasks..."));
    run_task_graph(&registry, &ctx).await?;

    let graph = format_dependency_graph(&registry);
    if !graph.is_empty() {
        console.always(&format!("\n{registry_name} Dependency Graph"));
        console.always(&graph);
    }
    for line in ctx.timings.summary() {
        console.always(&line);
    }

    console.info("Verifying critical build artifacts...");
    verify_workspace(host, options.ide_provider, console).await?;

    console.info(&format!("Shutting down workspace {} for capture...", host.id()));
    host.shutdown().await?;

    let store = ManifestStore::with_path(options.manifest_path.clone());
    let mut manifest = store.load(source_vmid, utc_now())?;
    let preset_id = manifest
        .find_preset_for_vmid(source_vmid)
        .map(|preset| preset.preset_id.clone());

    let captured_at = utc_now();
    let meta = CaptureMeta {
        snapshot_id: generate_snapshot_id(),
        preset_id: preset_id.clone(),
        captured_at,
        source_id: source_vmid.to_string(),
    };
    let capture = host.capture(&meta).await?;
    console.always(&format!(
        "\n=== Update complete: new template {} ===",
        capture.template_vmid
    ));

    if let Some(preset) = manifest.find_preset_for_vmid(source_vmid) {
        preset.add_version(capture.template_vmid, &capture.snapshot_id, captured_at);
        let preset_id = preset.preset_id.clone();
        manifest.updated_at = captured_at;
        manifest.node = node.to_string();
        store.save(&manifest)?;
        console.always(&format!("Manifest updated: {}", store.path().display()));
        console.always(&format!("  Preset: {preset_id}"));
        console.always(&format!("  New version with template {}", capture.template_vmid));
    } else {
        console.warn(&format!(
            "Source {source_vmid} not found in the manifest; add template {} manually if needed",
            capture.template_vmid
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(disk_mib: u64) -> PresetPlan {
        PresetPlan::new("workspace", 4, 8192, disk_mib)
    }

    #[test]
    fn test_chain_source_first_preset_uses_base() {
        let (source, run_tasks) = chain_source("9000", None, &plan(32768));
        assert_eq!(source, "9000");
        assert!(run_tasks);
    }

    #[test]
    fn test_chain_source_growing_disk_chains_from_previous() {
        let previous = ("9001".to_string(), 32768);
        let (source, run_tasks) = chain_source("9000", Some(&previous), &plan(40960));
        assert_eq!(source, "9001");
        assert!(!run_tasks, "chained preset must skip the task graph");
    }

    #[test]
    fn test_chain_source_equal_disk_still_chains() {
        let previous = ("9001".to_string(), 32768);
        let (source, run_tasks) = chain_source("9000", Some(&previous), &plan(32768));
        assert_eq!(source, "9001");
        assert!(!run_tasks);
    }

    #[test]
    fn test_chain_source_shrinking_disk_rebuilds_from_base() {
        let previous = ("9001".to_string(), 40960);
        let (source, run_tasks) = chain_source("9000", Some(&previous), &plan(32768));
        assert_eq!(source, "9000");
        assert!(run_tasks, "a smaller disk cannot reshape the previous template");
    }

    #[test]
    fn test_is_fatal_classification() {
        assert!(is_fatal(&anyhow::Error::new(EngineError::DependencyCycle(
            "a, b".to_string()
        ))));
        assert!(is_fatal(&anyhow::Error::new(EngineError::Interrupted)));
        assert!(is_fatal(&anyhow::Error::new(
            ManifestError::UnsupportedSchema { found: 9 }
        )));
        assert!(!is_fatal(&anyhow::anyhow!("task exploded")));
        assert!(!is_fatal(&anyhow::Error::new(EngineError::DuplicateTask(
            "x".to_string()
        ))));
    }

    #[test]
    fn test_toolchain_status_missing_names() {
        let status = ToolchainStatus {
            has_go: true,
            has_rust: false,
            has_bun: true,
            has_node: false,
        };
        assert!(!status.all_present());
        assert_eq!(status.missing(), vec!["rust", "node"]);
        let complete = ToolchainStatus {
            has_go: true,
            has_rust: true,
            has_bun: true,
            has_node: true,
        };
        assert!(complete.all_present());
        assert!(complete.missing().is_empty());
    }

    #[test]
    fn test_clone_source_id_prefers_template_vmid() {
        let pve = Capture {
            snapshot_id: "snapshot_aa".to_string(),
            template_vmid: 9001,
        };
        assert_eq!(clone_source_id(&pve), "9001");
        let cloud = Capture {
            snapshot_id: "snapshot_bb".to_string(),
            template_vmid: 0,
        };
        assert_eq!(clone_source_id(&cloud), "snapshot_bb");
    }

    #[test]
    fn test_utc_now_has_second_precision() {
        assert_eq!(utc_now().nanosecond(), 0);
    }
}
