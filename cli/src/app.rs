//! Top-level flow wiring: config, transports, provider construction, and
//! the interrupt flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::cli::Cli;
use crate::config::ProviderConfig;
use crate::engine::graph::format_dependency_graph;
use crate::exec::ssh::SshSession;
use crate::manifest::DEFAULT_MANIFEST_RELPATH;
use crate::orchestrator::{self, OrchestratorOptions};
use crate::output::Console;
use crate::providers::{AnyProvider, ProviderKind};
use crate::tasks;

/// Spawn a SIGINT watcher. The first signal sets the flag (the scheduler
/// refuses further layers and cleanup runs through the normal error
/// path); a second signal exits immediately.
fn install_signal_handler(interrupt: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received; finishing the current layer before cleanup...");
            interrupt.store(true, Ordering::Relaxed);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nSecond interrupt; exiting now");
            std::process::exit(130);
        }
    });
}

fn build_provider(
    kind: ProviderKind,
    config: &ProviderConfig,
    ssh: Option<Arc<SshSession>>,
    console: Console,
) -> Result<AnyProvider> {
    Ok(match kind {
        ProviderKind::Pve => AnyProvider::Pve(crate::providers::pve::PveProvider::new(
            config, ssh, console,
        )?),
        ProviderKind::VmSnapshot => AnyProvider::VmSnapshot(
            crate::providers::vmsnap::VmSnapProvider::new(config, console)?,
        ),
        ProviderKind::Microvm => AnyProvider::MicroVm(
            crate::providers::microvm::MicroVmProvider::new(config, console)?,
        ),
    })
}

/// Run the parsed CLI command.
///
/// # Errors
///
/// Returns an error on configuration problems or any run failure.
pub async fn run(cli: Cli) -> Result<()> {
    let console = Console::new(cli.quiet);

    if cli.print_deps {
        let registry = if cli.update {
            tasks::update_registry()?
        } else {
            tasks::full_registry()?
        };
        let graph = format_dependency_graph(&registry);
        if !graph.is_empty() {
            console.always(&graph);
        }
        return Ok(());
    }

    let base_template = cli
        .base_template
        .clone()
        .context("--base-template is required")?;
    let repo_root = cli
        .repo_root
        .canonicalize()
        .with_context(|| format!("repo root {} not found", cli.repo_root.display()))?;

    let config = ProviderConfig::from_env(cli.provider)?;
    if let Some(domain) = &config.public_domain {
        console.info(&format!(
            "Using HTTP exec via tunnel domain: port-{{port}}-{{instance-id}}.{domain}"
        ));
        match &config.ssh_host {
            Some(host) => console.info(&format!("SSH fallback enabled: {host}")),
            None => console.info("SSH fallback disabled (set SSH_HOST to enable)"),
        }
    } else if let Some(host) = &config.ssh_host {
        console.info(&format!("Using SSH host: {host}"));
    } else {
        bail!("no exec transport configured. Set PUBLIC_DOMAIN or SSH_HOST");
    }

    // One multiplexed SSH connection per run, shared by every workspace.
    let ssh_session = match &config.ssh_host {
        Some(host) => {
            console.info("Starting SSH ControlMaster for connection multiplexing...");
            Some(Arc::new(SshSession::connect(host).await?))
        }
        None => None,
    };

    let provider = build_provider(cli.provider, &config, ssh_session.clone(), console.clone())?;
    let options = OrchestratorOptions {
        base_template,
        presets: cli.preset_plans(),
        cleanup_on_failure: cli.effective_cleanup_on_failure(),
        use_git_diff: cli.effective_use_git_diff(),
        ide_provider: cli.ide_provider,
        manifest_path: repo_root.join(DEFAULT_MANIFEST_RELPATH),
        repo_root,
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    install_signal_handler(interrupt.clone());

    let result = if cli.update {
        let update_vmid = cli.update_vmid.context("--update-vmid is required")?;
        orchestrator::run_update(&provider, update_vmid, &options, &console, &interrupt).await
    } else {
        orchestrator::run_provision(&provider, &options, &console, &interrupt).await
    };

    // Tear the control socket down on every exit path.
    if let Some(session) = ssh_session {
        session.close().await;
    }
    result
}
