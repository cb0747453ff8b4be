//! The provisioning task registries.
//!
//! Two registries ship: the **full** registry installs the complete
//! toolchain and application stack from a bare base image; the **update**
//! registry skips one-time installs and only refreshes what the
//! repository produces (builds, configs, extensions). The orchestrator
//! probes the workspace and falls back to the full registry when any
//! expected toolchain is absent.

mod checks;
mod ide;
mod services;
mod toolchains;
mod workspace;

use crate::engine::context::TaskContext;
use crate::engine::{Task, TaskRegistry};
use crate::error::EngineError;

/// Registry specialized to the provisioning context.
pub type ProvisionRegistry = TaskRegistry<TaskContext>;

/// Task specialized to the provisioning context.
pub type ProvisionTask = Task<TaskContext>;

fn build(tasks: Vec<ProvisionTask>) -> Result<ProvisionRegistry, EngineError> {
    let mut registry = ProvisionRegistry::new();
    for task in tasks {
        registry.register(task)?;
    }
    Ok(registry)
}

/// Install-from-scratch registry.
///
/// # Errors
///
/// Returns [`EngineError::DuplicateTask`] if the static task list is
/// inconsistent.
pub fn full_registry() -> Result<ProvisionRegistry, EngineError> {
    build(vec![
        ProvisionTask {
            name: "apt-bootstrap",
            deps: &[],
            description: "Install core apt utilities and set up package sources",
            body: toolchains::apt_bootstrap,
        },
        ProvisionTask {
            name: "install-base-packages",
            deps: &["apt-bootstrap"],
            description: "Install build-essential tooling and utilities",
            body: toolchains::install_base_packages,
        },
        ProvisionTask {
            name: "ensure-docker",
            deps: &["install-base-packages"],
            description: "Install Docker engine and CLI plugins",
            body: toolchains::ensure_docker,
        },
        ProvisionTask {
            name: "install-node-runtime",
            deps: &["install-base-packages"],
            description: "Install Node.js runtime and pnpm via corepack",
            body: toolchains::install_node_runtime,
        },
        ProvisionTask {
            name: "install-nvm",
            deps: &["install-node-runtime"],
            description: "Install nvm for runtime use",
            body: toolchains::install_nvm,
        },
        ProvisionTask {
            name: "install-bun",
            deps: &["install-base-packages"],
            description: "Install Bun runtime (background download to dodge gateway timeouts)",
            body: toolchains::install_bun,
        },
        ProvisionTask {
            name: "install-go-toolchain",
            deps: &["install-base-packages"],
            description: "Install Go toolchain for building workspace helpers",
            body: toolchains::install_go_toolchain,
        },
        ProvisionTask {
            name: "install-uv-python",
            deps: &["ensure-docker"],
            description: "Install uv CLI and provision the default Python runtime",
            body: toolchains::install_uv_python,
        },
        ProvisionTask {
            name: "install-rust-toolchain",
            deps: &["install-base-packages"],
            description: "Install Rust toolchain via rustup",
            body: toolchains::install_rust_toolchain,
        },
        ProvisionTask {
            name: "install-openvscode",
            deps: &["apt-bootstrap"],
            description: "Install OpenVSCode server",
            body: ide::install_openvscode,
        },
        ProvisionTask {
            name: "install-coder",
            deps: &["apt-bootstrap"],
            description: "Install Coder (code-server)",
            body: ide::install_coder,
        },
        ProvisionTask {
            name: "install-cmux-code",
            deps: &["apt-bootstrap", "restart-execd-early"],
            description: "Install Cmux Code (VS Code fork with OpenVSIX)",
            body: ide::install_cmux_code,
        },
        ProvisionTask {
            name: "upload-repo",
            deps: &["apt-bootstrap"],
            description: "Upload the repository into the workspace",
            body: workspace::upload_repo,
        },
        ProvisionTask {
            name: "install-repo-dependencies",
            deps: &["upload-repo", "install-bun", "install-node-runtime"],
            description: "Install workspace dependencies via bun",
            body: workspace::install_repo_dependencies,
        },
        ProvisionTask {
            name: "package-vscode-extension",
            deps: &["install-repo-dependencies", "restart-execd-early"],
            description: "Package the workspace VS Code extension for installation",
            body: ide::package_vscode_extension,
        },
        ProvisionTask {
            name: "install-ide-extensions",
            deps: &[
                "install-openvscode",
                "install-coder",
                "install-cmux-code",
                "package-vscode-extension",
                "restart-execd-early",
            ],
            description: "Preinstall language extensions for the IDE",
            body: ide::install_ide_extensions,
        },
        ProvisionTask {
            name: "install-global-cli",
            deps: &["install-bun", "install-node-runtime"],
            description: "Install global agent CLIs with bun",
            body: ide::install_global_cli,
        },
        ProvisionTask {
            name: "configure-zsh",
            deps: &["upload-repo", "install-base-packages"],
            description: "Install zsh configuration and default prompt",
            body: workspace::configure_zsh,
        },
        ProvisionTask {
            name: "install-service-scripts",
            deps: &["upload-repo", "install-base-packages"],
            description: "Install VNC startup script (includes Chrome DevTools)",
            body: workspace::install_service_scripts,
        },
        ProvisionTask {
            name: "build-cdp-proxy",
            deps: &["install-go-toolchain", "upload-repo"],
            description: "Build the Chrome DevTools proxy",
            body: services::build_cdp_proxy,
        },
        ProvisionTask {
            name: "build-execd",
            deps: &["install-go-toolchain", "upload-repo"],
            description: "Build the exec daemon",
            body: services::build_execd,
        },
        ProvisionTask {
            name: "restart-execd-early",
            deps: &["build-execd"],
            description: "Restart the exec daemon so later tasks use the fresh build",
            body: services::restart_execd_early,
        },
        ProvisionTask {
            name: "build-worker-daemon",
            deps: &["install-go-toolchain", "upload-repo"],
            description: "Build the Go worker daemon (SSH/PTY proxy)",
            body: services::build_worker_daemon,
        },
        ProvisionTask {
            name: "build-worker",
            deps: &["install-repo-dependencies"],
            description: "Bundle the worker service",
            body: services::build_worker,
        },
        ProvisionTask {
            name: "build-rust-binaries",
            deps: &["install-rust-toolchain", "upload-repo"],
            description: "Build workspace Rust binaries",
            body: services::build_rust_binaries,
        },
        ProvisionTask {
            name: "link-rust-binaries",
            deps: &["build-rust-binaries"],
            description: "Link workspace Rust binaries into PATH",
            body: services::link_rust_binaries,
        },
        ProvisionTask {
            name: "install-systemd-units",
            deps: &[
                "build-worker",
                "build-worker-daemon",
                "build-cdp-proxy",
                "install-service-scripts",
            ],
            description: "Install and enable workspace systemd units",
            body: services::install_systemd_units,
        },
        ProvisionTask {
            name: "cleanup-build-artifacts",
            deps: &[
                "install-ide-extensions",
                "install-systemd-units",
                "install-global-cli",
                "configure-zsh",
                "install-nvm",
                "install-uv-python",
                "link-rust-binaries",
            ],
            description: "Remove caches and build intermediates before capture",
            body: services::cleanup_build_artifacts,
        },
        ProvisionTask {
            name: "check-cargo",
            deps: &["install-rust-toolchain", "cleanup-build-artifacts"],
            description: "Verify cargo answers",
            body: checks::check_cargo,
        },
        ProvisionTask {
            name: "check-node",
            deps: &["install-node-runtime", "cleanup-build-artifacts"],
            description: "Verify node answers",
            body: checks::check_node,
        },
        ProvisionTask {
            name: "check-bun",
            deps: &["install-bun", "cleanup-build-artifacts"],
            description: "Verify bun answers",
            body: checks::check_bun,
        },
        ProvisionTask {
            name: "check-uv",
            deps: &["install-uv-python", "cleanup-build-artifacts"],
            description: "Verify uv answers",
            body: checks::check_uv,
        },
        ProvisionTask {
            name: "check-gh",
            deps: &["install-base-packages", "cleanup-build-artifacts"],
            description: "Verify the GitHub CLI answers",
            body: checks::check_gh,
        },
        ProvisionTask {
            name: "check-systemd-services",
            deps: &["install-systemd-units", "cleanup-build-artifacts"],
            description: "Verify workspace services are enabled",
            body: checks::check_systemd_services,
        },
    ])
}

/// Update-mode registry: refresh what the repository produces, skip
/// one-time toolchain installs.
///
/// # Errors
///
/// Returns [`EngineError::DuplicateTask`] if the static task list is
/// inconsistent.
pub fn update_registry() -> Result<ProvisionRegistry, EngineError> {
    build(vec![
        ProvisionTask {
            name: "upload-repo",
            deps: &[],
            description: "Upload the repository into the workspace",
            body: workspace::upload_repo,
        },
        ProvisionTask {
            name: "install-repo-dependencies",
            deps: &["upload-repo"],
            description: "Install workspace dependencies via bun",
            body: workspace::install_repo_dependencies,
        },
        ProvisionTask {
            name: "package-vscode-extension",
            deps: &["install-repo-dependencies", "restart-execd-early"],
            description: "Package the workspace VS Code extension for installation",
            body: ide::package_vscode_extension,
        },
        ProvisionTask {
            name: "install-ide-extensions",
            deps: &["package-vscode-extension", "restart-execd-early"],
            description: "Preinstall language extensions for the IDE",
            body: ide::install_ide_extensions,
        },
        ProvisionTask {
            name: "configure-zsh",
            deps: &["upload-repo"],
            description: "Install zsh configuration and default prompt",
            body: workspace::configure_zsh,
        },
        ProvisionTask {
            name: "install-service-scripts",
            deps: &["upload-repo"],
            description: "Install VNC startup script (includes Chrome DevTools)",
            body: workspace::install_service_scripts,
        },
        ProvisionTask {
            name: "build-cdp-proxy",
            deps: &["upload-repo"],
            description: "Build the Chrome DevTools proxy",
            body: services::build_cdp_proxy,
        },
        ProvisionTask {
            name: "build-execd",
            deps: &["upload-repo"],
            description: "Build the exec daemon",
            body: services::build_execd,
        },
        ProvisionTask {
            name: "restart-execd-early",
            deps: &["build-execd"],
            description: "Restart the exec daemon so later tasks use the fresh build",
            body: services::restart_execd_early,
        },
        ProvisionTask {
            name: "build-worker-daemon",
            deps: &["upload-repo"],
            description: "Build the Go worker daemon (SSH/PTY proxy)",
            body: services::build_worker_daemon,
        },
        ProvisionTask {
            name: "build-worker",
            deps: &["install-repo-dependencies"],
            description: "Bundle the worker service",
            body: services::build_worker,
        },
        ProvisionTask {
            name: "build-rust-binaries",
            deps: &["upload-repo"],
            description: "Build workspace Rust binaries",
            body: services::build_rust_binaries,
        },
        ProvisionTask {
            name: "link-rust-binaries",
            deps: &["build-rust-binaries"],
            description: "Link workspace Rust binaries into PATH",
            body: services::link_rust_binaries,
        },
        ProvisionTask {
            name: "install-systemd-units",
            deps: &[
                "build-worker",
                "build-worker-daemon",
                "build-cdp-proxy",
                "install-service-scripts",
            ],
            description: "Install and enable workspace systemd units",
            body: services::install_systemd_units,
        },
        ProvisionTask {
            name: "cleanup-build-artifacts",
            deps: &[
                "install-ide-extensions",
                "install-systemd-units",
                "configure-zsh",
                "link-rust-binaries",
            ],
            description: "Remove caches and build intermediates before capture",
            body: services::cleanup_build_artifacts,
        },
        ProvisionTask {
            name: "check-cargo",
            deps: &["cleanup-build-artifacts"],
            description: "Verify cargo answers",
            body: checks::check_cargo,
        },
        ProvisionTask {
            name: "check-node",
            deps: &["cleanup-build-artifacts"],
            description: "Verify node answers",
            body: checks::check_node,
        },
        ProvisionTask {
            name: "check-bun",
            deps: &["cleanup-build-artifacts"],
            description: "Verify bun answers",
            body: checks::check_bun,
        },
        ProvisionTask {
            name: "check-systemd-services",
            deps: &["install-systemd-units", "cleanup-build-artifacts"],
            description: "Verify workspace services are enabled",
            body: checks::check_systemd_services,
        },
    ])
}
