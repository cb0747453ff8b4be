//! Post-provision artifact verification.
//!
//! The last gate before a workspace is captured: every artifact a healthy
//! image must carry is checked for existence, and all failures are
//! reported together. A missing artifact means a task half-completed
//! (possibly behind a truncated exec stream), so capturing would bake a
//! broken template.

use std::time::Duration;

use anyhow::Result;

use crate::error::VerifyError;
use crate::exec::shell_quote;
use crate::ide::IdeProvider;
use crate::output::Console;
use crate::providers::{AnyHost, RemoteHost};

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Marker every preinstalled workspace extension carries in its name.
pub const EXTENSION_MARKER: &str = "cmux";

/// One required artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactCheck {
    pub path: &'static str,
    pub description: &'static str,
}

/// The artifacts a healthy image must carry for `ide`.
#[must_use]
pub fn required_artifacts(ide: IdeProvider) -> Vec<ArtifactCheck> {
    let mut artifacts = vec![
        ArtifactCheck {
            path: ide.binary_path(),
            description: "IDE server binary",
        },
        ArtifactCheck {
            path: ide.extensions_dir(),
            description: "IDE extensions directory",
        },
    ];
    artifacts.extend([
        ArtifactCheck {
            path: "/root/.nvm/nvm.sh",
            description: "Node Version Manager",
        },
        ArtifactCheck {
            path: "/usr/local/cargo/bin/cargo",
            description: "Rust/Cargo",
        },
        ArtifactCheck {
            path: "/usr/local/go/bin/go",
            description: "Go toolchain",
        },
        ArtifactCheck {
            path: "/root/.bun/bin/bun",
            description: "Bun runtime",
        },
        ArtifactCheck {
            path: "/builtins/build/index.js",
            description: "worker service bundle",
        },
        ArtifactCheck {
            path: "/usr/local/bin/worker-daemon",
            description: "Go worker-daemon (SSH/PTY proxy)",
        },
        ArtifactCheck {
            path: "/usr/local/bin/cmux-token-init",
            description: "auth token generator script",
        },
    ]);
    artifacts
}

/// Existence probe for one artifact.
#[must_use]
pub fn existence_command(path: &str) -> String {
    format!(
        "test -e {} && echo exists || echo missing",
        shell_quote(path)
    )
}

/// Probe for at least one marker extension in the IDE extensions dir.
#[must_use]
pub fn extension_check_command(extensions_dir: &str) -> String {
    format!(
        "ls {} 2>/dev/null | grep -q {EXTENSION_MARKER} && echo found || echo notfound",
        shell_quote(extensions_dir)
    )
}

/// Run all artifact checks against the workspace.
///
/// # Errors
///
/// Returns [`VerifyError`] listing every missing artifact. The caller
/// must not capture the workspace on error.
pub async fn verify_workspace(
    host: &AnyHost,
    ide: IdeProvider,
    console: &Console,
) -> Result<(), VerifyError> {
    let mut missing: Vec<String> = Vec::new();

    for artifact in required_artifacts(ide) {
        let command = existence_command(artifact.path);
        match host.exec(&command, CHECK_TIMEOUT).await {
            Ok(output) if output.success() && !output.stdout.contains("missing") => {
                console.info(&format!("[verify] OK: {}", artifact.description));
            }
            Ok(_) => {
                missing.push(format!("{}: {}", artifact.description, artifact.path));
                console.info(&format!(
                    "[verify] MISSING: {} at {}",
                    artifact.description, artifact.path
                ));
            }
            Err(err) => {
                missing.push(format!(
                    "{}: {} (check failed: {err})",
                    artifact.description, artifact.path
                ));
                console.info(&format!(
                    "[verify] ERROR checking {}: {err}",
                    artifact.description
                ));
            }
        }
    }

    let extensions_dir = ide.extensions_dir();
    match host
        .exec(&extension_check_command(extensions_dir), CHECK_TIMEOUT)
        .await
    {
        Ok(output) if output.success() && output.stdout.contains("found") => {
            console.info("[verify] OK: workspace IDE extension");
        }
        Ok(_) => {
            missing.push(format!(
                "workspace IDE extension: not found in {extensions_dir}"
            ));
            console.info(&format!(
                "[verify] MISSING: workspace IDE extension in {extensions_dir}"
            ));
        }
        Err(err) => {
            missing.push(format!("workspace IDE extension: check failed ({err})"));
            console.info(&format!("[verify] ERROR checking IDE extension: {err}"));
        }
    }

    if !missing.is_empty() {
        return Err(VerifyError { missing });
    }
    console.info("[verify] All critical artifacts verified successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_artifacts_follow_ide_choice() {
        let coder = required_artifacts(IdeProvider::Coder);
        assert!(coder
            .iter()
            .any(|check| check.path == "/app/code-server/bin/code-server"));
        let cmux = required_artifacts(IdeProvider::CmuxCode);
        assert!(cmux
            .iter()
            .any(|check| check.path == "/app/cmux-code/bin/code-server-oss"));
        assert!(cmux
            .iter()
            .any(|check| check.path == "/root/.vscode-server-oss/extensions"));
    }

    #[test]
    fn test_required_artifacts_always_include_common_stack() {
        for ide in [IdeProvider::Openvscode, IdeProvider::Coder, IdeProvider::CmuxCode] {
            let paths: Vec<&str> = required_artifacts(ide).iter().map(|check| check.path).collect();
            for expected in [
                "/root/.nvm/nvm.sh",
                "/usr/local/cargo/bin/cargo",
                "/usr/local/go/bin/go",
                "/root/.bun/bin/bun",
                "/builtins/build/index.js",
                "/usr/local/bin/worker-daemon",
                "/usr/local/bin/cmux-token-init",
            ] {
                assert!(paths.contains(&expected), "{ide}: missing {expected}");
            }
        }
    }

    #[test]
    fn test_existence_command_is_exit_zero_either_way() {
        let command = existence_command("/root/.bun/bin/bun");
        assert_eq!(
            command,
            "test -e /root/.bun/bin/bun && echo exists || echo missing"
        );
    }

    #[test]
    fn test_extension_check_greps_for_marker() {
        let command = extension_check_command("/root/.vscode-server-oss/extensions");
        assert!(command.contains("grep -q cmux"));
        assert!(command.contains("/root/.vscode-server-oss/extensions"));
    }
}
