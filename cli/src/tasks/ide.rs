//! IDE server and extension tasks.
//!
//! All three IDE install tasks are always registered (the extensions task
//! depends on them); the two not matching the run's IDE choice skip
//! themselves.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::context::TaskContext;
use crate::engine::TaskFuture;
use crate::ide::IdeProvider;

const IDE_INSTALL_TIMEOUT: Duration = Duration::from_secs(1200);

/// Extensions preinstalled into every workspace IDE.
const LANGUAGE_EXTENSIONS: &[&str] = &[
    "rust-lang.rust-analyzer",
    "golang.go",
    "ms-python.python",
    "dbaeumer.vscode-eslint",
    "esbenp.prettier-vscode",
];

fn skip_note(ctx: &TaskContext, label: &str, wanted: IdeProvider) -> bool {
    if ctx.ide_provider == wanted {
        return false;
    }
    ctx.console.info(&format!(
        "[{label}] skipped (IDE provider is {})",
        ctx.ide_provider
    ));
    true
}

pub(super) fn install_openvscode(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        if skip_note(&ctx, "install-openvscode", IdeProvider::Openvscode) {
            return Ok(());
        }
        let cmd = r#"set -eux
OPENVSCODE_VERSION="1.93.1"
arch="$(uname -m)"
case "${arch}" in
  x86_64) ov_arch="x64" ;;
  aarch64|arm64) ov_arch="arm64" ;;
  *) echo "Unsupported architecture: ${arch}" >&2; exit 1 ;;
esac
mkdir -p /app
curl -fsSL -o /tmp/openvscode.tar.gz \
  "https://github.com/gitpod-io/openvscode-server/releases/download/openvscode-server-v${OPENVSCODE_VERSION}/openvscode-server-v${OPENVSCODE_VERSION}-linux-${ov_arch}.tar.gz"
rm -rf /app/openvscode-server
tar -xzf /tmp/openvscode.tar.gz -C /app
mv "/app/openvscode-server-v${OPENVSCODE_VERSION}-linux-${ov_arch}" /app/openvscode-server
rm -f /tmp/openvscode.tar.gz
/app/openvscode-server/bin/openvscode-server --version"#;
        ctx.run_with_timeout("install-openvscode", cmd, IDE_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn install_coder(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        if skip_note(&ctx, "install-coder", IdeProvider::Coder) {
            return Ok(());
        }
        let cmd = r#"set -eux
mkdir -p /app/code-server
curl -fsSL https://code-server.dev/install.sh \
  | sh -s -- --method standalone --prefix /app/code-server
/app/code-server/bin/code-server --version"#;
        ctx.run_with_timeout("install-coder", cmd, IDE_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn install_cmux_code(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        if skip_note(&ctx, "install-cmux-code", IdeProvider::CmuxCode) {
            return Ok(());
        }
        let cmd = format!(
            r#"set -eux
arch="$(uname -m)"
case "${{arch}}" in
  x86_64) code_arch="x64" ;;
  aarch64|arm64) code_arch="arm64" ;;
  *) echo "Unsupported architecture: ${{arch}}" >&2; exit 1 ;;
esac
CODE_VERSION="$(jq -r '."cmux-code"' {repo}/configs/ide-deps.json)"
mkdir -p /app
curl -fsSL -o /tmp/cmux-code.tar.gz \
  "https://github.com/manaflow-ai/cmux-code/releases/download/v${{CODE_VERSION}}/cmux-code-reh-web-linux-${{code_arch}}-${{CODE_VERSION}}.tar.gz"
rm -rf /app/cmux-code
mkdir -p /app/cmux-code
tar -xzf /tmp/cmux-code.tar.gz -C /app/cmux-code --strip-components=1
rm -f /tmp/cmux-code.tar.gz
test -x /app/cmux-code/bin/code-server-oss"#,
            repo = ctx.remote_repo_root
        );
        ctx.run_with_timeout("install-cmux-code", &cmd, IDE_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn package_vscode_extension(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
cd {repo}/packages/vscode-extension
bun install --frozen-lockfile
bun run package
ls -la *.vsix"#,
            repo = ctx.remote_repo_root
        );
        ctx.run("package-vscode-extension", &cmd).await?;
        Ok(())
    })
}

pub(super) fn install_ide_extensions(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let (binary, extensions_dir) = (
            ctx.ide_provider.binary_path(),
            ctx.ide_provider.extensions_dir(),
        );
        let marketplace = LANGUAGE_EXTENSIONS.join(" ");
        let cmd = format!(
            r#"set -euo pipefail
mkdir -p {extensions_dir}
for ext in {marketplace}; do
  {binary} --extensions-dir {extensions_dir} --install-extension "$ext" || {{
    echo "retrying $ext" >&2
    {binary} --extensions-dir {extensions_dir} --install-extension "$ext"
  }}
done
vsix="$(ls {repo}/packages/vscode-extension/*.vsix | head -n 1)"
{binary} --extensions-dir {extensions_dir} --install-extension "$vsix"
ls {extensions_dir}"#,
            repo = ctx.remote_repo_root
        );
        ctx.run_with_timeout("install-ide-extensions", &cmd, IDE_INSTALL_TIMEOUT)
            .await?;
        Ok(())
    })
}

pub(super) fn install_global_cli(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = r#"set -euo pipefail
export BUN_INSTALL=/root/.bun
bun install -g @anthropic-ai/claude-code @openai/codex opencode-ai
ln -sf /root/.bun/bin/claude /usr/local/bin/claude || true
ln -sf /root/.bun/bin/codex /usr/local/bin/codex || true
ln -sf /root/.bun/bin/opencode /usr/local/bin/opencode || true"#;
        ctx.run("install-global-cli", cmd).await?;
        Ok(())
    })
}
