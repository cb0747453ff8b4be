//! Repository upload and workspace configuration tasks.

use std::sync::Arc;

use crate::engine::context::TaskContext;
use crate::engine::TaskFuture;
use crate::upload;

pub(super) fn upload_repo(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move { upload::sync_repo(&ctx).await })
}

pub(super) fn install_repo_dependencies(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
cd {repo}
bun install --frozen-lockfile"#,
            repo = ctx.remote_repo_root
        );
        ctx.run("install-repo-dependencies", &cmd).await?;
        Ok(())
    })
}

pub(super) fn configure_zsh(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
cp {repo}/configs/zshrc /root/.zshrc
chsh -s /usr/bin/zsh root
mkdir -p /root/.config
echo 'export PATH="/root/.local/bin:/root/.bun/bin:$PATH"' >> /root/.zshrc"#,
            repo = ctx.remote_repo_root
        );
        ctx.run("configure-zsh", &cmd).await?;
        Ok(())
    })
}

pub(super) fn install_service_scripts(ctx: Arc<TaskContext>) -> TaskFuture {
    Box::pin(async move {
        let cmd = format!(
            r#"set -euo pipefail
install -m 0755 {repo}/configs/scripts/start-vnc.sh /usr/local/bin/start-vnc
install -m 0755 {repo}/configs/scripts/cmux-token-init.sh /usr/local/bin/cmux-token-init
install -m 0755 {repo}/configs/scripts/start-xterm.sh /usr/local/bin/start-xterm"#,
            repo = ctx.remote_repo_root
        );
        ctx.run("install-service-scripts", &cmd).await?;
        Ok(())
    })
}
